use reqwest::Client;
use tracing::debug;

use crate::{DownloadError, DownloaderConfig};

/// Creates the shared reqwest [`Client`] from a [`DownloaderConfig`].
///
/// The client is the only piece of state shared between operations; it is
/// passed explicitly into every downloader and parser.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }
    if !config.connect_timeout.is_zero() {
        builder = builder.connect_timeout(config.connect_timeout);
    }

    debug!(
        user_agent = %config.user_agent,
        follow_redirects = config.follow_redirects,
        "building HTTP client"
    );
    builder.build().map_err(DownloadError::from)
}
