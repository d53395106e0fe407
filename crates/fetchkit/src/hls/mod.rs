// HLS support: playlist parsing, segment download, and decryption.

pub mod cipher;
pub mod error;
pub mod playlist;
pub mod segmented;

pub use cipher::CipherError;
pub use error::HlsError;
pub use playlist::PlaylistParser;
pub use segmented::{HttpSegmentSource, SegmentSource, SegmentedDownloader};
