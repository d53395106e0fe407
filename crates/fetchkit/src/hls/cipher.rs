//! AES-128-CBC segment decryption with HLS-style IV derivation.
//!
//! HLS reuses one key/IV pair across every segment of a playlist and
//! distinguishes segments by mixing the media-sequence number into the IV.
//! The functions here are stateless; the segmented downloader calls them
//! once per staged segment.

use aes::Aes128;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, KeyIvInit};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size; also the exact length required of keys and IVs.
pub const BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("decryption key must be {BLOCK_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("initialization vector must be {BLOCK_SIZE} bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("segment is empty, nothing to decrypt")]
    EmptySegment,
    #[error("ciphertext length {0} is not a multiple of the cipher block size")]
    UnalignedCiphertext(usize),
    #[error("invalid PKCS#7 padding")]
    InvalidPadding,
}

/// Derives the IV for one segment by adding its absolute media-sequence
/// number onto the base IV, treating the IV as a 128-bit big-endian integer.
///
/// The sequence number enters as a 32-bit big-endian value in the last four
/// bytes; a carry out of byte 12 keeps propagating through bytes 11..0.
pub fn derive_iv(base_iv: &[u8; BLOCK_SIZE], sequence: u64) -> [u8; BLOCK_SIZE] {
    let mut iv = *base_iv;
    let seq = (sequence & 0xffff_ffff) as u32;

    let mut carry = 0u16;
    for (i, &byte) in seq.to_be_bytes().iter().rev().enumerate() {
        let idx = BLOCK_SIZE - 1 - i;
        let sum = iv[idx] as u16 + byte as u16 + carry;
        iv[idx] = sum as u8;
        carry = sum >> 8;
    }

    let mut idx = BLOCK_SIZE - 5;
    while carry > 0 {
        let sum = iv[idx] as u16 + carry;
        iv[idx] = sum as u8;
        carry = sum >> 8;
        if idx == 0 {
            break;
        }
        idx -= 1;
    }

    iv
}

/// Decrypts one segment with AES-128-CBC and strips PKCS#7 padding.
///
/// `sequence` is the segment's absolute media-sequence number
/// (playlist base sequence + segment ordinal), fed into [`derive_iv`].
/// Returns a freshly allocated plaintext buffer; the ciphertext is left
/// untouched.
pub fn decrypt_segment(
    key: &[u8],
    base_iv: &[u8],
    sequence: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    if key.len() != BLOCK_SIZE {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    let base_iv: &[u8; BLOCK_SIZE] = base_iv
        .try_into()
        .map_err(|_| CipherError::InvalidIvLength(base_iv.len()))?;
    if ciphertext.is_empty() {
        return Err(CipherError::EmptySegment);
    }
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::UnalignedCiphertext(ciphertext.len()));
    }

    let iv = derive_iv(base_iv, sequence);
    let mut buffer = ciphertext.to_vec();
    let decryptor = Aes128CbcDec::new_from_slices(key, &iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| CipherError::UnalignedCiphertext(ciphertext.len()))?;

    strip_pkcs7(&mut buffer)?;
    Ok(buffer)
}

/// Validates and removes PKCS#7 padding in place.
///
/// The final byte gives the padding length, which must be in `[1, 16]` and
/// not exceed the buffer; every trailing padding byte must equal that
/// length. Anything else is rejected rather than silently truncated.
fn strip_pkcs7(buffer: &mut Vec<u8>) -> Result<(), CipherError> {
    let pad = *buffer.last().ok_or(CipherError::EmptySegment)? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > buffer.len() {
        return Err(CipherError::InvalidPadding);
    }
    if buffer[buffer.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(CipherError::InvalidPadding);
    }
    buffer.truncate(buffer.len() - pad);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::block_padding::Pkcs7;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    const ZERO_IV: [u8; 16] = [0u8; 16];

    #[test]
    fn iv_adds_sequence_into_last_four_bytes() {
        let iv = derive_iv(&ZERO_IV, 1);
        assert_eq!(iv[15], 0x01);
        assert!(iv[..15].iter().all(|&b| b == 0));

        let iv = derive_iv(&ZERO_IV, 256);
        assert_eq!(iv[14], 0x01);
        assert_eq!(iv[15], 0x00);
        assert!(iv[..14].iter().all(|&b| b == 0));

        let iv = derive_iv(&ZERO_IV, 0xffff_ffff);
        assert_eq!(&iv[12..], &[0xff, 0xff, 0xff, 0xff]);
        assert!(iv[..12].iter().all(|&b| b == 0));
    }

    #[test]
    fn iv_carry_propagates_past_byte_twelve() {
        let mut base = ZERO_IV;
        base[12..].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);

        let iv = derive_iv(&base, 1);
        assert_eq!(&iv[12..], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(iv[11], 0x01);

        // A full run of 0xff carries all the way through byte 0 and drops
        // the final carry, like 128-bit wrapping addition would.
        let iv = derive_iv(&[0xff; 16], 1);
        assert_eq!(iv, [0x00; 16]);
    }

    #[test]
    fn rejects_bad_key_iv_and_ciphertext_shapes() {
        let data = [0u8; 16];
        assert_eq!(
            decrypt_segment(&[0u8; 15], &ZERO_IV, 0, &data),
            Err(CipherError::InvalidKeyLength(15))
        );
        assert_eq!(
            decrypt_segment(&[0u8; 16], &[0u8; 8], 0, &data),
            Err(CipherError::InvalidIvLength(8))
        );
        assert_eq!(
            decrypt_segment(&[0u8; 16], &ZERO_IV, 0, &[]),
            Err(CipherError::EmptySegment)
        );
        assert_eq!(
            decrypt_segment(&[0u8; 16], &ZERO_IV, 0, &[0u8; 20]),
            Err(CipherError::UnalignedCiphertext(20))
        );
    }

    #[test]
    fn padding_validation_table() {
        // Final byte zero.
        let mut buf = vec![0x05u8; 15];
        buf.push(0x00);
        assert_eq!(strip_pkcs7(&mut buf), Err(CipherError::InvalidPadding));

        // Padding length above the block size.
        let mut buf = vec![0x11u8; 32];
        assert_eq!(strip_pkcs7(&mut buf), Err(CipherError::InvalidPadding));

        // Claimed full-block padding but bytes disagree.
        let mut buf = vec![0x10u8; 16];
        buf[0] = 0x01;
        assert_eq!(strip_pkcs7(&mut buf), Err(CipherError::InvalidPadding));

        // Correct five-byte padding on a 32-byte buffer.
        let mut buf = vec![0xaau8; 27];
        buf.extend_from_slice(&[0x05; 5]);
        strip_pkcs7(&mut buf).unwrap();
        assert_eq!(buf.len(), 27);
        assert!(buf.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn decrypts_what_the_encryptor_produced() {
        let key = [0x42u8; 16];
        let base_iv = [0x07u8; 16];
        let sequence = 1234u64;
        let plaintext = b"not quite one block of media payload bytes";

        let iv = derive_iv(&base_iv, sequence);
        let ciphertext = Aes128CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let decrypted = decrypt_segment(&key, &base_iv, sequence, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_sequence_number_corrupts_padding() {
        let key = [0x42u8; 16];
        let base_iv = [0u8; 16];
        let plaintext = vec![0u8; 32];

        let iv = derive_iv(&base_iv, 7);
        let ciphertext = Aes128CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        // CBC's IV only perturbs the first block; the last block, where the
        // padding lives, still decrypts, so the plaintext differs while the
        // padding stays valid for multi-block inputs. Single-block inputs
        // surface the mismatch as a padding error.
        let iv = derive_iv(&base_iv, 8);
        let short = Aes128CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(&[0u8; 4]);
        assert_eq!(
            decrypt_segment(&key, &base_iv, 7, &short),
            Err(CipherError::InvalidPadding)
        );

        let decrypted = decrypt_segment(&key, &base_iv, 8, &ciphertext).unwrap();
        assert_ne!(decrypted, plaintext);
    }
}
