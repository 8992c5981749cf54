//! Column-level PHI encryption
//!
//! Each sensitive column value is stored as base64 text:
//!
//! ```text
//! base64( salt[32] | iv[16] | tag[16] | ciphertext[N] )
//! ```
//!
//! Every call draws a fresh salt and IV, so identical plaintexts never produce
//! identical blobs. The key is re-derived from the record-field secret and the
//! embedded salt on decrypt.

use crate::error::WRONG_KEY_MESSAGE;
use crate::security::{
    derive_field_key, generate_iv, generate_salt, HexSecret, AUTH_TAG_LENGTH, IV_LENGTH,
    KEY_LENGTH, SALT_LENGTH,
};
use crate::{Error, Result};
use aes_gcm::{
    aead::{consts::U16, AeadInPlace, KeyInit},
    aes::Aes256,
    AesGcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// AES-256-GCM with a 128-bit IV
pub(crate) type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Offset of the ciphertext inside a salted blob
pub(crate) const SALTED_HEADER_LENGTH: usize = SALT_LENGTH + IV_LENGTH + AUTH_TAG_LENGTH;

fn cipher_for(key: &[u8; KEY_LENGTH]) -> Result<Aes256Gcm16> {
    Aes256Gcm16::new_from_slice(key).map_err(|e| Error::Encryption(e.to_string()))
}

/// Encrypt `buffer` in place, returning the detached tag.
pub(crate) fn seal_in_place(
    key: &[u8; KEY_LENGTH],
    iv: &[u8; IV_LENGTH],
    buffer: &mut [u8],
) -> Result<[u8; AUTH_TAG_LENGTH]> {
    let tag = cipher_for(key)?
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(iv), b"", buffer)
        .map_err(|e| Error::Encryption(e.to_string()))?;
    let mut out = [0u8; AUTH_TAG_LENGTH];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Decrypt `buffer` in place after verifying `tag`.
///
/// A tag mismatch is reported as [`Error::Authentication`] with `message`.
pub(crate) fn open_in_place(
    key: &[u8; KEY_LENGTH],
    iv: &[u8],
    tag: &[u8],
    buffer: &mut [u8],
    message: &'static str,
) -> Result<()> {
    if iv.len() != IV_LENGTH || tag.len() != AUTH_TAG_LENGTH {
        return Err(Error::Authentication(message));
    }
    cipher_for(key)?
        .decrypt_in_place_detached(
            Nonce::<U16>::from_slice(iv),
            b"",
            buffer,
            Tag::<U16>::from_slice(tag),
        )
        .map_err(|_| Error::Authentication(message))
}

/// Split a `salt | iv | tag | ciphertext` blob.
pub(crate) fn split_salted(data: &[u8]) -> Option<(&[u8], &[u8], &[u8], &[u8])> {
    if data.len() < SALTED_HEADER_LENGTH {
        return None;
    }
    let (salt, rest) = data.split_at(SALT_LENGTH);
    let (iv, rest) = rest.split_at(IV_LENGTH);
    let (tag, ciphertext) = rest.split_at(AUTH_TAG_LENGTH);
    Some((salt, iv, tag, ciphertext))
}

/// Pack `salt | iv | tag | ciphertext`.
pub(crate) fn pack_salted(
    salt: &[u8; SALT_LENGTH],
    iv: &[u8; IV_LENGTH],
    tag: &[u8; AUTH_TAG_LENGTH],
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut packed = Vec::with_capacity(SALTED_HEADER_LENGTH + ciphertext.len());
    packed.extend_from_slice(salt);
    packed.extend_from_slice(iv);
    packed.extend_from_slice(tag);
    packed.extend_from_slice(ciphertext);
    packed
}

/// Encrypts and decrypts individual column values with the record-field secret.
#[derive(Debug, Clone)]
pub struct FieldCipher {
    secret: HexSecret,
}

impl FieldCipher {
    /// Create a cipher bound to the record-field secret
    pub fn new(secret: HexSecret) -> Self {
        Self { secret }
    }

    /// Encrypt an optional value. `None` and `""` pass through as `None`.
    pub fn encrypt(&self, plaintext: Option<&str>) -> Result<Option<String>> {
        match plaintext {
            Some(text) if !text.is_empty() => self.encrypt_str(text).map(Some),
            _ => Ok(None),
        }
    }

    /// Decrypt an optional blob. `None` and `""` pass through as `None`.
    pub fn decrypt(&self, blob: Option<&str>) -> Result<Option<String>> {
        match blob {
            Some(b) if !b.is_empty() => self.decrypt_str(b).map(Some),
            _ => Ok(None),
        }
    }

    /// Encrypt a value into its base64 storage form
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String> {
        let salt = generate_salt();
        let iv = generate_iv();
        let key = derive_field_key(self.secret.expose(), &salt)?;

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = seal_in_place(&key, &iv, &mut buffer)?;

        Ok(STANDARD.encode(pack_salted(&salt, &iv, &tag, &buffer)))
    }

    /// Decrypt a base64 storage blob
    pub fn decrypt_str(&self, blob: &str) -> Result<String> {
        let combined = STANDARD
            .decode(blob.trim())
            .map_err(|_| Error::Authentication(WRONG_KEY_MESSAGE))?;
        let (salt, iv, tag, ciphertext) =
            split_salted(&combined).ok_or(Error::Authentication(WRONG_KEY_MESSAGE))?;

        let key = derive_field_key(self.secret.expose(), salt)?;
        let mut buffer = ciphertext.to_vec();
        open_in_place(&key, iv, tag, &mut buffer, WRONG_KEY_MESSAGE)?;

        String::from_utf8(buffer)
            .map_err(|_| Error::Encryption("Decrypted field is not valid UTF-8".to_string()))
    }
}
