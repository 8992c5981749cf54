//! Key derivation and secret handling
//!
//! Two derivation paths exist:
//!
//! - **Field keys**: PBKDF2-HMAC-SHA256, 100,000 iterations, fed with the
//!   configured record-field secret and a per-field salt.
//! - **Transfer keys**: scrypt (N=2^14, r=8, p=1), fed with a user password and
//!   a per-export salt. Memory-hard because user passwords are weak.
//!
//! Secrets are always passed in explicitly; nothing here reads the process
//! environment.

use crate::{Error, Result};
use aes_gcm::aead::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// Salt length for every derived key (bytes)
pub const SALT_LENGTH: usize = 32;

/// AES-256 key length (bytes)
pub const KEY_LENGTH: usize = 32;

/// GCM IV length used by every on-disk format (bytes)
pub const IV_LENGTH: usize = 16;

/// GCM authentication tag length (bytes)
pub const AUTH_TAG_LENGTH: usize = 16;

/// PBKDF2 iteration count for field keys
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// scrypt cost parameters for transfer keys: (log2 N, r, p)
pub const SCRYPT_PARAMS: (u8, u32, u32) = (14, 8, 1);

/// Minimum length of a raw hex secret (256 bits)
pub const MIN_HEX_SECRET_LENGTH: usize = 64;

/// Minimum length of a transfer password
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Long-lived hex secret (record-field key or backup key).
///
/// Provisioned once per installation and injected wherever it is needed.
#[derive(Clone)]
pub struct HexSecret {
    name: &'static str,
    value: Zeroizing<String>,
}

impl HexSecret {
    /// Validate and wrap a configured secret.
    pub fn new(name: &'static str, value: impl Into<String>) -> Result<Self> {
        let value = Zeroizing::new(value.into());
        let trimmed = value.trim();

        if trimmed.is_empty() {
            return Err(Error::Configuration(format!("{} not configured", name)));
        }

        if trimmed.len() < MIN_HEX_SECRET_LENGTH {
            return Err(Error::Configuration(format!(
                "{} must be at least {} hex characters (got {})",
                name,
                MIN_HEX_SECRET_LENGTH,
                trimmed.len()
            )));
        }

        if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Configuration(format!(
                "{} must be a hex string",
                name
            )));
        }

        if trimmed.len() % 2 != 0 {
            return Err(Error::Configuration(format!(
                "{} must have an even number of hex characters",
                name
            )));
        }

        Ok(Self {
            name,
            value: Zeroizing::new(trimmed.to_string()),
        })
    }

    /// Wrap an optional secret, failing fast when it is absent.
    pub fn from_optional(name: &'static str, value: Option<&str>) -> Result<Self> {
        match value {
            Some(v) => Self::new(name, v),
            None => Err(Error::Configuration(format!("{} not configured", name))),
        }
    }

    /// Generate a fresh 256-bit secret.
    pub fn generate(name: &'static str) -> Self {
        Self {
            name,
            value: generate_hex_secret(),
        }
    }

    /// Configuration name of this secret
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Secret text, as fed to PBKDF2
    pub fn expose(&self) -> &str {
        &self.value
    }

    /// Raw key material: the first 32 bytes of the hex-decoded secret.
    pub fn key_bytes(&self) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
        let decoded = Zeroizing::new(
            hex::decode(self.value.as_bytes())
                .map_err(|e| Error::Configuration(format!("{} is not valid hex: {}", self.name, e)))?,
        );
        if decoded.len() < KEY_LENGTH {
            return Err(Error::Configuration(format!(
                "{} must decode to at least {} bytes",
                self.name, KEY_LENGTH
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(&decoded[..KEY_LENGTH]);
        Ok(key)
    }
}

impl fmt::Debug for HexSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HexSecret")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Password entered by the user for a single export or import.
///
/// Never persisted.
pub struct TransferPassword(Zeroizing<String>);

impl TransferPassword {
    /// Validate password length
    pub fn new(password: impl Into<String>) -> Result<Self> {
        let password = Zeroizing::new(password.into());
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(Error::Validation(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }
        Ok(Self(password))
    }

    /// Password text
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TransferPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransferPassword(<redacted>)")
    }
}

fn check_salt(salt: &[u8]) -> Result<()> {
    if salt.len() < 16 {
        return Err(Error::Encryption("Salt too short".to_string()));
    }
    Ok(())
}

/// Derive a field key with PBKDF2-HMAC-SHA256.
pub fn derive_field_key(secret: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    if secret.is_empty() {
        return Err(Error::Configuration("Field encryption secret not configured".to_string()));
    }
    check_salt(salt)?;

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ITERATIONS, &mut *key);
    Ok(key)
}

/// Derive a transfer key from a password with scrypt.
pub fn derive_password_key(
    password: &TransferPassword,
    salt: &[u8],
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    check_salt(salt)?;

    let params = scrypt::Params::new(SCRYPT_PARAMS.0, SCRYPT_PARAMS.1, SCRYPT_PARAMS.2, KEY_LENGTH)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    scrypt::scrypt(password.expose().as_bytes(), salt, &params, &mut *key)
        .map_err(|e| Error::Encryption(e.to_string()))?;
    Ok(key)
}

/// Generate secure random salt
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Generate a random GCM IV
pub fn generate_iv() -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Generate a 256-bit secret encoded as 64 hex characters
pub fn generate_hex_secret() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; KEY_LENGTH]);
    OsRng.fill_bytes(&mut *bytes);
    Zeroizing::new(hex::encode(*bytes))
}
