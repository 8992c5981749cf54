//! Encrypted storage core for Medvault
//!
//! Protects personal health information at rest and in transit between
//! installations.
//!
//! ## Security Features
//!
//! - **Field Encryption**: AES-256-GCM per sensitive column, PBKDF2-HMAC-SHA256 keys
//!   with a fresh salt and IV for every value
//! - **Typed Whitelist**: each record kind names its own sensitive columns
//! - **Encrypted Backups**: whole-database AES-256-GCM files with age-based retention
//! - **Portable Export**: password-protected archive of every table, scrypt KDF
//! - **Transactional Import**: merge or replace, all-or-nothing
//! - **Secret Bootstrap**: environment, secrets file, or generated with explicit
//!   ephemeral state

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod config;
pub mod database;
pub mod encryption;
pub mod error;
pub mod models;
pub mod phi_transfer;
pub mod record_codec;
pub mod security;

pub use backup::{
    backup_file_name, cleanup_old_backups, cleanup_old_backups_at, list_backups, BackupArchiver,
    BackupCycle, BACKUP_EXTENSION, DEFAULT_RETENTION_DAYS,
};
pub use config::{
    default_data_dir, Bootstrap, JwtSecret, SecretName, SecretOrigin, SecretStatus,
    SecretsConfig, SECRETS_FILE_NAME,
};
pub use encryption::FieldCipher;
pub use error::{Error, Result, WRONG_KEY_MESSAGE, WRONG_PASSWORD_MESSAGE};
pub use models::*;
pub use phi_transfer::{
    export_encrypted, export_encrypted_async, export_file_name, import_encrypted,
    import_encrypted_async,
};
pub use record_codec::{DecryptOutcome, Record, RecordCodec, RecordKind};
pub use security::{HexSecret, TransferPassword};

use std::io::Write;
use std::path::Path;

/// Run a blocking storage operation on the tokio blocking pool.
pub(crate) async fn run_blocking<T, F>(operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

/// Write `parts` to a temporary file next to `dest`, then rename it into place.
///
/// The temporary file is created with owner-only permissions on Unix.
pub(crate) fn write_atomically(dest: &Path, parts: &[&[u8]]) -> Result<()> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    for part in parts {
        file.write_all(part)?;
    }
    file.as_file().sync_all()?;
    file.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
