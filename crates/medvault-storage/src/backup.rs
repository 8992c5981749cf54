//! Encrypted whole-database backups
//!
//! Backup files use the layout
//!
//! ```text
//! iv[16] | ciphertext[N] | tag[16]
//! ```
//!
//! encrypted with AES-256-GCM under the backup secret. Files are written to a
//! temporary sibling and renamed into place, so neither a backup nor a restore
//! ever leaves a half-written destination behind.

use crate::encryption::{open_in_place, seal_in_place};
use crate::error::WRONG_KEY_MESSAGE;
use crate::models::BackupEntry;
use crate::security::{generate_iv, HexSecret, AUTH_TAG_LENGTH, IV_LENGTH, KEY_LENGTH};
use crate::{run_blocking, write_atomically, Error, Result};
use chrono::NaiveDate;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};
use zeroize::Zeroizing;

/// File extension of encrypted backups
pub const BACKUP_EXTENSION: &str = ".db.enc";

/// Default retention window in days
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

const MIN_BACKUP_LENGTH: usize = IV_LENGTH + AUTH_TAG_LENGTH;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Result of a scheduled backup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCycle {
    /// Backup written by this run
    pub backup: PathBuf,
    /// Expired backups removed afterwards
    pub deleted: usize,
}

/// Creates and restores encrypted database backups.
#[derive(Clone)]
pub struct BackupArchiver {
    key: Zeroizing<[u8; KEY_LENGTH]>,
}

impl fmt::Debug for BackupArchiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackupArchiver(<redacted>)")
    }
}

impl BackupArchiver {
    /// Create an archiver keyed with the backup secret.
    pub fn new(secret: &HexSecret) -> Result<Self> {
        Ok(Self {
            key: secret.key_bytes()?,
        })
    }

    /// Encrypt the file at `source` into `dest`.
    ///
    /// The whole source file is held in memory while it is encrypted.
    pub fn create_encrypted_backup<S, D>(&self, source: S, dest: D) -> Result<PathBuf>
    where
        S: AsRef<Path>,
        D: AsRef<Path>,
    {
        let source = source.as_ref();
        let dest = dest.as_ref();

        let mut buffer = Zeroizing::new(fs::read(source)?);

        let iv = generate_iv();
        let tag = seal_in_place(&self.key, &iv, buffer.as_mut_slice())?;
        write_atomically(dest, &[&iv[..], buffer.as_slice(), &tag[..]])?;

        let size = fs::metadata(dest)?.len();
        info!(
            source = %source.display(),
            backup = %dest.display(),
            size_kb = size as f64 / 1024.0,
            "Encrypted backup created"
        );
        Ok(dest.to_path_buf())
    }

    /// Decrypt the backup at `encrypted` into `dest`.
    ///
    /// `dest` is untouched unless the whole file authenticates.
    pub fn restore_encrypted_backup<S, D>(&self, encrypted: S, dest: D) -> Result<PathBuf>
    where
        S: AsRef<Path>,
        D: AsRef<Path>,
    {
        let encrypted = encrypted.as_ref();
        let dest = dest.as_ref();

        let data = fs::read(encrypted)?;
        if data.len() < MIN_BACKUP_LENGTH {
            return Err(Error::Authentication(WRONG_KEY_MESSAGE));
        }

        let (iv, rest) = data.split_at(IV_LENGTH);
        let (ciphertext, tag) = rest.split_at(rest.len() - AUTH_TAG_LENGTH);
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        open_in_place(&self.key, iv, tag, buffer.as_mut_slice(), WRONG_KEY_MESSAGE)?;

        write_atomically(dest, &[buffer.as_slice()])?;
        info!(
            backup = %encrypted.display(),
            restored = %dest.display(),
            "Backup restored"
        );
        Ok(dest.to_path_buf())
    }

    /// [`create_encrypted_backup`](Self::create_encrypted_backup) on the blocking pool
    pub async fn create_encrypted_backup_async(
        &self,
        source: PathBuf,
        dest: PathBuf,
    ) -> Result<PathBuf> {
        let archiver = self.clone();
        run_blocking(move || archiver.create_encrypted_backup(&source, &dest)).await
    }

    /// [`restore_encrypted_backup`](Self::restore_encrypted_backup) on the blocking pool
    pub async fn restore_encrypted_backup_async(
        &self,
        encrypted: PathBuf,
        dest: PathBuf,
    ) -> Result<PathBuf> {
        let archiver = self.clone();
        run_blocking(move || archiver.restore_encrypted_backup(&encrypted, &dest)).await
    }

    /// Back up `db_path` into `backup_dir` as `health_<date>.db.enc`, then
    /// apply retention.
    ///
    /// Failures are logged and returned to the scheduler.
    pub fn run_backup_cycle<S, D>(
        &self,
        db_path: S,
        backup_dir: D,
        retention_days: u64,
    ) -> Result<BackupCycle>
    where
        S: AsRef<Path>,
        D: AsRef<Path>,
    {
        let backup_dir = backup_dir.as_ref();
        let name = backup_file_name(chrono::Local::now().date_naive());

        let result = self
            .create_encrypted_backup(db_path, backup_dir.join(name))
            .and_then(|backup| {
                let deleted = cleanup_old_backups(backup_dir, retention_days)?;
                Ok(BackupCycle { backup, deleted })
            });

        if let Err(e) = &result {
            error!(dir = %backup_dir.display(), error = %e, "Scheduled backup failed");
        }
        result
    }

    /// [`run_backup_cycle`](Self::run_backup_cycle) on the blocking pool
    pub async fn run_backup_cycle_async(
        &self,
        db_path: PathBuf,
        backup_dir: PathBuf,
        retention_days: u64,
    ) -> Result<BackupCycle> {
        let archiver = self.clone();
        run_blocking(move || archiver.run_backup_cycle(&db_path, &backup_dir, retention_days))
            .await
    }
}

/// Daily backup file name, e.g. `health_2024-05-01.db.enc`
pub fn backup_file_name(date: NaiveDate) -> String {
    format!("health_{}{}", date.format("%Y-%m-%d"), BACKUP_EXTENSION)
}

fn is_backup_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(BACKUP_EXTENSION))
        .unwrap_or(false)
}

/// Delete backups older than `retention_days`. Returns the number deleted.
pub fn cleanup_old_backups<P: AsRef<Path>>(dir: P, retention_days: u64) -> Result<usize> {
    cleanup_old_backups_at(dir, retention_days, SystemTime::now())
}

/// Delete backups whose age at `now` is strictly greater than the window.
pub fn cleanup_old_backups_at<P: AsRef<Path>>(
    dir: P,
    retention_days: u64,
    now: SystemTime,
) -> Result<usize> {
    let dir = dir.as_ref();
    if !dir.exists() {
        debug!(dir = %dir.display(), "Backup directory missing, nothing to clean up");
        return Ok(0);
    }

    let window = Duration::from_secs(retention_days.saturating_mul(SECONDS_PER_DAY));
    let mut deleted = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if !metadata.is_file() || !is_backup_file(&path) {
            continue;
        }

        // Files stamped in the future have age zero
        let age = now
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        if age > window {
            fs::remove_file(&path)?;
            info!(
                file = %path.display(),
                age_days = age.as_secs() / SECONDS_PER_DAY,
                "Deleted expired backup"
            );
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// Encrypted backups in `dir`, newest first
pub fn list_backups<P: AsRef<Path>>(dir: P) -> Result<Vec<BackupEntry>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if !metadata.is_file() || !is_backup_file(&path) {
            continue;
        }
        backups.push(BackupEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            size: metadata.len(),
            modified: metadata.modified()?,
        });
    }

    backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(backups)
}
