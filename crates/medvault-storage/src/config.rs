//! Secret bootstrap
//!
//! Each of the three installation secrets is resolved in order from the
//! process environment, the secrets file, and finally fresh generation.
//! Generated secrets are written back to the secrets file when one is
//! configured; otherwise they only live for this process and are reported as
//! ephemeral.

use crate::backup::BackupArchiver;
use crate::encryption::FieldCipher;
use crate::record_codec::RecordCodec;
use crate::security::{generate_hex_secret, HexSecret};
use crate::{write_atomically, Error, Result};
use aes_gcm::aead::OsRng;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// File name of the persisted secrets inside the data directory
pub const SECRETS_FILE_NAME: &str = ".app-secrets.json";

/// Minimum length of the JWT signing secret
pub const MIN_JWT_SECRET_LENGTH: usize = 32;

/// The installation secrets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecretName {
    /// Record-field encryption secret
    FieldKey,
    /// JWT signing secret
    JwtSecret,
    /// Backup encryption secret
    BackupKey,
}

impl SecretName {
    /// All secrets, in resolution order
    pub const ALL: [SecretName; 3] = [
        SecretName::FieldKey,
        SecretName::JwtSecret,
        SecretName::BackupKey,
    ];

    /// Environment variable and secrets-file key
    pub fn env_var(&self) -> &'static str {
        match self {
            SecretName::FieldKey => "DB_ENCRYPTION_KEY",
            SecretName::JwtSecret => "JWT_SECRET",
            SecretName::BackupKey => "BACKUP_ENCRYPTION_KEY",
        }
    }

    /// Human description
    pub fn description(&self) -> &'static str {
        match self {
            SecretName::FieldKey => "Database field encryption key (AES-256)",
            SecretName::JwtSecret => "JWT signing key",
            SecretName::BackupKey => "Backup encryption key (AES-256)",
        }
    }

    fn index(&self) -> usize {
        match self {
            SecretName::FieldKey => 0,
            SecretName::JwtSecret => 1,
            SecretName::BackupKey => 2,
        }
    }

    fn generate(&self) -> Zeroizing<String> {
        match self {
            SecretName::JwtSecret => {
                let mut bytes = Zeroizing::new([0u8; 64]);
                OsRng.fill_bytes(&mut *bytes);
                Zeroizing::new(STANDARD.encode(*bytes))
            }
            SecretName::FieldKey | SecretName::BackupKey => generate_hex_secret(),
        }
    }
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_var())
    }
}

/// Where a resolved secret came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretOrigin {
    /// Process environment
    Environment,
    /// Secrets file at the given path
    SecretsFile(PathBuf),
    /// Generated at startup; `persisted_to` is `None` when the secret was not
    /// saved and dies with the process
    Generated {
        /// File the secret was written to
        persisted_to: Option<PathBuf>,
    },
}

impl SecretOrigin {
    /// True for a generated secret that was not persisted
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, SecretOrigin::Generated { persisted_to: None })
    }
}

/// JWT signing secret
#[derive(Clone)]
pub struct JwtSecret(Zeroizing<String>);

impl JwtSecret {
    /// Validate the minimum length
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = Zeroizing::new(value.into());
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::Configuration("JWT_SECRET not configured".to_string()));
        }
        if trimmed.len() < MIN_JWT_SECRET_LENGTH {
            return Err(Error::Configuration(format!(
                "JWT_SECRET too short ({} chars, need {})",
                trimmed.len(),
                MIN_JWT_SECRET_LENGTH
            )));
        }
        Ok(Self(Zeroizing::new(trimmed.to_string())))
    }

    /// Secret text
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JwtSecret(<redacted>)")
    }
}

/// One line of the configuration report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretStatus {
    /// Secret
    pub name: SecretName,
    /// Where it came from
    pub origin: SecretOrigin,
}

impl fmt::Display for SecretStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            SecretOrigin::Environment => write!(f, "{}: configured (environment)", self.name),
            SecretOrigin::SecretsFile(path) => {
                write!(f, "{}: configured ({})", self.name, path.display())
            }
            SecretOrigin::Generated {
                persisted_to: Some(path),
            } => write!(f, "{}: generated, saved to {}", self.name, path.display()),
            SecretOrigin::Generated { persisted_to: None } => write!(
                f,
                "{}: generated, NOT saved (data encrypted with it is lost on restart)",
                self.name
            ),
        }
    }
}

/// Validated installation secrets
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    field_key: HexSecret,
    jwt_secret: JwtSecret,
    backup_key: HexSecret,
    /// Indexed by `SecretName::index`
    origins: Vec<(SecretName, SecretOrigin)>,
}

impl SecretsConfig {
    /// Record-field secret
    pub fn field_key(&self) -> &HexSecret {
        &self.field_key
    }

    /// JWT signing secret
    pub fn jwt_secret(&self) -> &JwtSecret {
        &self.jwt_secret
    }

    /// Backup secret
    pub fn backup_key(&self) -> &HexSecret {
        &self.backup_key
    }

    /// Origin of `name`
    pub fn origin(&self, name: SecretName) -> &SecretOrigin {
        &self.origins[name.index()].1
    }

    fn expose(&self, name: SecretName) -> &str {
        match name {
            SecretName::FieldKey => self.field_key.expose(),
            SecretName::JwtSecret => self.jwt_secret.expose(),
            SecretName::BackupKey => self.backup_key.expose(),
        }
    }

    /// True when any secret exists only in memory
    pub fn is_ephemeral(&self) -> bool {
        self.origins.iter().any(|(_, origin)| origin.is_ephemeral())
    }

    /// Per-secret status lines
    pub fn report(&self) -> Vec<SecretStatus> {
        self.origins
            .iter()
            .map(|(name, origin)| SecretStatus {
                name: *name,
                origin: origin.clone(),
            })
            .collect()
    }

    /// Field cipher keyed with the record-field secret
    pub fn field_cipher(&self) -> FieldCipher {
        FieldCipher::new(self.field_key.clone())
    }

    /// Record codec keyed with the record-field secret
    pub fn record_codec(&self) -> RecordCodec {
        RecordCodec::new(self.field_cipher())
    }

    /// Backup archiver keyed with the backup secret
    pub fn backup_archiver(&self) -> Result<BackupArchiver> {
        BackupArchiver::new(&self.backup_key)
    }
}

/// Contents of the secrets file
#[derive(Default, Serialize, Deserialize)]
struct SecretsFile {
    #[serde(rename = "JWT_SECRET", default, skip_serializing_if = "Option::is_none")]
    jwt_secret: Option<String>,
    #[serde(rename = "DB_ENCRYPTION_KEY", default, skip_serializing_if = "Option::is_none")]
    db_encryption_key: Option<String>,
    #[serde(rename = "BACKUP_ENCRYPTION_KEY", default, skip_serializing_if = "Option::is_none")]
    backup_encryption_key: Option<String>,
}

impl SecretsFile {
    fn slot(&mut self, name: SecretName) -> &mut Option<String> {
        match name {
            SecretName::FieldKey => &mut self.db_encryption_key,
            SecretName::JwtSecret => &mut self.jwt_secret,
            SecretName::BackupKey => &mut self.backup_encryption_key,
        }
    }

    fn get(&self, name: SecretName) -> Option<&str> {
        match name {
            SecretName::FieldKey => self.db_encryption_key.as_deref(),
            SecretName::JwtSecret => self.jwt_secret.as_deref(),
            SecretName::BackupKey => self.backup_encryption_key.as_deref(),
        }
    }
}

impl Drop for SecretsFile {
    fn drop(&mut self) {
        self.jwt_secret.zeroize();
        self.db_encryption_key.zeroize();
        self.backup_encryption_key.zeroize();
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves [`SecretsConfig`] at startup.
pub struct Bootstrap {
    env: EnvLookup,
    secrets_file: Option<PathBuf>,
    generate_missing: bool,
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrap")
            .field("secrets_file", &self.secrets_file)
            .field("generate_missing", &self.generate_missing)
            .finish_non_exhaustive()
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl Bootstrap {
    /// Read the process environment, no secrets file, generate missing secrets.
    pub fn new() -> Self {
        Self {
            env: Box::new(|key: &str| std::env::var(key).ok()),
            secrets_file: None,
            generate_missing: true,
        }
    }

    /// Replace the environment lookup
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    /// Read and persist secrets at `path`
    pub fn with_secrets_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.secrets_file = Some(path.into());
        self
    }

    /// Use `.app-secrets.json` in the default data directory
    pub fn with_default_secrets_file(self) -> Result<Self> {
        Ok(self.with_secrets_file(default_data_dir()?.join(SECRETS_FILE_NAME)))
    }

    /// Whether absent secrets are generated (default) or refused
    pub fn generate_missing(mut self, generate: bool) -> Self {
        self.generate_missing = generate;
        self
    }

    /// Resolve and validate all three secrets.
    ///
    /// Nothing is written unless every secret is valid.
    pub fn resolve(&self) -> Result<SecretsConfig> {
        let mut file = match &self.secrets_file {
            Some(path) => load_secrets_file(path)?,
            None => None,
        };
        let loaded_from_file = file.is_some();

        let mut field_key = None;
        let mut jwt_secret = None;
        let mut backup_key = None;
        let mut origins = Vec::with_capacity(SecretName::ALL.len());

        for name in SecretName::ALL {
            let from_env = (self.env)(name.env_var())
                .map(Zeroizing::new)
                .filter(|v| !v.trim().is_empty());
            let from_file = file
                .as_ref()
                .and_then(|f| f.get(name))
                .filter(|v| !v.trim().is_empty());

            let (value, origin) = if let Some(value) = from_env {
                (value, SecretOrigin::Environment)
            } else if let Some(value) = from_file {
                let path = self.secrets_file.clone().unwrap_or_default();
                (Zeroizing::new(value.to_string()), SecretOrigin::SecretsFile(path))
            } else if self.generate_missing {
                (name.generate(), SecretOrigin::Generated { persisted_to: None })
            } else {
                return Err(Error::Configuration(format!(
                    "Missing {} - {}",
                    name,
                    name.description()
                )));
            };

            match name {
                SecretName::FieldKey => {
                    field_key = Some(HexSecret::new(name.env_var(), value.as_str())?)
                }
                SecretName::JwtSecret => jwt_secret = Some(JwtSecret::new(value.as_str())?),
                SecretName::BackupKey => {
                    backup_key = Some(HexSecret::new(name.env_var(), value.as_str())?)
                }
            }
            origins.push((name, origin));
        }

        let missing = |name: SecretName| Error::Configuration(format!("{} not configured", name));
        let mut config = SecretsConfig {
            field_key: field_key.ok_or_else(|| missing(SecretName::FieldKey))?,
            jwt_secret: jwt_secret.ok_or_else(|| missing(SecretName::JwtSecret))?,
            backup_key: backup_key.ok_or_else(|| missing(SecretName::BackupKey))?,
            origins,
        };

        let generated: Vec<SecretName> = config
            .origins
            .iter()
            .filter(|(_, origin)| matches!(origin, SecretOrigin::Generated { .. }))
            .map(|(name, _)| *name)
            .collect();

        if let (Some(path), false) = (&self.secrets_file, generated.is_empty()) {
            let contents = file.get_or_insert_with(SecretsFile::default);
            for name in &generated {
                *contents.slot(*name) = Some(config.expose(*name).to_string());
            }
            match save_secrets_file(path, contents) {
                Ok(()) => {
                    info!(path = %path.display(), created = !loaded_from_file, "Saved app secrets");
                    for (name, origin) in config.origins.iter_mut() {
                        if generated.contains(name) {
                            *origin = SecretOrigin::Generated {
                                persisted_to: Some(path.clone()),
                            };
                        }
                    }
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to save app secrets");
                }
            }
        }

        for (name, origin) in &config.origins {
            if origin.is_ephemeral() {
                warn!(
                    secret = %name,
                    "Secret generated for this process only; data encrypted with it cannot be read after a restart"
                );
            }
        }

        Ok(config)
    }
}

/// Default per-user data directory
pub fn default_data_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("org", "medvault", "medvault")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| Error::Configuration("Could not determine a data directory".to_string()))
}

fn load_secrets_file(path: &Path) -> Result<Option<SecretsFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = Zeroizing::new(fs::read_to_string(path)?);
    let file = serde_json::from_str(&text).map_err(|e| {
        Error::Configuration(format!(
            "Secrets file {} is not valid JSON: {}",
            path.display(),
            e
        ))
    })?;
    info!(path = %path.display(), "Loaded existing app secrets");
    Ok(Some(file))
}

fn save_secrets_file(path: &Path, contents: &SecretsFile) -> Result<()> {
    let json = Zeroizing::new(serde_json::to_vec_pretty(contents)?);
    write_atomically(path, &[json.as_slice()])?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
