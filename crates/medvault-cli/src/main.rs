//! Operator CLI for the medvault encrypted store
//!
//! Commands:
//! - Secret validation and key generation
//! - Encrypted backup create / restore / list / retention
//! - Password-protected export and import

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use medvault_storage::{
    cleanup_old_backups, export_encrypted_async, export_file_name, import_encrypted_async,
    list_backups, BackupArchiver, Bootstrap, HexSecret, ImportMode, SecretsConfig,
    DEFAULT_RETENTION_DAYS,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "medvault")]
#[command(about = "Medvault encrypted storage tools", long_about = None)]
struct Cli {
    /// Secrets file (defaults to .app-secrets.json in the data directory)
    #[arg(long, global = true)]
    secrets_file: Option<PathBuf>,

    /// Fail instead of generating secrets that are not configured
    #[arg(long, global = true)]
    no_generate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configured secrets and show where each came from
    CheckConfig,

    /// Print freshly generated secrets in env-file form
    Keygen,

    /// Encrypted database backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Export every table to a password-protected archive
    Export {
        /// Database to export
        #[arg(short, long)]
        db: PathBuf,

        /// Output file (defaults to health-data-export-<timestamp>.enc)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Read the password from this environment variable instead of prompting
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Import a password-protected archive into an existing database
    Import {
        /// Archive to import
        #[arg(short, long)]
        archive: PathBuf,

        /// Target database
        #[arg(short, long)]
        db: PathBuf,

        /// merge (default) or replace
        #[arg(short, long, default_value = "merge")]
        mode: ImportMode,

        /// Read the password from this environment variable instead of prompting
        #[arg(long)]
        password_env: Option<String>,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Encrypt a database file
    Create {
        /// Database to back up
        #[arg(short, long)]
        db: PathBuf,

        /// Encrypted output file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Decrypt a backup into a database file
    Restore {
        /// Encrypted backup
        #[arg(short, long)]
        backup: PathBuf,

        /// Restored database path
        #[arg(short, long)]
        to: PathBuf,
    },

    /// List backups, newest first
    List {
        /// Backup directory
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Delete backups older than the retention window
    Cleanup {
        /// Backup directory
        #[arg(short, long)]
        dir: PathBuf,

        /// Retention window in days
        #[arg(short, long, default_value_t = DEFAULT_RETENTION_DAYS)]
        retention_days: u64,
    },

    /// Create today's backup, then apply retention
    Run {
        /// Database to back up
        #[arg(long)]
        db: PathBuf,

        /// Backup directory
        #[arg(short, long)]
        dir: PathBuf,

        /// Retention window in days
        #[arg(short, long, default_value_t = DEFAULT_RETENTION_DAYS)]
        retention_days: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig => {
            let config = load_config(cli.secrets_file, cli.no_generate)?;
            for status in config.report() {
                println!("{}", status);
            }
            if config.is_ephemeral() {
                warn!("Some secrets were not saved; configure them before storing data");
            }
        }
        Commands::Keygen => {
            for name in ["DB_ENCRYPTION_KEY", "JWT_SECRET", "BACKUP_ENCRYPTION_KEY"] {
                println!("{}={}", name, HexSecret::generate(name).expose());
            }
        }
        Commands::Backup { command } => {
            run_backup(command, cli.secrets_file, cli.no_generate).await?;
        }
        Commands::Export {
            db,
            out,
            password_env,
        } => {
            run_export(db, out, password_env).await?;
        }
        Commands::Import {
            archive,
            db,
            mode,
            password_env,
        } => {
            run_import(archive, db, mode, password_env).await?;
        }
    }

    Ok(())
}

fn load_config(secrets_file: Option<PathBuf>, no_generate: bool) -> anyhow::Result<SecretsConfig> {
    let bootstrap = match secrets_file {
        Some(path) => Bootstrap::new().with_secrets_file(path),
        None => Bootstrap::new().with_default_secrets_file()?,
    };
    Ok(bootstrap.generate_missing(!no_generate).resolve()?)
}

async fn run_backup(
    command: BackupCommands,
    secrets_file: Option<PathBuf>,
    no_generate: bool,
) -> anyhow::Result<()> {
    let archiver = || -> anyhow::Result<BackupArchiver> {
        Ok(load_config(secrets_file.clone(), no_generate)?.backup_archiver()?)
    };

    match command {
        BackupCommands::Create { db, out } => {
            let path = archiver()?.create_encrypted_backup_async(db, out).await?;
            println!("{}", path.display());
        }
        BackupCommands::Restore { backup, to } => {
            let path = archiver()?.restore_encrypted_backup_async(backup, to).await?;
            println!("{}", path.display());
        }
        BackupCommands::List { dir } => {
            for backup in list_backups(&dir)? {
                let modified: chrono::DateTime<chrono::Local> = backup.modified.into();
                println!(
                    "{}  {:>10.2} KB  {}",
                    modified.format("%Y-%m-%d %H:%M:%S"),
                    backup.size as f64 / 1024.0,
                    backup.name
                );
            }
        }
        BackupCommands::Cleanup {
            dir,
            retention_days,
        } => {
            let deleted = cleanup_old_backups(&dir, retention_days)?;
            info!("Deleted {} backup(s) older than {} days", deleted, retention_days);
        }
        BackupCommands::Run {
            db,
            dir,
            retention_days,
        } => {
            let cycle = archiver()?
                .run_backup_cycle_async(db, dir, retention_days)
                .await?;
            println!("{}", cycle.backup.display());
            info!("Removed {} expired backup(s)", cycle.deleted);
        }
    }
    Ok(())
}

async fn run_export(
    db: PathBuf,
    out: Option<PathBuf>,
    password_env: Option<String>,
) -> anyhow::Result<()> {
    let password = read_password(password_env.as_deref(), true)?;
    let out = out.unwrap_or_else(|| {
        PathBuf::from(export_file_name(chrono::Local::now().naive_local()))
    });

    let spinner = spinner("Deriving key and encrypting export...");
    let result = export_encrypted_async(db, password).await;
    spinner.finish_and_clear();

    let archive = result?;
    std::fs::write(&out, &archive)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    info!("Export written to {} ({} bytes)", out.display(), archive.len());
    println!("{}", out.display());
    Ok(())
}

async fn run_import(
    archive: PathBuf,
    db: PathBuf,
    mode: ImportMode,
    password_env: Option<String>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(&archive)
        .with_context(|| format!("Failed to read {}", archive.display()))?;
    let password = read_password(password_env.as_deref(), false)?;

    if mode == ImportMode::Replace {
        warn!("Replace mode: every table in the archive is cleared before import");
    }

    let spinner = spinner("Deriving key and importing archive...");
    let result = import_encrypted_async(bytes, password, db, mode).await;
    spinner.finish_and_clear();

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_password(env_var: Option<&str>, confirm: bool) -> anyhow::Result<String> {
    if let Some(var) = env_var {
        return std::env::var(var).with_context(|| format!("{} is not set", var));
    }

    let password = rpassword::prompt_password("Password: ")?;
    if confirm {
        let again = rpassword::prompt_password("Confirm password: ")?;
        if again != password {
            bail!("Passwords do not match");
        }
    }
    Ok(password)
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
