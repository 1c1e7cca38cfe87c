//! filewarden - Secure file lifecycle engine
//!
//! Usage:
//!   filewarden init                       - Create configuration and key salt
//!   filewarden upload <path>              - Encrypt, scan and store a file
//!   filewarden download <id> -o <path>    - Release a stored file
//!   filewarden share <id>                 - Create a share link
//!   filewarden sweep                      - Delete expired files

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use filewarden::{
    config::Config,
    crypto::MasterKey,
    lifecycle::{format_remaining, ExpiryUnit},
    metadata::StoredFile,
    Caller, DownloadOptions, Engine, UploadMeta,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

const PASSPHRASE_ENV: &str = "FILEWARDEN_PASSPHRASE";

#[derive(Parser)]
#[command(name = "filewarden")]
#[command(version)]
#[command(about = "Encrypted, scanned and lifecycle-managed file storage")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/filewarden/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Act as this user
    #[arg(short, long, default_value = "local")]
    user: String,

    /// Act with the administrator role
    #[arg(long)]
    admin: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a configuration and derive the key salt
    Init {
        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Upload a file
    Upload {
        path: PathBuf,

        /// Display name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,

        /// Media type
        #[arg(long, default_value = "application/octet-stream")]
        media_type: String,
    },

    /// Download a file
    Download {
        id: Uuid,

        /// Output path
        #[arg(short, long)]
        output: PathBuf,

        /// Prompt for the lock password
        #[arg(long)]
        password: bool,

        /// Skip the real-time scan (administrators only)
        #[arg(long)]
        skip_scan: bool,
    },

    /// List your files
    List,

    /// Show one file
    Info { id: Uuid },

    /// Delete a file and its ciphertext
    Delete { id: Uuid },

    /// Revoke access to a file
    Revoke {
        id: Uuid,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Restore a revoked file
    Restore { id: Uuid },

    /// Set expiration; zero or less clears it
    Expire {
        id: Uuid,

        #[arg(allow_hyphen_values = true)]
        value: i64,

        /// seconds, minutes, hours or days
        #[arg(long, default_value = "days")]
        unit: String,
    },

    /// Set the download limit; zero clears it
    Limit { id: Uuid, max: u64 },

    /// Lock a file with a password
    Lock { id: Uuid },

    /// Remove a password lock
    Unlock { id: Uuid },

    /// Create a share link
    Share { id: Uuid },

    /// Show what a share token exposes
    ShareInfo { token: String },

    /// Ask the owner for a verification code
    RequestAccess {
        token: String,

        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
    },

    /// Confirm a verification code
    VerifyAccess {
        token: String,
        code: String,

        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
    },

    /// Download through a share link
    DownloadShared {
        token: String,
        code: String,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
    },

    /// Verify the integrity of one file
    Verify { id: Uuid },

    /// Verify many files: one owner's, or all with --admin
    IntegrityCheck {
        #[arg(long)]
        owner: Option<String>,
    },

    /// Rescan one file
    Scan { id: Uuid },

    /// Scan every file still waiting for a verdict
    ScanPending,

    /// Show the scan status of one file
    ScanStatus { id: Uuid },

    /// Move a file into quarantine
    Quarantine { id: Uuid },

    /// Delete expired files
    Sweep {
        /// Keep ciphertext on disk
        #[arg(long)]
        keep_files: bool,
    },

    /// List files expiring soon
    Expiring {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Show storage usage
    Usage,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli, &config_path)) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config_path: &Path) -> Result<()> {
    if let Commands::Init { data_dir } = cli.command {
        return cmd_init(config_path, data_dir);
    }

    let caller = if cli.admin {
        Caller::admin(cli.user)
    } else {
        Caller::user(cli.user)
    };
    let engine = open_engine(config_path).await?;

    match cli.command {
        Commands::Init { .. } => bail!("already initialized"),

        Commands::Upload {
            path,
            name,
            media_type,
        } => {
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("path has no file name")?,
            };
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            let stored = engine
                .upload(&caller, file, UploadMeta::new(name, media_type))
                .await?;
            println!("{}", stored.id);
            print_file(&stored);
        }

        Commands::Download {
            id,
            output,
            password,
            skip_scan,
        } => {
            let password = if password {
                Some(prompt("Lock password: ")?)
            } else {
                None
            };
            let download = engine
                .download(&caller, &id, DownloadOptions { password, skip_scan })
                .await?;
            if let Some(advisory) = &download.advisory {
                println!("Warning: {}", advisory);
            }
            let bytes = write_output(download.stream, &output).await?;
            println!("Wrote {} bytes to {}", bytes, output.display());
        }

        Commands::List => {
            let files = engine.list_owned(&caller)?;
            if files.is_empty() {
                println!("No files");
            }
            for file in files {
                println!(
                    "{}  {:>12}  {:<8}  {}",
                    file.id,
                    file.plaintext_size,
                    state_label(&file),
                    file.display_name
                );
            }
        }

        Commands::Info { id } => print_file(&engine.get(&caller, &id)?),

        Commands::Delete { id } => {
            let file = engine.delete(&caller, &id).await?;
            println!("Deleted {} ({})", file.id, file.display_name);
        }

        Commands::Revoke { id, reason } => {
            engine.revoke(&caller, &id, reason.as_deref())?;
            println!("Revoked {}", id);
        }

        Commands::Restore { id } => {
            engine.restore(&caller, &id).await?;
            println!("Restored {}", id);
        }

        Commands::Expire { id, value, unit } => {
            let unit: ExpiryUnit = unit.parse()?;
            let file = engine.set_expiration(&caller, &id, value, unit)?;
            match file.expires_at {
                Some(at) => println!("Expires at {} ({})", at, format_remaining(at, Utc::now())),
                None => println!("Expiration cleared"),
            }
        }

        Commands::Limit { id, max } => {
            let file = engine.set_download_limit(&caller, &id, Some(max))?;
            match file.max_downloads {
                Some(max) => println!("Download limit {} ({} used)", max, file.download_count),
                None => println!("Download limit cleared"),
            }
        }

        Commands::Lock { id } => {
            let password = prompt("New lock password: ")?;
            let confirm = prompt("Confirm lock password: ")?;
            if password != confirm {
                bail!("passwords do not match");
            }
            engine.lock(&caller, &id, &password).await?;
            println!("Locked {}", id);
        }

        Commands::Unlock { id } => {
            let password = prompt("Lock password: ")?;
            engine.unlock(&caller, &id, &password).await?;
            println!("Unlocked {}", id);
        }

        Commands::Share { id } => {
            let link = engine.create_share_link(&caller, &id)?;
            println!("Token: {}", link.token);
            println!("Expires: {}", link.expires_at);
        }

        Commands::ShareInfo { token } => print_json(&engine.share_info(&token)?)?,

        Commands::RequestAccess { token, ip } => {
            let request = engine.request_access(&token, &ip).await?;
            println!("The owner has been sent a verification code");
            println!("Code expires at {}", request.code_expires_at);
        }

        Commands::VerifyAccess { token, code, ip } => {
            let grant = engine.verify_access(&token, &code, &ip)?;
            println!("Access granted to {} at {}", grant.ip_address, grant.granted_at);
        }

        Commands::DownloadShared {
            token,
            code,
            output,
            ip,
        } => {
            let download = engine.download_shared(&token, &code, &ip).await?;
            if let Some(advisory) = &download.advisory {
                println!("Warning: {}", advisory);
            }
            let bytes = write_output(download.stream, &output).await?;
            println!("Wrote {} bytes to {}", bytes, output.display());
        }

        Commands::Verify { id } => print_json(&engine.verify_integrity(&caller, &id).await?)?,

        Commands::IntegrityCheck { owner } => {
            let report = match owner {
                Some(owner) => engine.verify_owner_files(&caller, &owner).await?,
                None if caller.is_admin() => engine.run_system_integrity_check(&caller).await?,
                None => engine.verify_owner_files(&caller, &caller.user_id).await?,
            };
            println!(
                "Checked {}: {} verified, {} failed, {} missing",
                report.total, report.verified, report.failed, report.missing
            );
            for result in report.results.iter().filter(|r| !r.verified) {
                println!("  {} {}", result.file_id, if result.missing { "missing" } else { "MISMATCH" });
            }
        }

        Commands::Scan { id } => print_json(&engine.scan_and_update(&caller, &id).await?)?,

        Commands::ScanPending => print_json(&engine.scan_pending(&caller).await?)?,

        Commands::ScanStatus { id } => print_json(&engine.scan_status(&caller, &id).await?)?,

        Commands::Quarantine { id } => {
            let outcome = engine.quarantine(&caller, &id).await?;
            println!("Quarantined at {}", outcome.file().ciphertext_path.display());
        }

        Commands::Sweep { keep_files } => print_json(&engine.cleanup_expired(&caller, !keep_files).await?)?,

        Commands::Expiring { hours } => {
            let now = Utc::now();
            for file in engine.expiring_soon(&caller, Duration::hours(hours))? {
                if let Some(at) = file.expires_at {
                    println!("{}  {:<10}  {}", file.id, format_remaining(at, now), file.display_name);
                }
            }
        }

        Commands::Usage => {
            let usage = engine.usage(&caller).await?;
            println!(
                "{} / {} MB ({} bytes used)",
                usage.used / 1024 / 1024,
                usage.limit / 1024 / 1024,
                usage.used
            );
        }
    }

    engine.flush().await?;
    Ok(())
}

fn cmd_init(config_path: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    info!("Initializing filewarden...");

    if config_path.exists() {
        bail!("configuration already exists at {}", config_path.display());
    }

    let mut config = Config::default();
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }

    let passphrase = passphrase(true)?;
    let master = MasterKey::from_password(passphrase.as_bytes(), &config.encryption)
        .context("failed to derive master key")?;
    config.encryption.salt = master.salt().to_vec();

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    Ok(())
}

async fn open_engine(config_path: &Path) -> Result<Engine> {
    let config = Config::load(config_path)
        .with_context(|| format!("cannot load {}", config_path.display()))?;
    let passphrase = passphrase(false)?;
    Ok(Engine::open(config, &passphrase).await?)
}

/// Master passphrase from the environment, or prompted
fn passphrase(confirm: bool) -> Result<String> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(passphrase);
    }
    let passphrase = prompt("Master passphrase: ")?;
    if confirm && prompt("Confirm passphrase: ")? != passphrase {
        bail!("passphrases do not match");
    }
    Ok(passphrase)
}

fn prompt(label: &str) -> Result<String> {
    rpassword::prompt_password(label).context("failed to read password")
}

async fn write_output(stream: filewarden::storage::DecryptedStream, output: &Path) -> Result<u64> {
    let mut out = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("cannot create {}", output.display()))?;
    let bytes = stream.copy_to(&mut out).await?;
    out.sync_all().await?;
    Ok(bytes)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn state_label(file: &StoredFile) -> &'static str {
    let now = Utc::now();
    if file.is_quarantined() {
        "quarant."
    } else if file.is_revoked {
        "revoked"
    } else if file.is_expired(now) {
        "expired"
    } else if file.is_locked {
        "locked"
    } else {
        "active"
    }
}

fn print_file(file: &StoredFile) {
    let now = Utc::now();
    println!("File {}", file.id);
    println!("  Name:        {}", file.display_name);
    println!("  Type:        {}", file.media_type);
    println!("  Size:        {} bytes", file.plaintext_size);
    println!("  Uploaded:    {}", file.uploaded_at);
    println!("  State:       {}", state_label(file));
    println!("  Algorithm:   {}", file.encryption_algorithm);
    println!("  Integrity:   {} ({})", if file.integrity_verified { "verified" } else { "FAILED" }, file.content_hash);
    match &file.scan_result {
        Some(result) => println!("  Scan:        {} ({})", file.scan_status, result),
        None => println!("  Scan:        {}", file.scan_status),
    }
    if let Some(at) = file.expires_at {
        println!("  Expires:     {} ({})", at, format_remaining(at, now));
    }
    match file.max_downloads {
        Some(max) => println!("  Downloads:   {} of {}", file.download_count, max),
        None => println!("  Downloads:   {}", file.download_count),
    }
    if let Some(at) = file.share_expires_at {
        println!("  Shared until {}", at);
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
