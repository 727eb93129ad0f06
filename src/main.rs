use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use zeroize::Zeroizing;

use fwbackup::config::{BackupConfig, DeviceRecord, LoggingConfig};

#[derive(Parser)]
#[command(
    name = "fwbackup",
    about = "Unattended configuration backup for network firewall appliances",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $FWBACKUP_CONFIG, then ./fwbackup.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export, name and store a backup for every configured device
    Run {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Exit non-zero if any device failed
        #[arg(long)]
        fail_on_error: bool,
    },

    /// Apply the retention cap to the backup directory without exporting
    Prune {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Obtain an API key for a firewall and add it to the config file
    AddDevice {
        /// Firewall IP address or hostname
        #[arg(long)]
        address: String,

        /// Admin username used for key generation
        #[arg(long, required_unless_present = "reuse_key_from")]
        user: Option<String>,

        /// Read the password from the first line of stdin instead of prompting
        #[arg(long)]
        password_stdin: bool,

        /// Copy the API key of an already configured device instead
        #[arg(long, conflicts_with_all = ["user", "password_stdin"])]
        reuse_key_from: Option<String>,
    },

    /// Print the effective configuration (API keys redacted)
    ShowConfig,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_path) = BackupConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run { json, fail_on_error } => {
            tracing::info!(config = %config_path.display(), "Starting backup run");
            let summary = fwbackup::run(&config).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("\nFirewall Backup Summary");
                println!("{:<20} | {:<8} | Details", "Device", "Status");
                println!("{:-<20}-|-{:-<8}-|-{:-<40}", "", "", "");
                for o in &summary.outcomes {
                    let (status, details) = if o.succeeded() {
                        let path = o
                            .path
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default();
                        let note = if o.hostname_fallback {
                            " (hostname not found, named by address)"
                        } else {
                            ""
                        };
                        ("OK", format!("{}{}", path, note))
                    } else {
                        let stage = o.failed_at.map(|s| s.to_string()).unwrap_or_default();
                        (
                            "FAIL",
                            format!("{}: {}", stage, o.error.as_deref().unwrap_or("unknown")),
                        )
                    };
                    println!("{:<20} | {:<8} | {}", o.address, status, details);
                }
                println!(
                    "\n{} succeeded, {} failed\n",
                    summary.succeeded(),
                    summary.failed()
                );
            }

            if fail_on_error && summary.failed() > 0 {
                bail!("{} device(s) failed to back up", summary.failed());
            }
        }
        Commands::Prune { json } => {
            config.validate()?;
            let dir = &config.backup.directory;
            tracing::info!(dir = %dir.display(), cap = config.backup.retention_cap, "Pruning backups");
            let report = fwbackup::retention::enforce(dir, config.backup.retention_cap)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for path in &report.deleted {
                    println!("deleted {}", path.display());
                }
                for (path, err) in &report.failed {
                    println!("could not delete {}: {}", path.display(), err);
                }
                println!("{} backup(s) kept in {}", report.kept, dir.display());
            }
        }
        Commands::AddDevice {
            address,
            user,
            password_stdin,
            reuse_key_from,
        } => {
            let mut config = config;
            let api_key = match (reuse_key_from, user) {
                (Some(source), _) => config
                    .device(&source)
                    .map(|d| d.api_key.clone())
                    .with_context(|| format!("device {} is not configured", source))?,
                (None, Some(user)) => {
                    let password = read_password(&user, &address, password_stdin)?;
                    let client = config.http.client()?;
                    fwbackup::credentials::keygen(
                        &client,
                        &config.http.base_url(&address),
                        &address,
                        &user,
                        &password,
                    )
                    .await?
                }
                (None, None) => bail!("either --user or --reuse-key-from is required"),
            };

            config.upsert_device(DeviceRecord::new(address.clone(), api_key));
            config.validate()?;
            config.save(&config_path)?;
            println!("Device {} saved to {}", address, config_path.display());
        }
        Commands::ShowConfig => {
            let mut shown = config.clone();
            for d in &mut shown.devices {
                if !d.api_key.is_empty() {
                    d.api_key = "<redacted>".to_string();
                }
            }
            println!("# {}", config_path.display());
            println!("{}", toml::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

fn read_password(user: &str, address: &str, from_stdin: bool) -> Result<Zeroizing<String>> {
    if from_stdin {
        let mut line = Zeroizing::new(String::new());
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read password from stdin")?;
        let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
        return Ok(trimmed);
    }
    let password = rpassword::prompt_password(format!("Password for {}@{}: ", user, address))
        .context("failed to read password")?;
    Ok(Zeroizing::new(password))
}
