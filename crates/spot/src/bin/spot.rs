//! Spot CLI - rent a spot GPU instance and launch a training run on it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spot::config::{resolve_ssh_key, Config, Credentials};
use spot::keys::{existing_keys, generate_key, public_key_path, read_public_key};
use spot::launcher::{Launcher, Outcome, ScriptTemplates, REMOTE_LOG_PATH};
use spot::monitor::{collect_report, HostCheck, MonitorReport};
use spot::providers::datacrunch::DataCrunch;
use spot::providers::{InstanceStatus, SpotProvider};
use spot::remote::SshShell;
use spot::selector::{all_matches, Criteria};

/// Seconds between monitoring passes in watch mode.
const WATCH_INTERVAL_SECS: u64 = 60;

/// Spot CLI - Provision spot GPU instances for training runs.
#[derive(Parser)]
#[command(name = "spot")]
#[command(about = "Rent spot GPU instances on DataCrunch and launch training jobs")]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision an instance, wait for installation and start training.
    Launch,

    /// List instance types and spot prices.
    Instances {
        /// Filter by GPU type (e.g., H100, RTX4090).
        #[arg(long)]
        gpu: Option<String>,

        /// Maximum spot price per hour.
        #[arg(long)]
        max_price: Option<f64>,

        /// Show account balance instead.
        #[arg(long, default_value = "false")]
        account: bool,
    },

    /// Show running instances and training progress.
    Monitor {
        /// Check a single host instead of every running instance.
        #[arg(long)]
        ip: Option<String>,

        /// Refresh every minute until interrupted.
        #[arg(long, short = 'w', default_value = "false")]
        watch: bool,

        /// Private key for SSH (or set `SSH_KEY_PATH` env var).
        #[arg(long, env = "SSH_KEY_PATH")]
        ssh_key: Option<PathBuf>,
    },

    /// Find or generate an SSH key for provisioned instances.
    SshSetup,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .init();

    match cli.command {
        Commands::Launch => launch().await,
        Commands::Instances {
            gpu,
            max_price,
            account,
        } => {
            let provider = provider_from_env()?;
            if account {
                show_account(&provider).await
            } else {
                show_instance_types(&provider, gpu.unwrap_or_default(), max_price).await
            }
        }
        Commands::Monitor { ip, watch, ssh_key } => monitor(ip, watch, ssh_key).await,
        Commands::SshSetup => ssh_setup(),
    }
}

/// `RUST_LOG` if set, otherwise `info` (`debug` with `--verbose`).
fn log_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn provider_from_env() -> Result<DataCrunch> {
    let creds = Credentials::from_env().context(
        "DATACRUNCH_CLIENT_ID and DATACRUNCH_CLIENT_SECRET must be set in .env or the environment",
    )?;
    DataCrunch::with_base_url(&creds.client_id, &creds.client_secret, &creds.api_url)
        .context("Failed to create DataCrunch provider")
}

async fn launch() -> Result<()> {
    let config = Config::from_env()?;
    let key = config
        .require_ssh_key()
        .context("Run `spot ssh-setup` to create a key and register it with DataCrunch")?
        .to_path_buf();
    let templates = ScriptTemplates::load(&config)?;

    let provider = DataCrunch::with_base_url(
        &config.credentials.client_id,
        &config.credentials.client_secret,
        &config.credentials.api_url,
    )
    .context("Failed to create DataCrunch provider")?;
    let shell = SshShell::new(key);

    info!(
        gpu = %config.required_gpu,
        price_cap = config.price_cap,
        "Starting spot instance provisioning"
    );

    let mut launcher = Launcher::new(&provider, &shell, &config, templates);
    let outcome = launcher
        .run_interruptible(
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            },
            confirm_cleanup,
        )
        .await?;

    match outcome {
        Outcome::Completed(summary) => {
            println!("\n✅ Training launched successfully!");
            println!("   Instance: {}", summary.instance_id);
            println!(
                "   Type:     {} ({})",
                summary.instance_type.name, summary.instance_type.gpu_description
            );
            println!("   Price:    ${:.3}/hr (spot)", summary.instance_type.spot_price_per_hour);
            println!("   SSH:      ssh root@{}", summary.ip);
            println!("   Logs:     tail -f {REMOTE_LOG_PATH}");
            println!("\n💡 The instance deletes itself when training finishes");
        }
        Outcome::Interrupted { cleaned_up: true } => {
            println!("\n🧹 Resources deleted");
        }
        Outcome::Interrupted { cleaned_up: false } => {
            let session = launcher.session();
            println!("\n⚠️  Resources left running:");
            if let Some(id) = session.instance_id() {
                println!("   Instance:       {id}");
            }
            if let Some(id) = session.startup_script_id() {
                println!("   Startup script: {id}");
            }
        }
    }

    Ok(())
}

fn confirm_cleanup() -> bool {
    Confirm::new()
        .with_prompt("Interrupted. Delete created instance?")
        .default(false)
        .interact()
        .unwrap_or(false)
}

async fn show_instance_types<P>(provider: &P, gpu: String, max_price: Option<f64>) -> Result<()>
where
    P: SpotProvider + ?Sized,
{
    let catalog = provider
        .list_instance_types()
        .await
        .context("Error fetching instances")?;
    let criteria = Criteria {
        gpu,
        max_spot_price: max_price,
    };
    let matching = all_matches(&catalog, &criteria);

    println!("\nAvailable DataCrunch Instances");
    println!("{}", "=".repeat(95));
    println!(
        "{:<25} {:<20} {:<10} {:<10} {:<15} {:<15}",
        "INSTANCE TYPE", "GPU", "GPU COUNT", "CPU COUNT", "SPOT/HR", "ON-DEMAND/HR"
    );
    println!("{}", "-".repeat(95));

    for t in &matching {
        println!(
            "{:<25} {:<20} {:<10} {:<10} ${:<14.3} ${:<14.3}",
            t.name,
            t.gpu_description,
            t.gpu_count,
            t.cpu_cores,
            t.spot_price_per_hour,
            t.price_per_hour
        );
    }

    println!("\nFound {} instances matching criteria", matching.len());
    if !criteria.gpu.is_empty() {
        println!("GPU filter: {}", criteria.gpu);
    }
    if let Some(cap) = max_price {
        println!("Max price: ${cap}/hour");
    }
    Ok(())
}

async fn show_account<P>(provider: &P) -> Result<()>
where
    P: SpotProvider + ?Sized,
{
    let balance = provider
        .balance()
        .await
        .context("Error fetching account info")?;
    println!("\n💰 Account balance: {:.2} {}", balance.amount, balance.currency);
    Ok(())
}

async fn monitor(ip: Option<String>, watch: bool, ssh_key: Option<PathBuf>) -> Result<()> {
    let provider = provider_from_env()?;
    let home = dirs::home_dir();
    let shell = resolve_ssh_key(ssh_key.as_deref(), home.as_deref()).map(SshShell::new);
    if shell.is_none() {
        warn!("No SSH key found, training progress will not be checked");
    }

    loop {
        let report = collect_report(&provider, shell.as_ref(), ip.as_deref()).await?;
        print_report(&report, ip.is_some());

        if !watch {
            return Ok(());
        }

        println!("\n{}", "=".repeat(50));
        println!("Refreshing in {WATCH_INTERVAL_SECS} seconds... (Ctrl+C to stop)");
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(WATCH_INTERVAL_SECS)) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\nMonitoring stopped.");
                return Ok(());
            }
        }
    }
}

fn print_report(report: &MonitorReport, single_host: bool) {
    if !single_host {
        if report.running.is_empty() {
            println!("\nNo running instances found.");
        } else {
            println!("\nRunning Instances:");
            println!("{}", "=".repeat(85));
            println!(
                "{:<38} {:<20} {:<16} {:<20} {:<10}",
                "ID", "NAME", "IP", "TYPE", "STATUS"
            );
            println!("{}", "-".repeat(85));
            for instance in &report.running {
                let status_emoji = match instance.status {
                    InstanceStatus::Running => "🟢",
                    _ => "⚪",
                };
                println!(
                    "{:<38} {:<20} {:<16} {:<20} {} {}",
                    instance.id,
                    instance.hostname,
                    instance.address().unwrap_or("N/A"),
                    instance.instance_type,
                    status_emoji,
                    instance.status
                );
            }
        }
    }

    for check in &report.checks {
        match check {
            HostCheck::Reached(progress) => {
                println!("\nChecking training on {}...", progress.host);
                if progress.training_running {
                    println!("✅ Training is running on {}", progress.host);
                } else {
                    println!("⚠️  No training process found on {}", progress.host);
                }
                if !progress.log_tail.is_empty() {
                    println!("\nRecent training logs from {}:", progress.host);
                    println!("{}", "-".repeat(50));
                    println!("{}", progress.log_tail);
                }
            }
            HostCheck::Unreachable { host, error } => {
                println!("\n❌ Failed to connect to {host}: {error}");
            }
        }
    }
}

fn ssh_setup() -> Result<()> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let keys = existing_keys(&home);

    let key = if let Some(first) = keys.first() {
        println!("\n🔑 Found SSH keys:");
        for key in &keys {
            println!("   {}", key.display());
        }
        first.clone()
    } else {
        println!("\nNo SSH keys found in {}", home.join(".ssh").display());
        let generate = Confirm::new()
            .with_prompt("Generate a new ed25519 key for DataCrunch?")
            .default(true)
            .interact()
            .context("Failed to read confirmation")?;
        if !generate {
            println!("\nSet SSH_KEY_PATH to an existing private key to continue.");
            return Ok(());
        }
        let key = generate_key(&home)?;
        println!("\n✅ Generated {}", key.display());
        key
    };

    match read_public_key(&key) {
        Some(public) => {
            println!("\nPublic key ({}):", public_key_path(&key).display());
            println!("{public}");
        }
        None => warn!(path = %key.display(), "No public key next to private key"),
    }

    println!("\n💡 Next steps:");
    println!("   1. Add the public key above in the DataCrunch dashboard under SSH Keys");
    println!("   2. Set SSH_KEY_PATH={} in your .env file", key.display());
    println!("   3. Run `spot launch`");
    Ok(())
}
