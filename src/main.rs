use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qwed_gateway::audit::ChainStatus;
use qwed_gateway::config::GatewayConfig;
use qwed_gateway::storage::{self, Store};

/// QWED Gateway - verification layer for untrusted model output
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Listen address, e.g. 127.0.0.1:8000
        #[arg(long)]
        listen: Option<String>,
    },

    /// Mint an API key for an organization and store its fingerprint
    Keygen {
        /// Organization id (created if missing)
        #[arg(long)]
        org: String,

        /// Organization display name
        #[arg(long)]
        name: Option<String>,

        /// Role for the key (admin | member | agent)
        #[arg(long, default_value = "member")]
        role: String,
    },

    /// Walk the audit chain and report the first broken link, if any
    VerifyChain,

    /// Isolated stats evaluation child process (internal)
    #[command(hide = true)]
    SandboxWorker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The worker must not initialize logging: its stdout is the protocol.
    if matches!(cli.command, Commands::SandboxWorker) {
        std::process::exit(qwed_gateway::sandbox::worker::run_worker());
    }

    init_logging(&cli.log_level)?;
    let config = GatewayConfig::from_env();

    match cli.command {
        Commands::Serve { listen } => {
            let addr = listen.unwrap_or_else(|| config.listen_addr.clone());
            info!("starting qwed-gateway v{}", env!("CARGO_PKG_VERSION"));
            let control = qwed_gateway::build_control_plane(config)
                .context("failed to build control plane")?;
            qwed_gateway::server::serve(control, &addr)
                .await
                .context("server exited with error")?;
        }
        Commands::Keygen { org, name, role } => {
            let store = Store::open(&config.database_url, &config.audit_secret)
                .context("failed to open database")?;
            let display_name = name.unwrap_or_else(|| org.clone());
            store
                .create_organization(&org, &display_name, "free", 10_000, config.rate_limit_per_key as i64)
                .context("failed to create organization")?;
            let key = storage::generate_api_key();
            store
                .insert_key(&key, &org, &role, &[], None, false)
                .context("failed to store key fingerprint")?;
            // The plaintext key is shown exactly once.
            println!("organization: {org}");
            println!("role:         {role}");
            println!("api key:      {key}");
            println!("display as:   {}", storage::mask_api_key(&key));
        }
        Commands::VerifyChain => {
            let store = Store::open(&config.database_url, &config.audit_secret)
                .context("failed to open database")?;
            let audit = qwed_gateway::audit::AuditLog::new(store, &config.audit_secret);
            match audit.verify_chain().context("chain walk failed")? {
                ChainStatus::Intact { entries, tail_hash } => {
                    println!("chain intact: {entries} entries, tail {tail_hash}");
                }
                ChainStatus::BrokenAt { id, reason } => {
                    println!("chain BROKEN at entry {id}: {reason}");
                    std::process::exit(1);
                }
            }
        }
        Commands::SandboxWorker => unreachable!("handled before logging init"),
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}
