use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;

mod agent;
mod api;
mod config;
mod context;
mod credentials;
mod link;
mod status;

use crate::agent::Agent;
use crate::api::ApiClient;
use crate::config::{CastlinkConfig, FileConfig, load_config};
use crate::context::AppContext;
use crate::credentials::CredentialStore;
use crate::link::{LinkConfig, SessionLink, SessionRouter};
use crate::status::TracingStatusSink;

#[derive(Parser)]
#[command(name = "castlink")]
#[command(about = "Coding session agent: links the commits you make while recording")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.castlink)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground
    Run(RunArgs),

    /// Store an auth token for this installation
    Login(LoginArgs),

    /// Forget the stored auth token
    Logout,

    /// Show auth state and install identity
    Status,
}

#[derive(Parser)]
struct RunArgs {
    /// Start a coding session immediately instead of waiting for one
    #[arg(long)]
    record: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct LoginArgs {
    /// Bearer token issued by the website's agent-auth flow
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CastlinkConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Login(args) => {
            let credentials = CredentialStore::load_or_init(&config.data_dir)?;
            let ctx = AppContext::new(credentials);
            ctx.login(&args.token)?;
            println!("Authenticated. Start the agent with: castlink run");
            Ok(())
        }
        Commands::Logout => {
            let credentials = CredentialStore::load_or_init(&config.data_dir)?;
            let ctx = AppContext::new(credentials);
            ctx.logout()?;
            println!("Logged out");
            Ok(())
        }
        Commands::Status => {
            let credentials = CredentialStore::load_or_init(&config.data_dir)?;
            println!("install id: {}", credentials.install_id());
            println!(
                "auth: {}",
                if credentials.token().is_some() {
                    "logged in"
                } else {
                    "logged out"
                }
            );
            Ok(())
        }
    }
}

async fn run(config: CastlinkConfig, args: RunArgs) -> Result<()> {
    let default_directive = if args.debug {
        "castlink=debug,commit_capture=debug,info"
    } else {
        "info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Castlink session agent");

    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .context("invalid configuration")?;

    let credentials = CredentialStore::load_or_init(&config.data_dir)?;
    let ctx = AppContext::new(credentials);

    let link_config = LinkConfig::from_file(
        &file_config.link,
        file_config.service.event_service_url(),
    );
    let (link, inbound_rx) = SessionLink::new(link_config, ctx.clone());
    let router = SessionRouter::new(ctx.clone(), link);
    router.spawn(inbound_rx);

    let api = ApiClient::new(file_config.service.api_host.clone(), ctx.clone());
    let agent = Agent::new(
        ctx.clone(),
        router,
        api,
        Arc::new(TracingStatusSink),
        file_config.service.clone(),
        file_config.capture.roots.clone(),
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown_signal.cancel();
        }
    });

    agent.run(args.record, shutdown).await
}
