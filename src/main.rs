mod bus;
mod config;
mod hub;
mod presence;
mod protocol;
mod server;
mod token;
mod token_service;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use config::Config;
use hub::Hub;
use server::WsServer;
use token::TokenSigner;
use token_service::TokenService;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Realtime topic hub bridging WebSocket clients to a pub/sub bus")]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true, env = "SKYHUB_CONFIG", default_value = "skyhub.toml")]
    config: PathBuf,

    /// Override WebSocket listener bind address.
    #[arg(long, global = true, env = "SKYHUB_BIND")]
    bind: Option<String>,

    /// Override bus connection URL.
    #[arg(long, global = true, env = "SKYHUB_BUS_URL")]
    bus_url: Option<String>,

    /// Override token signing secret.
    #[arg(long, global = true, env = "SKYHUB_SECRET")]
    secret: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "SKYHUB_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the hub.
    Run,
    /// Mint a topic credential offline, without a running hub.
    Token(TokenArgs),
}

#[derive(Debug, Clone, Args)]
struct TokenArgs {
    /// Topic the credential is scoped to.
    #[arg(long)]
    topic: String,
    /// Client identity; generated when omitted.
    #[arg(long)]
    id: Option<String>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_hub(cli).await,
        CliCommand::Token(args) => mint_token(cli, args),
    }
}

async fn run_hub(cli: Cli) -> Result<()> {
    let mut cfg = load_config(&cli)?;
    if cfg.auth.secret.is_empty() {
        warn!("auth.secret is empty; credentials are signed with the empty key");
    }

    let signer = TokenSigner::new(cfg.auth.secret.clone(), cfg.auth.token_ttl_secs);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (bus_tx, bus_rx) = mpsc::unbounded_channel();
    let hub = Hub::new(&cfg, signer.clone(), bus_tx);

    let bridge_task = tokio::spawn(bus::run(
        cfg.bus.clone(),
        hub.clone(),
        bus_rx,
        shutdown_tx.subscribe(),
    ));
    let token_task = cfg.server.http_bind.take().map(|bind| {
        let service = TokenService::new(signer.clone());
        tokio::spawn(service.run(bind, shutdown_tx.subscribe()))
    });
    let server = WsServer::new(cfg.server.clone(), hub);
    let server_task = tokio::spawn(server.run(shutdown_tx.subscribe()));

    wait_for_shutdown_signal().await;
    let _ = shutdown_tx.send(());

    let _ = server_task.await;
    let _ = bridge_task.await;
    if let Some(task) = token_task {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("ctrl-c received, initiating shutdown");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        info!("SIGTERM received, initiating shutdown");
                    }
                    Err(err) => {
                        warn!("failed installing SIGTERM handler: {err}");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

fn mint_token(cli: Cli, args: TokenArgs) -> Result<()> {
    let cfg = load_config(&cli)?;
    let signer = TokenSigner::new(cfg.auth.secret, cfg.auth.token_ttl_secs);
    let id = args
        .id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));
    let token = signer
        .mint(&id, &args.topic)
        .context("failed minting credential")?;
    if args.json {
        println!(
            "{}",
            json!({
                "id": id,
                "topic": args.topic,
                "token": token
            })
        );
    } else {
        println!("id:    {id}");
        println!("topic: {}", args.topic);
        println!("token: {token}");
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(
        cli.bind.as_deref(),
        cli.bus_url.as_deref(),
        cli.secret.as_deref(),
    );
    Ok(cfg)
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}
