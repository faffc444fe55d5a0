use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use burrow_server::{Console, ConsoleConfig, CredentialStore, HttpSurface, DEFAULT_ADMIN};

/// Burrow - web console for Cloudflare tunnels and xray nodes
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Web console for Cloudflare tunnels and local xray nodes")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "burrow.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the console (default)
    Serve,

    /// Set a console password offline (reads BURROW_NEW_PASSWORD or stdin)
    Passwd {
        /// Account to update
        #[arg(short, long, default_value = DEFAULT_ADMIN)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("burrow_server=info".parse()?)
                .add_directive("burrow_common=info".parse()?),
        )
        .init();

    let args = Args::parse();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&args.config).await,
        Command::Passwd { user } => passwd(&args.config, &user),
    }
}

async fn serve(config_path: &str) -> Result<()> {
    tracing::info!("Starting console with config: {}", config_path);

    let config = ConsoleConfig::load_and_resolve(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Main directory: {}", config.main_dir.display());
    tracing::info!("cloudflared: {}", config.tunnel_bin.display());
    tracing::info!("xray: {}", config.proxy_bin.display());

    let tls_acceptor = match &config.tls {
        Some(tls) => {
            tracing::info!("Console TLS: enabled");
            Some(
                burrow_common::tls_acceptor_from_pem(&tls.cert_pem, &tls.key_pem)
                    .context("Failed to load TLS configuration")?,
            )
        }
        None => {
            tracing::info!("Console TLS: disabled (plain HTTP)");
            None
        }
    };

    let listen_addr = config.listen_addr;
    let console = Console::with_cloudflare(config)?;
    let surface = HttpSurface::new(console.clone(), tls_acceptor);

    tokio::select! {
        result = surface.run(listen_addr) => {
            tracing::error!("Console stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    console.shutdown().await;
    tracing::info!("Console shutdown complete");
    Ok(())
}

/// Offline password reset; also creates the account on first run
fn passwd(config_path: &str, user: &str) -> Result<()> {
    let config = ConsoleConfig::load_and_resolve(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    config
        .ensure_dirs()
        .with_context(|| format!("Failed to prepare {}", config.main_dir.display()))?;

    let password = match std::env::var("BURROW_NEW_PASSWORD") {
        Ok(password) => password,
        Err(_) => {
            eprintln!("Enter the new password for {} and press Ctrl+D:", user);
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read password from stdin")?;
            input
        }
    };
    let password = password.trim_end_matches(['\r', '\n']);

    let store = CredentialStore::new(config.users_file());
    store
        .set_password(user, password)
        .with_context(|| format!("Failed to set password for {}", user))?;

    tracing::info!("Password updated for {} in {}", user, store.path().display());
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
