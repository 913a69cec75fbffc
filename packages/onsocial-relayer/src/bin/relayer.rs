//! OnSocial Relayer binary.
//!
//! `onsocial-relayer` serves. `onsocial-relayer seal-keys <input.json>`
//! validates a plaintext credential file and writes it to `keys_path`,
//! encrypted when `RELAYER_KEY_ENCRYPTION_SECRET` is set.

use clap::{Parser, Subcommand};
use onsocial_relayer::chain::ChainClient;
use onsocial_relayer::{
    create_router, AppState, Config, DrainCoordinator, KeyPool, KeyStore, RpcClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validates a plaintext credential file and writes the pool's key file
    SealKeys {
        /// JSON array of `{account_id, public_key, secret_key}`
        input: PathBuf,
        /// Destination, defaults to the configured `keys_path`
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting OnSocial Relayer");

    if let Some(Command::SealKeys { input, output }) = cli.command {
        return seal_keys(&input, output);
    }

    let config = Config::load().unwrap_or_else(|e| {
        error!(error = %e, "FATAL: Config error, fix env vars or relayer.toml");
        std::process::exit(1);
    });

    let store = KeyStore::from_env(PathBuf::from(&config.keys_path))?;

    if config.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
        info!("API key auth enabled");
    } else {
        warn!("RELAYER_API_KEY not set, /execute is unprotected (dev mode)");
    }

    info!(
        contract = %config.contract_id,
        rpc = %config.rpc_url,
        fallback = %config.fallback_rpc_url,
        "Configuration loaded"
    );

    let credentials = store.load().unwrap_or_else(|e| {
        error!(error = %e, "FATAL: Could not load pool credentials");
        std::process::exit(1);
    });

    let chain = Arc::new(RpcClient::new(&config.rpc_url, &config.fallback_rpc_url));
    let pool = KeyPool::from_credentials(credentials, chain.clone(), config.acquire_timeout())?;

    let rpc_status = chain.probe().await.unwrap_or_else(|e| {
        error!(error = %e, "FATAL: RPC unreachable");
        std::process::exit(1);
    });

    let bind_address = config.bind_address.clone();
    let drain_timeout = config.drain_timeout();
    let state = Arc::new(AppState::new(config, chain, pool)?);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    state.health.mark_ready();
    info!(
        address = %bind_address,
        keys = state.pool().size(),
        rpc = rpc_status,
        "Relayer ready"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let drain = DrainCoordinator::new(state.health.clone(), state.pool().clone(), drain_timeout);
    let app = create_router(state.clone());

    // The server keeps answering (503 on /ready and /execute) until the
    // drain window closes.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let report = drain.run(shutdown).await;
            if !report.drained {
                warn!(remaining = report.remaining, "Shutting down with leases outstanding");
            }
        })
        .await?;

    state.health.mark_stopped();
    info!("Relayer shut down gracefully");
    Ok(())
}

/// Write `input` to `output`, or to the configured `keys_path`.
fn seal_keys(input: &Path, output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = match output {
        Some(path) => path,
        None => PathBuf::from(Config::load()?.keys_path),
    };
    let store = KeyStore::from_env(path.clone())?;
    let count = store.seal(&std::fs::read(input)?)?;
    info!(keys = count, path = %path.display(), "Credential file written");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_serves() {
        let cli = Cli::try_parse_from(["onsocial-relayer"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_seal_keys_parses_input_and_output() {
        let cli = Cli::try_parse_from(["onsocial-relayer", "seal-keys", "keys.json"]).unwrap();
        match cli.command {
            Some(Command::SealKeys { input, output }) => {
                assert_eq!(input, PathBuf::from("keys.json"));
                assert!(output.is_none());
            }
            other => panic!("expected seal-keys, got {other:?}"),
        }

        let cli = Cli::try_parse_from([
            "onsocial-relayer",
            "seal-keys",
            "keys.json",
            "--output",
            "sealed.bin",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::SealKeys { output: Some(ref o), .. }) if o == &PathBuf::from("sealed.bin")
        ));
    }

    #[test]
    fn test_unknown_or_incomplete_commands_are_rejected() {
        assert!(Cli::try_parse_from(["onsocial-relayer", "rotate-keys"]).is_err());
        assert!(Cli::try_parse_from(["onsocial-relayer", "seal-keys"]).is_err());
    }
}
