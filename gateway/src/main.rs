//! modelgate - serves a model pipeline over HTTP.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use modelgate::config::GatewayConfig;
use modelgate::error::GatewayError;
use modelgate::{build_router, logging, AppState};
use modelgate_backends::BackendRegistry;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status after an interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupt,
    Terminate,
}

fn print_usage() {
    println!("modelgate {}\n\nUSAGE:\n    modelgate [--config <path>]\n\nOPTIONS:\n    -c, --config <path>    configuration file (toml, json or yaml)\n    -V, --version          print version\n    -h, --help             print this help", VERSION);
}

/// `--config <path>` or `--config=<path>`.
fn config_path(args: &[String]) -> Option<PathBuf> {
    args.iter().enumerate().find_map(|(i, arg)| {
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
        if arg == "--config" || arg == "-c" {
            return args.get(i + 1).map(PathBuf::from);
        }
        None
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("modelgate {}", VERSION);
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let config = match GatewayConfig::load(config_path(&args).as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("modelgate: {}", e);
            return ExitCode::from(2);
        }
    };

    logging::init_tracing(&config.logging.level);

    match run(config).await {
        Ok(Signal::Interrupt) => ExitCode::from(EXIT_INTERRUPTED),
        Ok(Signal::Terminate) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = e.kind(), "Startup failed: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(config: GatewayConfig) -> Result<Signal, GatewayError> {
    tracing::info!("Starting modelgate {}", VERSION);

    let registry = BackendRegistry::with_builtin();
    tracing::info!("Available backends: {}", registry.kinds().join(", "));

    let addr = format!("{}:{}", config.listen_host, config.http_port);
    let state = AppState::start(config, &registry).await?;
    let lifecycle = state.lifecycle.clone();

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            lifecycle.shutdown().await;
            return Err(GatewayError::Config(format!("cannot listen on {}: {}", addr, e)));
        }
    };
    lifecycle.mark_running();
    tracing::info!("Listening on {}", addr);

    let app = build_router(state);
    let (signal_tx, mut signal_rx) = oneshot::channel();
    let drain = lifecycle.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let signal = shutdown_signal().await;
            tracing::info!(?signal, "Shutdown requested");
            let _ = signal_tx.send(signal);
            // keep answering 503 while in-flight requests finish
            drain.shutdown().await;
        })
        .await;

    if let Err(e) = served {
        tracing::error!("Server error: {}", e);
    }
    // no-op when the signal path already drained
    lifecycle.shutdown().await;

    Ok(signal_rx.try_recv().unwrap_or(Signal::Terminate))
}

async fn shutdown_signal() -> Signal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => Signal::Interrupt,
        _ = terminate => Signal::Terminate,
    }
}
