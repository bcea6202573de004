//! # Chief Voice Relay - Process Entry Point
//!
//! Runs two Actix-web servers on one runtime:
//! - **HTTP** (`server.port`): liveness, metrics and runtime configuration
//! - **Relay** (`server.ws_port`, default port + 1): every request is a
//!   WebSocket upgrade into a relay session
//!
//! ## Startup:
//! 1. Read `.env`, set up tracing
//! 2. Install the TLS crypto provider used by the upstream connection
//! 3. Load and validate configuration
//! 4. Bind both listeners (failing fast if either port is taken)
//!
//! ## Shutdown:
//! On SIGTERM/SIGINT both servers stop accepting, close their listeners and
//! get `performance.shutdown_timeout_secs` to finish. Relay sessions still
//! open at that point are dropped, which closes their sockets.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use chief_voice_relay::config::AppConfig;
use chief_voice_relay::state::AppState;
use chief_voice_relay::{handlers, health, middleware, relay};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handler task, polled by `wait_for_shutdown`.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A TLS crypto provider was already installed");
    }

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting chief-voice-relay v{}", env!("CARGO_PKG_VERSION"));
    if !config.has_default_api_key() {
        info!("No server default API key; clients must supply api_key");
    }

    let app_state = AppState::new(config.clone());
    let http_addr = format!("{}:{}", config.server.host, config.server.port);
    let relay_addr = format!("{}:{}", config.server.host, config.ws_port());
    let shutdown_timeout = config.performance.shutdown_timeout_secs;

    setup_signal_handlers();

    let http_state = app_state.clone();
    let http_server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .shutdown_timeout(shutdown_timeout)
    .bind(&http_addr)?
    .run();

    let relay_state = app_state.clone();
    let relay_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(relay_state.clone()))
            .wrap(TracingLogger::default())
            .configure(relay::manager::configure)
    })
    .disable_signals()
    .shutdown_timeout(shutdown_timeout)
    .bind(&relay_addr)?
    .run();

    info!("HTTP server listening on {}", http_addr);
    info!("Relay WebSocket server listening on ws://{}", relay_addr);

    let http_handle = http_server.handle();
    let relay_handle = relay_server.handle();
    let http_task = tokio::spawn(http_server);
    let relay_task = tokio::spawn(relay_server);

    tokio::select! {
        result = http_task => log_server_exit("HTTP", result),
        result = relay_task => log_server_exit("Relay", result),
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, closing listeners...");
        }
    }

    // Stopping an already-finished server is a no-op
    let stop_both = async {
        tokio::join!(relay_handle.stop(true), http_handle.stop(true));
    };
    if tokio::time::timeout(Duration::from_secs(shutdown_timeout), stop_both).await.is_err() {
        warn!("Servers did not stop within {}s, exiting anyway", shutdown_timeout);
    }

    info!("Relay stopped");
    Ok(())
}

fn log_server_exit(name: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("{} server exited", name),
        Ok(Err(e)) => error!("{} server error: {}", name, e),
        Err(e) => error!("{} server task error: {}", name, e),
    }
}

/// Structured logging to stdout, filtered by `RUST_LOG`.
///
/// Defaults to `chief_voice_relay=debug,actix_web=info` when unset.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chief_voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Flip `SHUTDOWN_SIGNAL` on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
