//! WhatsApp Engine - Main Entry Point
//!
//! Runs the control API, keeps one messaging client per session and forwards
//! pairing codes, connection changes and allowed inbound messages to the
//! configured webhook.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whatsapp_engine::api::{self, ApiState};
use whatsapp_engine::filter::SenderFilter;
use whatsapp_engine::{
    CredentialStore, EngineConfig, EngineError, SessionRegistry, SidecarFactory,
    WebhookDispatcher,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,whatsapp_engine=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 WhatsApp Engine starting...");

    // Load configuration
    let config = EngineConfig::from_env()?;
    info!("📋 Configuration loaded");

    // Credential store is required
    let store = CredentialStore::open(&config.database_path)
        .map_err(EngineError::Open)
        .with_context(|| format!("opening {:?}", config.database_path))?;
    let store = Arc::new(store);
    info!("📦 Credential store opened at {:?}", config.database_path);

    let filter = Arc::new(SenderFilter::parse(&config.allowed_sender));
    if filter.is_empty() {
        warn!("ALLOWED_SENDER is empty, no inbound messages will be forwarded");
    } else {
        info!("🔒 Forwarding messages from {} allowed sender(s)", filter.len());
    }

    let shutdown = CancellationToken::new();
    let dispatcher = WebhookDispatcher::new(
        config.webhook_url.clone(),
        config.webhook_timeout(),
        shutdown.clone(),
    )?;
    info!("📡 Webhook target: {}", dispatcher.url());

    let factory = Arc::new(SidecarFactory::new(
        config.sidecar_url.clone(),
        Arc::clone(&store),
    ));
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&store),
        factory,
        dispatcher,
        filter,
        shutdown,
        config.send_timeout(),
    ));

    match registry.restorable_devices() {
        Ok(devices) if devices.is_empty() => info!("📱 No stored devices"),
        Ok(devices) => {
            for device in devices {
                if let Some(user) = device.user() {
                    info!(
                        "📱 Stored device for {} ({}), resume with POST /instances/{}/connect",
                        user, device.push_name, user
                    );
                }
            }
        }
        Err(e) => error!("Failed to list stored devices: {}", e),
    }

    // Spawn control API
    let addr = config.listen_addr()?;
    let api_server = spawn_api_server(
        addr,
        ApiState {
            registry: Arc::clone(&registry),
        },
    );

    wait_for_signal().await;

    // Graceful shutdown
    info!("🛑 Shutting down sessions...");
    if tokio::time::timeout(config.shutdown_grace(), registry.shutdown())
        .await
        .is_err()
    {
        warn!(
            "Sessions did not disconnect within {}s",
            config.shutdown_grace_secs
        );
    }

    api_server.abort();

    if let Err(e) = store.close() {
        error!("Failed to close credential store: {}", e);
    }

    info!("✅ WhatsApp Engine stopped");
    Ok(())
}

/// Spawn the control API HTTP server
fn spawn_api_server(addr: SocketAddr, state: ApiState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = api::run_server(addr, state).await {
            error!("Control API error: {}", e);
        }
    })
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("📢 Shutdown signal received");
}
