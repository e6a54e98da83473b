//! Cablecast CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use cablecast::auth::{AdminKey, Grant, GrantSet, GrantType, SubToken};
use cablecast::relay::postgres::{PostgresBus, PostgresConfig};
use cablecast::relay::{Bus, Envelope};
use cablecast::server::{run_websocket_server, ChannelRoutes, NodeId, StreamHandler, WsState};
use cablecast::{AllowAll, Authorizer, Hub, HubConfig, TokenAuthorizer, TopicName, TopicPattern};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_config = match &cli.database_url {
        Some(url) => Some(PostgresConfig::from_url(url).context("Invalid DATABASE_URL")?),
        None => PostgresConfig::from_env(),
    };

    match cli.command {
        Commands::Serve {
            bind,
            secret,
            republish,
            heartbeat,
            capacity,
            standalone,
        } => {
            let config = HubConfig::new()
                .outbound_capacity(capacity)
                .heartbeat_interval(Duration::from_secs(heartbeat.max(1)));
            let db_config = if standalone { None } else { db_config };
            serve(bind, secret, cli.admin_key, republish, config, db_config).await
        }
        Commands::Token {
            permission,
            patterns,
            client_id,
            ttl,
            secret,
        } => token(permission, patterns, client_id, ttl, secret),
        Commands::Publish { topic, payload } => {
            let db_config = db_config.context("DATABASE_URL not set")?;
            publish(db_config, topic, payload).await
        }
    }
}

async fn serve(
    bind: String,
    secret: Option<String>,
    admin_key: Option<String>,
    republish: bool,
    config: HubConfig,
    db_config: Option<PostgresConfig>,
) -> Result<()> {
    let bind_addr: SocketAddr = bind.parse().context("Invalid bind address")?;
    let admin_key = admin_key.map(AdminKey::new);

    let authorizer: Arc<dyn Authorizer> = match secret {
        Some(secret) => Arc::new(TokenAuthorizer::new(secret.into_bytes(), admin_key.clone())),
        None => {
            warn!("CABLECAST_SECRET not set, accepting every client");
            Arc::new(AllowAll)
        }
    };

    let routes = ChannelRoutes::catch_all(Arc::new(StreamHandler { republish }));
    let hub = Arc::new(Hub::new(config, authorizer, routes));

    match db_config {
        Some(db_config) => {
            let bus = PostgresBus::connect(db_config)
                .await
                .context("Failed to connect to the Postgres bus")?;
            hub.attach_relay(Arc::new(bus));
        }
        None => info!("No database configured, running as a single node"),
    }

    let state = WsState {
        hub: hub.clone(),
        admin_key,
    };

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(run_websocket_server(bind_addr, state, async {
        let _ = stop_rx.await;
    }));

    info!(addr = %bind_addr, node_id = %hub.node_id(), "Cablecast starting");

    // Run server with graceful shutdown on signals
    tokio::select! {
        result = &mut server => {
            hub.shutdown().await;
            return result.context("Server task failed")?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server");
        }
    }

    hub.shutdown().await;
    let _ = stop_tx.send(());
    server.await.context("Server task failed")??;

    info!("Cablecast stopped");
    Ok(())
}

fn token(
    permissions: Vec<String>,
    patterns: Vec<String>,
    client_id: Option<String>,
    ttl: Option<u64>,
    secret: String,
) -> Result<()> {
    // Build grants
    let mut grants = GrantSet::new();

    for perm_str in &permissions {
        let grant_types = GrantType::parse_all(perm_str)
            .ok_or_else(|| anyhow::anyhow!("Invalid permission: {}", perm_str))?;

        for pattern_str in &patterns {
            let pattern = TopicPattern::parse(pattern_str)
                .with_context(|| format!("Invalid pattern: {}", pattern_str))?;

            for grant_type in &grant_types {
                grants.add(Grant::new(*grant_type, pattern.clone()));
            }
        }
    }

    let cid = client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let token = SubToken::create(cid.clone(), grants.clone(), ttl, secret.as_bytes())
        .context("Failed to create token")?;

    println!("{}", token);
    println!();
    println!("Client ID: {}", cid);
    if let Some(exp) = token.expires_at() {
        println!("Expires: {} (unix)", exp);
    }
    println!("Grants:");
    for grant in grants.grants() {
        println!("  {}", grant);
    }

    Ok(())
}

async fn publish(db_config: PostgresConfig, topic: String, payload: String) -> Result<()> {
    let topic = TopicName::parse(&topic).with_context(|| format!("Invalid topic: {}", topic))?;
    let payload: serde_json::Value = serde_json::from_str(&payload).context("Payload is not valid JSON")?;

    let bus = PostgresBus::connect(db_config)
        .await
        .context("Failed to connect to the Postgres bus")?;

    let envelope = Envelope {
        origin: NodeId::new(),
        topic: topic.to_string(),
        payload,
    };
    let bytes = serde_json::to_vec(&envelope)?;
    bus.publish(topic.as_str(), bytes)
        .await
        .context("Publish failed")?;

    println!("Published to {}", topic);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
}
