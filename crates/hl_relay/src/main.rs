use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use hl_relay::{server, Relay, RelayConfig, RelayError, SessionRegistry};

#[derive(Parser, Debug)]
#[command(author, version, about = "Hushline ciphertext relay")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "HL_RELAY_BIND")]
    bind: Option<String>,

    /// Lifetime of seeded sessions, in seconds.
    #[arg(long)]
    session_ttl_secs: Option<u64>,

    /// Accept a session token, as `user:token`. Repeatable.
    #[arg(long = "session", value_name = "USER:TOKEN")]
    sessions: Vec<String>,

    /// Optional JSON config file; flags override it.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => RelayConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.bind = bind.clone();
    }
    if let Some(ttl) = cli.session_ttl_secs {
        config.session_ttl_secs = ttl;
    }
    config.sessions.extend(cli.sessions.iter().cloned());
    Ok(config)
}

fn seed_sessions(registry: &SessionRegistry, config: &RelayConfig) -> Result<()> {
    let expires_at = chrono::Utc::now() + Duration::seconds(config.session_ttl_secs as i64);
    for seed in &config.sessions {
        let (user, token) = seed
            .split_once(':')
            .filter(|(u, t)| !u.is_empty() && !t.is_empty())
            .ok_or_else(|| RelayError::BadSessionSeed(seed.clone()))?;
        registry.insert(token, user, expires_at);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hl_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let registry = Arc::new(SessionRegistry::new());
    seed_sessions(&registry, &config)?;
    let relay = Relay::new(registry.clone());

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(bind = %config.bind, sessions = registry.len(), "relay listening");

    let purge = registry.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            let purged = purge.purge_expired();
            if purged > 0 {
                tracing::info!(purged, "expired sessions removed");
            }
        }
    });

    tokio::select! {
        res = server::serve(listener, relay) => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
