//! Parley realtime server — WebSocket chat endpoint.
//!
//! Wires the `parley-realtime` core to an in-memory store and a
//! file-seeded session authority. Every setting can come from a flag or a
//! `PARLEY_*` environment variable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use parley_realtime::{ChatServer, MemoryStore, ServerConfig, StaticAuthority};

#[derive(Debug, Parser)]
#[command(name = "parley-server", version, about = "Realtime chat server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "PARLEY_BIND_ADDR", default_value = "127.0.0.1:9090")]
    bind_addr: String,

    /// JSON array of `{token, userId, username, expiresAt?}` session seeds
    #[arg(long, env = "PARLEY_TOKENS")]
    tokens: Option<PathBuf>,

    /// Seconds a new connection has to authenticate
    #[arg(long, env = "PARLEY_AUTH_TIMEOUT_SECS", default_value_t = 5)]
    auth_timeout_secs: u64,

    /// Seconds to wait for the session authority before failing closed
    #[arg(long, env = "PARLEY_AUTHORITY_TIMEOUT_SECS", default_value_t = 5)]
    authority_timeout_secs: u64,

    /// Seconds a validated session is served from cache
    #[arg(long, env = "PARLEY_SESSION_CACHE_TTL_SECS", default_value_t = 900)]
    session_cache_ttl_secs: u64,

    /// Milliseconds of inactivity before a typing indicator clears
    #[arg(long, env = "PARLEY_TYPING_TIMEOUT_MS", default_value_t = 3000)]
    typing_timeout_ms: u64,

    /// Maximum queued events per offline user
    #[arg(long, env = "PARLEY_OFFLINE_QUEUE_CAPACITY", default_value_t = 100)]
    offline_queue_capacity: usize,

    /// Hours an offline queue is kept
    #[arg(long, env = "PARLEY_OFFLINE_MAX_AGE_HOURS", default_value_t = 24)]
    offline_max_age_hours: u64,

    /// Seconds between background sweeps
    #[arg(
        long,
        env = "PARLEY_SWEEP_INTERVAL_SECS",
        default_value_t = 600,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    sweep_interval_secs: u64,

    /// Outbound queue capacity per connection
    #[arg(long, env = "PARLEY_OUTBOUND_BUFFER", default_value_t = 256)]
    outbound_buffer: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            authority_timeout: Duration::from_secs(self.authority_timeout_secs),
            session_cache_ttl: Duration::from_secs(self.session_cache_ttl_secs),
            typing_timeout: Duration::from_millis(self.typing_timeout_ms),
            offline_queue_capacity: self.offline_queue_capacity,
            offline_max_age: Duration::from_secs(self.offline_max_age_hours * 3600),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            outbound_buffer: self.outbound_buffer,
        }
    }

    fn authority(&self) -> Result<StaticAuthority, Box<dyn std::error::Error>> {
        let Some(path) = &self.tokens else {
            log::warn!("No session seed file given; every token will be rejected");
            return Ok(StaticAuthority::new());
        };
        let json = std::fs::read_to_string(path)?;
        let authority = StaticAuthority::from_json(&json)?;
        info!("Loaded {} sessions from {}", authority.len(), path.display());
        Ok(authority)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let authority = Arc::new(args.authority()?);
    let server = ChatServer::new(args.server_config(), authority, Arc::new(MemoryStore::new()));

    info!("Starting Parley realtime server on {}...", server.bind_addr());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            server.shutdown();
            // Let connection tasks write their close frames.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let stats = server.stats();
            info!(
                "Stopped after {} connections and {} routed messages",
                stats.total_connections, stats.messages_routed
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let args = Args::parse_from(["parley-server"]);
        let config = args.server_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.auth_timeout, defaults.auth_timeout);
        assert_eq!(config.typing_timeout, defaults.typing_timeout);
        assert_eq!(config.offline_queue_capacity, defaults.offline_queue_capacity);
        assert_eq!(config.offline_max_age, defaults.offline_max_age);
        assert_eq!(config.sweep_interval, defaults.sweep_interval);
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "parley-server",
            "--bind-addr",
            "0.0.0.0:7000",
            "--typing-timeout-ms",
            "500",
            "--offline-queue-capacity",
            "10",
        ]);
        let config = args.server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.typing_timeout, Duration::from_millis(500));
        assert_eq!(config.offline_queue_capacity, 10);
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let result = Args::try_parse_from(["parley-server", "--sweep-interval-secs", "0"]);
        assert!(result.is_err());

        let args = Args::try_parse_from(["parley-server", "--sweep-interval-secs", "1"]).unwrap();
        assert_eq!(args.server_config().sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_seed_file_is_an_error() {
        let args = Args::parse_from(["parley-server", "--tokens", "/nonexistent/tokens.json"]);
        assert!(args.authority().is_err());
    }
}
