//! Server configuration.

use std::time::Duration;

/// Tunables for the realtime server and its components.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Window in which a new connection must send `authenticate`
    pub auth_timeout: Duration,
    /// Upper bound on one call to the external session authority
    pub authority_timeout: Duration,
    /// How long a validated session is served from the local cache
    pub session_cache_ttl: Duration,
    /// Inactivity window after which a typing indicator is cleared
    pub typing_timeout: Duration,
    /// Maximum queued events per offline user (oldest evicted first)
    pub offline_queue_capacity: usize,
    /// Queues whose oldest entry is older than this are purged
    pub offline_max_age: Duration,
    /// Period of the background sweep (offline queues, session cache)
    pub sweep_interval: Duration,
    /// Outbound queue capacity per connection; a subscriber that falls this
    /// far behind has further events dropped (logged, never fails the sender)
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            auth_timeout: Duration::from_secs(5),
            authority_timeout: Duration::from_secs(5),
            session_cache_ttl: Duration::from_secs(15 * 60),
            typing_timeout: Duration::from_secs(3),
            offline_queue_capacity: 100,
            offline_max_age: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            outbound_buffer: 256,
        }
    }
}
