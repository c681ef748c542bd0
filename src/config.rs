use std::time::Duration;

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server listen port.
    pub port: u16,
    /// Server bind host.
    pub host: String,
    /// Messages buffered per connection before it counts as a slow consumer.
    pub outbound_queue_capacity: usize,
    /// Pending register/unregister/broadcast commands the hub will buffer.
    pub hub_queue_capacity: usize,
    /// Seconds a connection may stay silent before it is dropped.
    pub pong_wait_secs: u64,
    /// Broadcast `user_connected` / `user_disconnected` hub-wide.
    pub announce_presence: bool,
    /// Send an `error` event back to a client whose event was rejected.
    pub surface_errors: bool,
}

impl AppConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = AppConfig::default();
        AppConfig {
            port: env_parse("PORT").unwrap_or(defaults.port),
            host: std::env::var("HOST").unwrap_or(defaults.host),
            outbound_queue_capacity: env_parse("OUTBOUND_QUEUE_CAPACITY")
                .unwrap_or(defaults.outbound_queue_capacity),
            hub_queue_capacity: env_parse("HUB_QUEUE_CAPACITY")
                .unwrap_or(defaults.hub_queue_capacity),
            pong_wait_secs: env_parse("PONG_WAIT_SECS")
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.pong_wait_secs),
            announce_presence: env_flag("ANNOUNCE_PRESENCE").unwrap_or(defaults.announce_presence),
            surface_errors: env_flag("SURFACE_ERRORS").unwrap_or(defaults.surface_errors),
        }
    }

    /// Socket address string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Keepalive period: nine tenths of the read deadline.
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            port: 8080,
            host: "0.0.0.0".to_string(),
            outbound_queue_capacity: 256,
            hub_queue_capacity: 1024,
            pong_wait_secs: 60,
            announce_presence: false,
            surface_errors: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
