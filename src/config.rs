use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SOCKET_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(0, 0, 0, 0), 3100);

pub const DEFAULT_BPM: u32 = 120;
pub const MIN_BPM: u32 = 20;
pub const MAX_BPM: u32 = 300;

/// Recognized runtime options (spec.md §6 "Configuration"). Populated once from
/// the environment at startup and handed to handlers as `web::Data<Config>`
/// instead of read from ad-hoc `dotenvy::var` calls at every call site.
#[derive(Clone, Debug)]
pub struct Config {
    pub socket: (IpAddr, u16),
    pub is_prod: bool,
    pub approval_timeout: Duration,
    pub grace_period: Duration,
    pub batch_interval: Duration,
    pub max_queue_size: usize,
    pub max_concurrent_connections: usize,
    pub heartbeat_interval: Duration,
    pub default_bpm: u32,
    pub subscriber_buffer: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let is_prod = dotenvy::var("IS_PROD")
            .map(|s| s == "true")
            .unwrap_or(false);

        let socket = (
            IpAddr::from(
                Ipv4Addr::from_str(&dotenvy::var("HOST").unwrap_or_default())
                    .unwrap_or(DEFAULT_SOCKET_ADDR.0),
            ),
            dotenvy::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SOCKET_ADDR.1),
        );

        Self {
            socket,
            is_prod,
            approval_timeout: env_millis("APPROVAL_TIMEOUT_MS", 30_000),
            grace_period: env_millis("GRACE_PERIOD_MS", 30_000),
            batch_interval: env_millis("BATCH_INTERVAL_MS", 16),
            max_queue_size: env_usize("MAX_QUEUE_SIZE", 50),
            max_concurrent_connections: env_usize("MAX_CONCURRENT_CONNECTIONS", 1000),
            heartbeat_interval: env_millis("HEARTBEAT_INTERVAL_MS", 30_000),
            default_bpm: DEFAULT_BPM,
            subscriber_buffer: env_usize("SUBSCRIBER_SEND_BUFFER", 64),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: (IpAddr::from(DEFAULT_SOCKET_ADDR.0), DEFAULT_SOCKET_ADDR.1),
            is_prod: false,
            approval_timeout: Duration::from_millis(30_000),
            grace_period: Duration::from_millis(30_000),
            batch_interval: Duration::from_millis(16),
            max_queue_size: 50,
            max_concurrent_connections: 1000,
            heartbeat_interval: Duration::from_millis(30_000),
            default_bpm: DEFAULT_BPM,
            subscriber_buffer: 64,
        }
    }
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(
        dotenvy::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

fn env_usize(key: &str, default: usize) -> usize {
    dotenvy::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
