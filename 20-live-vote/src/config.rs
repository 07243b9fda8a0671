use std::{net::SocketAddr, time::Duration};

use crate::{cli::ServeArgs, counter::RetryPolicy, keys::Keyspace};

/// Runtime settings for the API server, resolved from flags and environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub retry: RetryPolicy,
    pub keys: Keyspace,
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            retry: RetryPolicy::default(),
            keys: Keyspace::default(),
            keep_alive: Duration::from_secs(15),
        }
    }
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            retry: RetryPolicy::new(args.max_attempts, Duration::from_millis(args.backoff_ms)),
            keys: Keyspace::new(args.key_root),
            keep_alive: Duration::from_secs(args.keep_alive_secs.max(1)),
        }
    }
}
