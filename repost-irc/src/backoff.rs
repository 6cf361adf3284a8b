//! Reconnect policy: exponential backoff with jitter and server rotation.

use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Configuration for automatic reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

/// Backoff state for one connection.
///
/// Each call to [`Backoff::next_delay`] returns the current delay and grows
/// it by `backoff_factor` plus up to a quarter of jitter, capped at
/// `max_delay`. [`Backoff::reset`] goes back to `initial_delay` after a
/// successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let delay = config.initial_delay;
        Self { config, delay }
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;

        let millis = current.as_millis() as u64;
        let jitter = rand_jitter(millis / 4);
        let grown = ((millis as f64 * self.config.backoff_factor) as u64).saturating_add(jitter);
        let max = self.config.max_delay.as_millis() as u64;
        self.delay = Duration::from_millis(grown.max(millis).min(max));

        current
    }

    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
    }
}

/// Random value in `0..=max`.
fn rand_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max)
}

/// Ordered, non-empty set of candidate servers, handed out round-robin.
#[derive(Debug, Clone)]
pub struct ServerPool {
    servers: Vec<String>,
    next: usize,
}

impl ServerPool {
    pub fn new(network: &str, servers: Vec<String>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::EmptyServerPool {
                network: network.to_string(),
            });
        }
        Ok(Self { servers, next: 0 })
    }

    /// The server for the next dial attempt.
    pub fn next_server(&mut self) -> &str {
        let idx = self.next;
        self.next = (self.next + 1) % self.servers.len();
        &self.servers[idx]
    }
}
