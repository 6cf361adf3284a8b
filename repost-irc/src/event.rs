//! Status notifications emitted by the connection lifecycle.

use std::fmt;
use std::time::Duration;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No generation is live; a reconnect is pending.
    Disconnected,
    /// Dialing a server.
    Connecting,
    /// Sender and Receiver of the current generation are running.
    Connected,
    /// Tearing down the current generation.
    Draining,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Events the lifecycle emits to observers (operators, collaborators, tests).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// About to dial `server`. `attempt` counts consecutive tries since the
    /// last successful connect, starting at 1.
    Dialing {
        server: String,
        attempt: u32,
    },

    /// Dial failed; the next attempt starts after `retry_in`.
    DialFailed {
        server: String,
        error: String,
        retry_in: Duration,
    },

    /// A new generation is live and registration has been queued.
    Connected {
        server: String,
        generation: u64,
    },

    /// A failure signal was accepted for `generation`.
    Draining {
        generation: u64,
        reason: String,
    },

    /// Generation torn down. `dropped` outbound messages were discarded.
    Disconnected {
        generation: u64,
        dropped: usize,
    },
}
