//! Self-healing IRC client core.
//!
//! Owns one TCP session per network, frames and parses the line protocol,
//! and reconnects on any I/O or protocol failure. Collaborators see three
//! things: an [`Inbound`] stream of parsed messages, a [`ConnectionHandle`]
//! to queue outbound messages (and force a reconnect), and a stream of
//! lifecycle [`Event`]s.
//!
//! ```rust,no_run
//! use repost_irc::{ConnectConfig, Message, connect};
//!
//! # async fn example() -> repost_irc::Result<()> {
//! let config = ConnectConfig::new(
//!     "libera",
//!     vec!["irc.libera.chat:6667".into()],
//!     "repost",
//!     "repost",
//!     "repost bot",
//! );
//! let (handle, mut inbound, _events) = connect(config)?;
//! while let Some(msg) = inbound.recv().await {
//!     if msg.command == "PING" {
//!         handle.send(Message::pong(msg.trailing.as_deref())).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod connection;
pub mod error;
pub mod event;
pub mod message;
pub mod transport;

pub use backoff::ReconnectConfig;
pub use connection::{ConnectConfig, ConnectionHandle, Inbound, connect};
pub use error::{Error, Result};
pub use event::{ConnectionState, Event};
pub use message::{Message, Origin, ParseError};
