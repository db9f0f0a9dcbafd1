//! ircord-sdk: a self-healing IRC client core.
//!
//! A [`Client`] keeps one logical IRC session alive across reconnects: it
//! registers, answers `PING`, rejoins channels after every reconnect, and
//! fans inbound messages out to registered [`Handler`]s. Formatting and
//! bridging to other networks is left to the caller.

pub mod client;
pub mod config;
pub mod error;
pub mod irc;
pub mod session;
pub mod state;
mod supervisor;
pub mod transport;

pub use client::{Client, ClientHandle, Handler};
pub use config::ClientConfig;
pub use error::{EncodeError, Error, ParseError, Result};
pub use irc::Message;
pub use state::ConnectionState;
