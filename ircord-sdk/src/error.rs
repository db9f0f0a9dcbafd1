//! Error types surfaced by the SDK.

use thiserror::Error;

/// Errors a caller can observe from [`Client`](crate::client::Client) and
/// [`ClientHandle`](crate::client::ClientHandle).
///
/// Everything that goes wrong inside a live session (read, write, parse,
/// encode) is logged and recovered internally; only these reach the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// The [`ClientConfig`](crate::config::ClientConfig) is unusable.
    #[error("invalid config: {0}")]
    Config(String),

    /// TCP connect (including name resolution) failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS setup or handshake failed.
    #[error("TLS handshake with {addr} failed: {reason}")]
    Tls { addr: String, reason: String },

    /// Socket error while shutting the client down.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client has quit or been closed; the command was not queued.
    #[error("client is closed")]
    Closed,

    /// `start()` was called on a client that is already running.
    #[error("client already started")]
    AlreadyStarted,
}

/// Why a wire line could not be turned into a [`Message`](crate::irc::Message).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("empty prefix")]
    EmptyPrefix,
    #[error("missing command")]
    MissingCommand,
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
}

/// Why a [`Message`](crate::irc::Message) could not be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
    #[error("parameter {index} contains CR, LF or NUL")]
    ForbiddenByte { index: usize },
    #[error("middle parameter {index} is empty, contains a space or starts with ':'")]
    InvalidMiddle { index: usize },
    #[error("encoded line is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
