//! Connection parameters and tunables for a [`Client`](crate::client::Client).

use std::time::Duration;

use crate::error::{Error, Result};

/// Delay between reconnect attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);
/// Capacity of the intent queue and of each session's inbound/outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// How long `QUIT` may take to reach the socket before the client stops anyway.
pub const DEFAULT_QUIT_GRACE: Duration = Duration::from_secs(2);
/// Longest inbound line accepted, tags included. Longer lines are discarded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8191;

/// Configuration for connecting to an IRC server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Nickname; also used as username and real name during registration.
    pub nick: String,
    /// Server host name or address.
    pub host: String,
    pub port: u16,
    /// Use TLS.
    pub tls: bool,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
    /// Fixed delay between (re)connect attempts.
    pub backoff: Duration,
    pub queue_capacity: usize,
    pub quit_grace: Duration,
    pub max_line_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nick: "ircord".to_string(),
            host: "127.0.0.1".to_string(),
            port: 6667,
            tls: false,
            tls_insecure: false,
            backoff: DEFAULT_BACKOFF,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            quit_grace: DEFAULT_QUIT_GRACE,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn new(nick: impl Into<String>, host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            nick: nick.into(),
            host: host.into(),
            port,
            tls,
            ..Self::default()
        }
    }

    /// `host:port`, as used for dialing and in logs.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject parameters no connection could ever work with.
    pub fn validate(&self) -> Result<()> {
        if self.nick.is_empty() {
            return Err(Error::Config("nick must not be empty".into()));
        }
        if self.nick.contains([' ', '\r', '\n', '\0']) {
            return Err(Error::Config(format!("nick {:?} contains whitespace", self.nick)));
        }
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_line_length < crate::irc::MAX_LINE_BYTES {
            return Err(Error::Config(format!(
                "max_line_length must be at least {}",
                crate::irc::MAX_LINE_BYTES
            )));
        }
        Ok(())
    }
}
