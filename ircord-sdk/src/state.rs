//! Connection state published by the supervisor for observers.

/// Where the supervisor's state machine currently is.
///
/// Purely informational: commands are accepted in every state except
/// `Stopped`, and are held back (with backpressure) while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live session; a reconnect is pending after the backoff interval.
    Disconnected,
    /// Dialing the server.
    Connecting,
    /// A session is live. `generation` counts successful connects from 1.
    Connected { generation: u64 },
    /// Shut down by `quit()` or `close()`. Final.
    Stopped,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}
