//! Keeps one session alive: reconnects with a fixed backoff after every loss.
//!
//! Each new session is announced to the event loop on a `watch` channel; the
//! event loop replays `NICK`/`USER` and the channel joins itself, since it is
//! the sole owner of the membership list. Inbound traffic is moved onto the
//! intent queue by a per-session forwarder task, so a full intent queue never
//! stops the supervisor from noticing a dead session and reconnecting.

use std::io;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Intent;
use crate::config::ClientConfig;
use crate::irc::Message;
use crate::session::{Session, SessionLink};
use crate::state::ConnectionState;
use crate::transport;

pub(crate) struct Supervisor {
    pub(crate) config: ClientConfig,
    pub(crate) intents: mpsc::Sender<Intent>,
    pub(crate) links: watch::Sender<Option<SessionLink>>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) shutdown: CancellationToken,
}

impl Supervisor {
    /// Run until shutdown, starting from the session `start()` connected.
    ///
    /// Returns the result of shutting down the last session's socket.
    pub(crate) async fn run(
        self,
        first: Session,
        first_inbound: mpsc::Receiver<Message>,
    ) -> io::Result<()> {
        let addr = self.config.server_addr();
        let mut generation = first.generation();
        let mut next = Some((first, first_inbound));
        let mut forwarder: Option<JoinHandle<()>> = None;

        let result = loop {
            let (session, inbound) = match next.take() {
                Some(pair) => pair,
                None => match self.reconnect(generation + 1).await {
                    Some(pair) => pair,
                    None => break Ok(()),
                },
            };
            generation = session.generation();

            // Publish before forwarding so the event loop knows the session
            // before it sees any of its traffic.
            self.links.send_replace(Some(session.link()));
            self.state.send_replace(ConnectionState::Connected { generation });
            tracing::info!(generation, addr = %addr, "Session established");

            forwarder = Some(tokio::spawn(forward_inbound(
                inbound,
                self.intents.clone(),
                generation,
                forwarder.take(),
                self.shutdown.clone(),
            )));

            session.closed().await;
            self.links.send_replace(None);
            let outcome = session.finish().await;
            if self.shutdown.is_cancelled() {
                break outcome;
            }
            if let Err(e) = outcome {
                tracing::debug!(generation, error = %e, "Socket shutdown after session loss failed");
            }

            self.state.send_replace(ConnectionState::Disconnected);
            tracing::warn!(
                generation,
                backoff_secs = self.config.backoff.as_secs_f64(),
                "Session lost, reconnecting after backoff"
            );
            if !self.backoff().await {
                break Ok(());
            }
        };

        if let Some(forwarder) = forwarder
            && let Err(e) = forwarder.await
        {
            tracing::warn!(error = %e, "Inbound forwarder panicked");
        }
        self.links.send_replace(None);
        self.state.send_replace(ConnectionState::Stopped);
        tracing::info!(addr = %addr, "Supervisor stopped");
        result
    }

    /// Dial until it works or shutdown is requested.
    async fn reconnect(&self, generation: u64) -> Option<(Session, mpsc::Receiver<Message>)> {
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                attempt = transport::connect(&self.config) => attempt,
            };
            match attempt {
                Ok(conn) => {
                    return Some(Session::start(conn, generation, &self.config, &self.shutdown));
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        backoff_secs = self.config.backoff.as_secs_f64(),
                        "Reconnect failed, retrying"
                    );
                    self.state.send_replace(ConnectionState::Disconnected);
                    if !self.backoff().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep for the backoff interval. `false` if shutdown cut it short.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.backoff) => true,
        }
    }
}

/// Move one session's inbound messages onto the intent queue.
///
/// Waits for the previous session's forwarder first, so inbound order holds
/// across a reconnect even when the old backlog is still draining.
async fn forward_inbound(
    mut inbound: mpsc::Receiver<Message>,
    intents: mpsc::Sender<Intent>,
    generation: u64,
    previous: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let sent = tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = intents.send(Intent::Inbound { generation, message }) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
    tracing::debug!(generation, "Inbound forwarder finished");
}
