//! Reconnecting IRC client.
//!
//! This is the main entry point for SDK consumers. A [`Client`] owns one
//! logical IRC session: it dials the server, registers, keeps answering
//! `PING`, and when the connection drops it reconnects after a fixed backoff
//! and replays registration and channel joins. Commands go through a
//! cloneable [`ClientHandle`] and may be issued from any task.
//!
//! ## Event loop
//!
//! Everything a caller asks for, and every line the server sends, becomes an
//! intent on one bounded queue. A single task drains that queue, so
//! handler invocation and membership bookkeeping never race. While no
//! session is live, outbound messages wait (and the queue fills, suspending
//! callers) instead of being dropped.
//!
//! ```rust,no_run
//! use ircord_sdk::{Client, ClientConfig, Message};
//!
//! # async fn example() -> ircord_sdk::Result<()> {
//! let client = Client::new(ClientConfig::new("relay", "irc.libera.chat", 6697, true));
//! client
//!     .add_handler(|msg: &Message| {
//!         if msg.command == "PRIVMSG" {
//!             println!("{:?}: {:?}", msg.source_nick(), msg.params.last());
//!         }
//!     })
//!     .await?;
//! client.start().await?;
//! client.join("#ircord").await?;
//! client.message("#ircord", "hello").await?;
//! client.quit("bye").await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::irc::Message;
use crate::session::{Session, SessionLink};
use crate::state::ConnectionState;
use crate::supervisor::Supervisor;
use crate::transport;

/// Receives every inbound message except `PING`, on the event-loop task.
///
/// Handlers run synchronously and in registration order; a slow handler
/// stalls the whole client.
pub trait Handler: Send + 'static {
    fn on_message(&mut self, message: &Message);
}

impl<F> Handler for F
where
    F: FnMut(&Message) + Send + 'static,
{
    fn on_message(&mut self, message: &Message) {
        (*self)(message)
    }
}

/// One unit of work for the event loop.
pub(crate) enum Intent {
    Join(String),
    Message { target: String, text: String },
    /// `done` fires once the QUIT is on the wire or has been given up on.
    Quit { reason: String, done: oneshot::Sender<()> },
    AddHandler(Box<dyn Handler>),
    Inbound { generation: u64, message: Message },
}

/// A handle for issuing commands to a running [`Client`].
#[derive(Clone)]
pub struct ClientHandle {
    intents: mpsc::Sender<Intent>,
    state: watch::Receiver<ConnectionState>,
}

impl ClientHandle {
    /// Join `channel`. The channel is remembered and rejoined after every
    /// reconnect, in join order.
    pub async fn join(&self, channel: &str) -> Result<()> {
        self.send(Intent::Join(channel.to_string())).await
    }

    /// Send a `PRIVMSG`. `text` must already fit on one line; nothing is
    /// split or truncated here (see [`crate::irc::split_message`]).
    ///
    /// Returns once the event loop has accepted the message, not once it is
    /// written. A message handed to a session in the instant between its
    /// socket failing and the session being marked dead is lost with that
    /// session; anything later is held for the next one.
    pub async fn message(&self, target: &str, text: &str) -> Result<()> {
        self.send(Intent::Message {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// Send `QUIT` and shut the client down once it has been written.
    ///
    /// Waits until the QUIT has been flushed, or until the client gave up on
    /// it (no session within the quit grace period, or `close()` ran first).
    /// Calling [`Client::close`] afterwards therefore never cuts it off.
    /// Issued before [`Client::start`], it waits until the client has
    /// started and quit, or has been closed.
    pub async fn quit(&self, reason: &str) -> Result<()> {
        let (done, flushed) = oneshot::channel();
        self.send(Intent::Quit {
            reason: reason.to_string(),
            done,
        })
        .await?;
        // A dropped sender means the event loop stopped first.
        let _ = flushed.await;
        Ok(())
    }

    /// Register a handler after the client has started.
    pub async fn add_handler(&self, handler: impl Handler) -> Result<()> {
        self.send(Intent::AddHandler(Box::new(handler))).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn send(&self, intent: Intent) -> Result<()> {
        self.intents.send(intent).await.map_err(|_| Error::Closed)
    }
}

enum Lifecycle {
    Idle {
        intents: mpsc::Receiver<Intent>,
        handlers: Vec<Box<dyn Handler>>,
        state: watch::Sender<ConnectionState>,
    },
    Starting,
    Running {
        event_loop: JoinHandle<()>,
        supervisor: JoinHandle<std::io::Result<()>>,
    },
    Closed,
}

/// A reconnecting IRC client.
///
/// Commands issued before [`Client::start`] are queued (up to the queue
/// capacity) and run once the first session is up.
pub struct Client {
    config: ClientConfig,
    handle: ClientHandle,
    shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (intents_tx, intents) = mpsc::channel(config.queue_capacity.max(1));
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            handle: ClientHandle {
                intents: intents_tx,
                state: state_rx,
            },
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Idle {
                intents,
                handlers: Vec::new(),
                state,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Register a handler. Before `start()` it is added directly; afterwards
    /// it goes through the event loop like any other command.
    pub async fn add_handler(&self, handler: impl Handler) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match &mut *lifecycle {
                Lifecycle::Idle { handlers, .. } => {
                    handlers.push(Box::new(handler));
                    return Ok(());
                }
                Lifecycle::Closed => return Err(Error::Closed),
                Lifecycle::Starting | Lifecycle::Running { .. } => {}
            }
        }
        self.handle.add_handler(handler).await
    }

    pub async fn join(&self, channel: &str) -> Result<()> {
        self.handle.join(channel).await
    }

    pub async fn message(&self, target: &str, text: &str) -> Result<()> {
        self.handle.message(target, text).await
    }

    pub async fn quit(&self, reason: &str) -> Result<()> {
        self.handle.quit(reason).await
    }

    /// Connect and start the supervisor and event loop.
    ///
    /// Failing to establish this first connection is returned here, and the
    /// client stays startable. Every later connection failure is retried in
    /// the background.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;

        let (intents, handlers, state) = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Starting) {
                Lifecycle::Idle {
                    intents,
                    handlers,
                    state,
                } => (intents, handlers, state),
                Lifecycle::Closed => {
                    *lifecycle = Lifecycle::Closed;
                    return Err(Error::Closed);
                }
                other => {
                    *lifecycle = other;
                    return Err(Error::AlreadyStarted);
                }
            }
        };

        state.send_replace(ConnectionState::Connecting);
        tracing::info!(addr = %self.config.server_addr(), tls = self.config.tls, "Connecting");
        let conn = match transport::connect(&self.config).await {
            Ok(conn) => conn,
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                let mut lifecycle = self.lifecycle.lock();
                if matches!(*lifecycle, Lifecycle::Starting) {
                    *lifecycle = Lifecycle::Idle {
                        intents,
                        handlers,
                        state,
                    };
                }
                return Err(e);
            }
        };

        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Starting) {
            // close() ran while we were dialing.
            state.send_replace(ConnectionState::Stopped);
            return Err(Error::Closed);
        }

        let (session, inbound) = Session::start(conn, 1, &self.config, &self.shutdown);
        let (links, links_rx) = watch::channel(None);
        let supervisor = Supervisor {
            config: self.config.clone(),
            intents: self.handle.intents.clone(),
            links,
            state,
            shutdown: self.shutdown.clone(),
        };
        let event_loop = EventLoop {
            nick: self.config.nick.clone(),
            quit_grace: self.config.quit_grace,
            intents,
            links: links_rx,
            shutdown: self.shutdown.clone(),
            handlers,
            channels: Vec::new(),
            current: None,
        };

        let supervisor = tokio::spawn(supervisor.run(session, inbound));
        let event_loop = tokio::spawn(event_loop.run());
        *lifecycle = Lifecycle::Running {
            event_loop,
            supervisor,
        };
        Ok(())
    }

    /// Stop everything and wait for every task this client spawned.
    ///
    /// Safe to call more than once and from any task; later calls return
    /// `Ok(())` straight away. Returns the error from shutting down the
    /// socket, if any.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closed);
        let (event_loop, supervisor) = match previous {
            Lifecycle::Running {
                event_loop,
                supervisor,
            } => (event_loop, supervisor),
            Lifecycle::Idle { state, .. } => {
                state.send_replace(ConnectionState::Stopped);
                return Ok(());
            }
            Lifecycle::Starting | Lifecycle::Closed => return Ok(()),
        };

        if let Err(e) = event_loop.await {
            tracing::warn!(error = %e, "Event loop panicked");
        }
        let result = match supervisor.await {
            Ok(result) => result.map_err(Error::from),
            Err(e) => Err(Error::Io(std::io::Error::other(e))),
        };
        tracing::info!("Client closed");
        result
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Sole owner of handlers, membership and the current session link.
struct EventLoop {
    nick: String,
    quit_grace: Duration,
    intents: mpsc::Receiver<Intent>,
    links: watch::Receiver<Option<SessionLink>>,
    shutdown: CancellationToken,
    handlers: Vec<Box<dyn Handler>>,
    /// Joined channels in join order, duplicates kept; replayed on connect.
    channels: Vec<String>,
    current: Option<SessionLink>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            let flow = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Flow::Stop,
                changed = self.links.changed() => match changed {
                    Ok(()) => {
                        self.adopt_latest().await;
                        Flow::Continue
                    }
                    Err(_) => Flow::Stop,
                },
                intent = self.intents.recv() => match intent {
                    Some(intent) => self.handle(intent).await,
                    None => Flow::Stop,
                },
            };
            if flow == Flow::Stop {
                break;
            }
        }

        // Later commands fail with `Error::Closed` instead of queueing forever.
        self.intents.close();
        tracing::debug!("Event loop stopped");
    }

    async fn handle(&mut self, intent: Intent) -> Flow {
        match intent {
            Intent::Inbound {
                generation,
                message,
            } => {
                self.dispatch(generation, message).await;
                Flow::Continue
            }
            Intent::AddHandler(handler) => {
                self.handlers.push(handler);
                Flow::Continue
            }
            Intent::Join(channel) => {
                self.channels.push(channel.clone());
                // While disconnected the replay on the next session covers it.
                if let Some(link) = self.current.clone() {
                    self.send_on(&link, Message::new("JOIN", [channel])).await;
                }
                Flow::Continue
            }
            Intent::Message { target, text } => {
                self.deliver(Message::new("PRIVMSG", [target, text])).await
            }
            Intent::Quit { reason, done } => {
                self.quit(reason).await;
                let _ = done.send(());
                Flow::Stop
            }
        }
    }

    async fn dispatch(&mut self, generation: u64, message: Message) {
        if message.command == "PING" {
            let link = match &self.current {
                Some(link) if link.generation == generation => link.clone(),
                _ => {
                    tracing::debug!(generation, "Ignoring PING from a session that is gone");
                    return;
                }
            };
            let pong = Message::new("PONG", message.params.into_iter().take(1));
            self.send_on(&link, pong).await;
            return;
        }

        for handler in &mut self.handlers {
            handler.on_message(&message);
        }
    }

    /// Make the most recently published session current and register on it.
    async fn adopt_latest(&mut self) {
        let latest = self.links.borrow_and_update().clone();
        let Some(link) = latest else {
            self.current = None;
            return;
        };
        if link.is_dead() {
            self.current = None;
            return;
        }
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.generation == link.generation)
        {
            return;
        }

        tracing::debug!(
            generation = link.generation,
            channels = self.channels.len(),
            "Registering on new session"
        );
        self.current = Some(link.clone());
        let mut replay = vec![
            Message::new("NICK", [self.nick.as_str()]),
            Message::new("USER", [self.nick.as_str(), "0", "*", self.nick.as_str()]),
        ];
        replay.extend(
            self.channels
                .iter()
                .map(|channel| Message::new("JOIN", [channel.as_str()])),
        );
        for message in replay {
            if !self.send_on(&link, message).await {
                break;
            }
        }
    }

    /// Write to one specific session; a dead session is forgotten.
    async fn send_on(&mut self, link: &SessionLink, message: Message) -> bool {
        if link.is_dead() {
            self.forget(link);
            return false;
        }
        let sent = tokio::select! {
            _ = self.shutdown.cancelled() => return false,
            sent = link.outbound.send(message) => sent,
        };
        if sent.is_err() {
            self.forget(link);
            return false;
        }
        true
    }

    /// Drop `link` if it is still the current session.
    fn forget(&mut self, link: &SessionLink) {
        tracing::debug!(generation = link.generation, "Session gone, waiting for the next one");
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.generation == link.generation)
        {
            self.current = None;
        }
    }

    /// Send on the current session, waiting for the next one if there is
    /// none. Only shutdown makes this give up on `message`.
    async fn deliver(&mut self, mut message: Message) -> Flow {
        loop {
            if !self.wait_for_session().await {
                return Flow::Stop;
            }
            let Some(link) = self.current.clone() else {
                continue;
            };
            if link.is_dead() {
                self.forget(&link);
                continue;
            }
            let sent = tokio::select! {
                _ = self.shutdown.cancelled() => return Flow::Stop,
                sent = link.outbound.send(message) => sent,
            };
            match sent {
                Ok(()) => return Flow::Continue,
                Err(mpsc::error::SendError(returned)) => {
                    tracing::debug!(generation = link.generation, "Session gone, holding message");
                    message = returned;
                    self.current = None;
                }
            }
        }
    }

    /// Wait until a live session is current. `false` on shutdown.
    async fn wait_for_session(&mut self) -> bool {
        while self.current.is_none() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                changed = self.links.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    self.adopt_latest().await;
                }
            }
        }
        true
    }

    async fn quit(&mut self, reason: String) {
        if let Some(link) = self.current.clone()
            && link.is_dead()
        {
            self.forget(&link);
        }
        if self.current.is_none() {
            // Give a pending (re)connect a chance to carry the QUIT.
            let _ = tokio::time::timeout(self.quit_grace, self.wait_for_session()).await;
        }
        match self.current.take() {
            Some(link) => {
                let quit = Message::new("QUIT", [reason]);
                let sent = tokio::select! {
                    _ = self.shutdown.cancelled() => false,
                    sent = link.outbound.send(quit) => sent.is_ok(),
                };
                // The writer closes its queue right after writing QUIT.
                if sent
                    && tokio::time::timeout(self.quit_grace, link.outbound.closed())
                        .await
                        .is_err()
                {
                    tracing::warn!(generation = link.generation, "QUIT not flushed before grace period");
                }
            }
            None => tracing::info!("Quit requested while disconnected"),
        }
        tracing::info!("Quitting");
        self.shutdown.cancel();
    }
}
