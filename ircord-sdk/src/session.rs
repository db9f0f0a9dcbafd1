//! One live connection and its two pumps.
//!
//! The reader pump turns socket lines into [`Message`]s on the inbound queue;
//! the writer pump drains the outbound queue onto the socket. Either pump
//! exiting kills the session: the shared death token is cancelled, the reader
//! stops, and the inbound queue closes. That closure is how the supervisor
//! learns the session is gone.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::irc::Message;
use crate::transport::Connection;

/// Upper bound on the graceful close of the write side.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Cheap handle the event loop uses to write to one particular session.
#[derive(Debug, Clone)]
pub struct SessionLink {
    /// Increases by one per successful connect; never reused.
    pub generation: u64,
    pub outbound: mpsc::Sender<Message>,
    pub(crate) dead: CancellationToken,
}

impl SessionLink {
    /// `true` once either pump has stopped. A message queued after that is
    /// never written.
    pub fn is_dead(&self) -> bool {
        self.dead.is_cancelled() || self.outbound.is_closed()
    }
}

/// A live connection, owned by the supervisor. The inbound queue is handed
/// out separately at spawn time so it can be drained by another task.
pub struct Session {
    generation: u64,
    outbound: mpsc::Sender<Message>,
    dead: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<io::Result<()>>,
}

impl Session {
    /// Start pumps on a freshly dialed connection.
    pub fn start(
        conn: Connection,
        generation: u64,
        config: &ClientConfig,
        shutdown: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (capacity, max_line) = (config.queue_capacity, config.max_line_length);
        match conn {
            Connection::Plain(tcp) => Self::spawn(tcp, generation, capacity, max_line, shutdown),
            Connection::Tls(tls) => Self::spawn(*tls, generation, capacity, max_line, shutdown),
        }
    }

    /// Start pumps on any byte stream. The session dies on its own when the
    /// stream fails, or when `shutdown` is cancelled.
    pub fn spawn<S>(
        stream: S,
        generation: u64,
        capacity: usize,
        max_line_length: usize,
        shutdown: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Message>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (inbound_tx, inbound) = mpsc::channel(capacity);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let dead = shutdown.child_token();

        let reader = tokio::spawn(read_pump(
            read_half,
            inbound_tx,
            dead.clone(),
            generation,
            max_line_length,
        ));
        let writer = tokio::spawn(write_pump(
            BufWriter::new(write_half),
            outbound_rx,
            dead.clone(),
            generation,
        ));

        let session = Self {
            generation,
            outbound,
            dead,
            reader,
            writer,
        };
        (session, inbound)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn link(&self) -> SessionLink {
        SessionLink {
            generation: self.generation,
            outbound: self.outbound.clone(),
            dead: self.dead.clone(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.is_cancelled()
    }

    /// Resolves once either pump has given up (or shutdown was requested).
    /// The reader drops the inbound queue's sender on its way out, so the
    /// queue closes as soon as any buffered messages are drained.
    pub async fn closed(&self) {
        self.dead.cancelled().await
    }

    /// Kill the session (if still alive) and wait for both pumps.
    ///
    /// Returns the outcome of shutting down the socket's write side.
    pub async fn finish(self) -> io::Result<()> {
        self.dead.cancel();
        drop(self.outbound);
        if let Err(e) = self.reader.await {
            tracing::warn!(generation = self.generation, error = %e, "Reader pump panicked");
        }
        match self.writer.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

/// Newline framing for the reader pump.
///
/// Over-long lines and lines that are not UTF-8 are dropped here, so one bad
/// line never ends the stream.
struct LineCodec {
    lines: LinesCodec,
    generation: u64,
}

impl LineCodec {
    fn new(max_line_length: usize, generation: u64) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_length),
            generation,
        }
    }

    fn skip_bad_lines<F>(&mut self, buf: &mut BytesMut, mut step: F) -> io::Result<Option<String>>
    where
        F: FnMut(&mut LinesCodec, &mut BytesMut) -> Result<Option<String>, LinesCodecError>,
    {
        loop {
            match step(&mut self.lines, buf) {
                Ok(line) => return Ok(line),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(
                        generation = self.generation,
                        limit = self.lines.max_length(),
                        "Discarding over-long line"
                    );
                }
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(generation = self.generation, error = %e, "Discarding non-UTF-8 line");
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            }
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        self.skip_bad_lines(buf, LinesCodec::decode)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        self.skip_bad_lines(buf, LinesCodec::decode_eof)
    }
}

async fn read_pump<R>(
    reader: R,
    inbound: mpsc::Sender<Message>,
    dead: CancellationToken,
    generation: u64,
    max_line_length: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LineCodec::new(max_line_length, generation));

    loop {
        let line = tokio::select! {
            _ = dead.cancelled() => break,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::warn!(generation, error = %e, "Read failed");
                break;
            }
            None => {
                tracing::info!(generation, "Server closed the connection");
                break;
            }
        };

        let msg = match Message::parse(&line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(generation, error = %e, line = %line, "Dropping unparsable line");
                continue;
            }
        };
        tracing::trace!(generation, %msg, "<-");

        tokio::select! {
            _ = dead.cancelled() => break,
            sent = inbound.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    dead.cancel();
}

async fn write_line<W>(writer: &mut BufWriter<W>, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn write_pump<W>(
    mut writer: BufWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
    dead: CancellationToken,
    generation: u64,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = dead.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let line = match msg.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(generation, error = %e, command = %msg.command, "Dropping unencodable message");
                continue;
            }
        };

        // A peer that stops reading must not pin the session open.
        let written = tokio::select! {
            _ = dead.cancelled() => {
                tracing::debug!(generation, "Session killed with a write in flight");
                return Ok(());
            }
            written = write_line(&mut writer, &line) => written,
        };
        if let Err(e) = written {
            tracing::warn!(generation, error = %e, "Write failed");
            dead.cancel();
            return Ok(());
        }
        tracing::trace!(generation, %msg, "->");

        if msg.command == "QUIT" {
            tracing::debug!(generation, "QUIT written, closing outbound queue");
            outbound.close();
            break;
        }
    }

    dead.cancel();
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(generation, "Socket shutdown timed out");
            Err(io::Error::new(io::ErrorKind::TimedOut, "socket shutdown timed out"))
        }
    }
}
