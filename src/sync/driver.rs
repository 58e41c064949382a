//! Async session driver.
//!
//! Runs one [`SyncSession`] per peer as an independent tokio task: dial,
//! feed frames and local ops in, carry actions out, and reconnect with
//! backoff until shut down or the peer is fenced.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::message::Message;
use super::peer::PeerRegistry;
use super::session::{SessionAction, SessionPhase, SyncSession};
use crate::config::{CodecConfig, SyncConfig};
use crate::core::{
    AuthorId, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD, Operation, SyncError, SyncReplica,
};

/// Frames queued between a stream reader task and the session loop.
const READ_QUEUE_DEPTH: usize = 64;

/// Shortest timer tick.
const MIN_TICK: Duration = Duration::from_millis(10);

/// A framed, bidirectional connection to one peer.
///
/// `recv` must be cancel-safe: the driver polls it inside `select!`.
pub trait Transport: Send {
    /// Send one complete frame.
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Next complete frame, or `None` once the peer closed.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, SyncError>> + Send;
}

/// Opens connections to one peer.
pub trait Connector: Send + Sync {
    /// Connection type.
    type Conn: Transport;

    /// Dial the peer.
    fn connect(&self) -> impl Future<Output = Result<Self::Conn, SyncError>> + Send;
}

/// In-process transport over a pair of channels.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Two connected ends.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SyncError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SyncError::Transport("channel closed".into()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.rx.recv().await)
    }
}

/// Transport over a byte stream (TCP, Unix socket, duplex pipe).
///
/// A reader task splits the stream into frames so `recv` stays cancel-safe.
pub struct StreamTransport<S> {
    writer: tokio::io::WriteHalf<S>,
    frames: mpsc::Receiver<io::Result<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        let (mut read_half, writer) = tokio::io::split(stream);
        let (tx, frames) = mpsc::channel(READ_QUEUE_DEPTH);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                }
            }
        });
        Self {
            writer,
            frames,
            reader,
        }
    }
}

impl<S> Drop for StreamTransport<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SyncError> {
        self.writer
            .write_all(&frame)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, SyncError> {
        match self.frames.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => Err(SyncError::Transport(err.to_string())),
            None => Ok(None),
        }
    }
}

/// Read one frame; `None` on clean EOF at a frame boundary.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let payload_len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {payload_len} bytes exceeds limit"),
        ));
    }
    let mut frame = vec![0u8; FRAME_HEADER_SIZE + payload_len];
    frame[..FRAME_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[FRAME_HEADER_SIZE..]).await?;
    Ok(Some(frame))
}

/// How a session run ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Shutdown was signalled.
    Shutdown,
    /// The session closed with an error.
    Closed {
        /// Why it closed.
        reason: SyncError,
        /// Whether the session reached `Synced` before closing.
        synced: bool,
    },
}

enum Event {
    Shutdown,
    Frame(Result<Option<Vec<u8>>, SyncError>),
    Feed(Result<Vec<Operation>, broadcast::error::RecvError>),
    Tick,
}

fn tick_interval(config: &SyncConfig) -> Duration {
    (config.idle_timeout / 6)
        .min(config.handshake_timeout / 2)
        .max(MIN_TICK)
}

/// Carry out actions; returns the close reason if one was requested.
async fn execute<T: Transport>(conn: &mut T, actions: Vec<SessionAction>) -> Option<SyncError> {
    for action in actions {
        match action {
            SessionAction::Send(msg) => {
                debug!(msg = msg.name(), "send");
                if let Err(err) = conn.send(msg.encode()).await {
                    return Some(err);
                }
            }
            SessionAction::Close(err) => return Some(err),
        }
    }
    None
}

/// Run an established session until it closes or shutdown is signalled.
async fn drive<R, T>(
    session: &mut SyncSession<R>,
    conn: &mut T,
    initial: Vec<SessionAction>,
    config: &SyncConfig,
    feed: &mut broadcast::Receiver<Vec<Operation>>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    R: SyncReplica + ?Sized,
    T: Transport,
{
    let mut synced = false;
    let mut feed_open = true;
    let mut tick = tokio::time::interval(tick_interval(config));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut pending = initial;
    let end = loop {
        if let Some(reason) = execute(conn, std::mem::take(&mut pending)).await {
            break SessionEnd::Closed { reason, synced };
        }
        synced |= session.phase() == SessionPhase::Synced;

        let event = tokio::select! {
            biased;
            changed = shutdown.changed() => match changed {
                Ok(()) if !*shutdown.borrow() => Event::Tick,
                _ => Event::Shutdown,
            },
            frame = conn.recv() => Event::Frame(frame),
            ops = feed.recv(), if feed_open => Event::Feed(ops),
            _ = tick.tick() => Event::Tick,
        };

        let now = Instant::now();
        pending = match event {
            Event::Shutdown => break SessionEnd::Shutdown,
            Event::Frame(Ok(Some(frame))) => session.handle_frame(&frame, now),
            Event::Frame(Ok(None)) => {
                break SessionEnd::Closed {
                    reason: SyncError::Transport("peer closed connection".into()),
                    synced,
                };
            }
            Event::Frame(Err(reason)) => break SessionEnd::Closed { reason, synced },
            Event::Feed(Ok(ops)) => match session.push_local(ops, now) {
                Ok(actions) => actions,
                // Queued in the session; acks resume pushing
                Err(SyncError::BackpressureExceeded { .. }) => Vec::new(),
                Err(reason) => break SessionEnd::Closed { reason, synced },
            },
            Event::Feed(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(skipped, "local op feed lagged; resyncing");
                match session.resync(now) {
                    Ok(actions) => actions,
                    Err(reason) => break SessionEnd::Closed { reason, synced },
                }
            }
            Event::Feed(Err(broadcast::error::RecvError::Closed)) => {
                feed_open = false;
                Vec::new()
            }
            Event::Tick => session.poll(now),
        };
    };
    session.disconnect();
    end
}

/// Dials one peer and keeps a session with it alive.
pub struct SessionDriver<R: SyncReplica + ?Sized, C> {
    replica: Arc<R>,
    registry: Arc<PeerRegistry>,
    connector: C,
    peer: AuthorId,
    config: SyncConfig,
    codec: CodecConfig,
}

impl<R, C> SessionDriver<R, C>
where
    R: SyncReplica + ?Sized + 'static,
    C: Connector,
{
    /// Driver for `peer`, reached through `connector`.
    pub fn new(
        replica: Arc<R>,
        registry: Arc<PeerRegistry>,
        connector: C,
        peer: AuthorId,
        config: SyncConfig,
        codec: CodecConfig,
    ) -> Self {
        Self {
            replica,
            registry,
            connector,
            peer,
            config,
            codec,
        }
    }

    /// Run until shutdown (`Ok`) or until the peer is fenced (`Err`).
    ///
    /// `feed` carries ops committed locally; each session pushes them to
    /// the peer. Every reconnect resumes from the exchanged version vectors.
    pub async fn run(
        self,
        mut feed: broadcast::Receiver<Vec<Operation>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let mut backoff = Backoff::new(&self.config);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.registry.ensure_not_fenced(self.peer)?;

            match self.session_once(&mut feed, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Closed {
                    reason: SyncError::PeerFault(fault),
                    ..
                }) => return Err(SyncError::PeerFault(fault)),
                Ok(SessionEnd::Closed { reason, synced }) => {
                    if synced {
                        backoff.reset();
                    }
                    warn!(peer = %self.peer, error = %reason, "sync session closed");
                }
                Err(err @ SyncError::PeerFault(_)) => return Err(err),
                Err(err) => warn!(peer = %self.peer, error = %err, "sync connect failed"),
            }

            let delay = backoff.next_delay();
            debug!(peer = %self.peer, attempt = backoff.attempts(), ?delay, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn session_once(
        &self,
        feed: &mut broadcast::Receiver<Vec<Operation>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, SyncError> {
        let mut conn = tokio::time::timeout(self.config.handshake_timeout, self.connector.connect())
            .await
            .map_err(|_| SyncError::Timeout("connect"))??;
        info!(peer = %self.peer, "connected");

        let mut session = SyncSession::outbound(
            Arc::clone(&self.replica),
            Arc::clone(&self.registry),
            self.peer,
            self.config.clone(),
            &self.codec,
        );
        let hello = session.connect(Instant::now())?;
        // Ops committed while disconnected travel in the catch-up stream
        *feed = feed.resubscribe();
        Ok(drive(&mut session, &mut conn, hello, &self.config, feed, shutdown).await)
    }
}

/// Serve one accepted connection until it closes or shutdown is signalled.
///
/// Returns the peer that connected (if it got as far as HELLO) and how the
/// session ended.
pub async fn serve_inbound<R, T>(
    replica: Arc<R>,
    registry: Arc<PeerRegistry>,
    mut conn: T,
    config: SyncConfig,
    codec: CodecConfig,
    mut feed: broadcast::Receiver<Vec<Operation>>,
    mut shutdown: watch::Receiver<bool>,
) -> (Option<AuthorId>, SessionEnd)
where
    R: SyncReplica + ?Sized,
    T: Transport,
{
    let mut session = SyncSession::inbound(replica, registry, config.clone(), &codec);
    let initial = match session.connect(Instant::now()) {
        Ok(actions) => actions,
        Err(reason) => {
            return (
                None,
                SessionEnd::Closed {
                    reason,
                    synced: false,
                },
            );
        }
    };
    let end = drive(&mut session, &mut conn, initial, &config, &mut feed, &mut shutdown).await;
    if let SessionEnd::Closed { reason, .. } = &end {
        info!(peer = ?session.peer(), error = %reason, "inbound session closed");
    }
    (session.peer(), end)
}
