//! Persistent WebSocket to the tenant's command channel.
//!
//! A supervisor task owns the socket. It reconnects after any closure it did
//! not ask for, backing off exponentially between attempts, and fans inbound
//! frames out to subscribers over a broadcast channel.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use setpoint_proto::{parse_frame, ChannelFrame};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::config::EditorConfig;
use crate::error::{ChannelError, ConfigError};

/// Close reason sent when the client itself ends the connection.
pub const SHUTDOWN_REASON: &str = "client shutting down";

const FRAME_BUFFER: usize = 64;
const CLOSE_HANDSHAKE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Delay between reconnect attempts: `base * 2^(attempt - 1)` capped at
/// `max`, plus up to `jitter` of random slack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    pub fn constant(interval: Duration) -> Self {
        Self {
            base: interval,
            max: interval,
            jitter: Duration::ZERO,
        }
    }

    /// `attempt` counts from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exponent).min(self.max);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

struct Shared {
    url: Url,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    frames: broadcast::Sender<ChannelFrame>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    retry_count: AtomicU32,
    live_sockets: AtomicUsize,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                target = "setpoint::channel",
                from = ?previous,
                to = ?next,
                "connection state changed"
            );
        }
    }

    fn dispatch(&self, text: &str) {
        match parse_frame(text) {
            Ok(frame) => {
                trace!(target = "setpoint::channel", kind = frame.kind(), "frame received");
                // no subscribers is fine
                let _ = self.frames.send(frame);
            }
            Err(err) => {
                warn!(
                    target = "setpoint::channel",
                    error = %err,
                    len = text.len(),
                    "dropping malformed frame"
                );
            }
        }
    }
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One logical connection to `<api>/ws/<tenant>`. At most one socket is live
/// at any time.
pub struct CommandChannel {
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

impl CommandChannel {
    pub fn new(url: Url, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Self {
            shared: Arc::new(Shared {
                url,
                policy,
                state,
                frames,
                outbound: Mutex::new(None),
                retry_count: AtomicU32::new(0),
                live_sockets: AtomicUsize::new(0),
            }),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    pub fn for_tenant(config: &EditorConfig, tenant: Uuid) -> Result<Self, ConfigError> {
        Ok(Self::new(config.channel_url(tenant)?, config.reconnect))
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Starts connecting in the background. An existing connection is closed first.
    pub async fn open(&self) {
        let mut slot = self.supervisor.lock().await;
        if let Some(previous) = slot.take() {
            stop(&self.shared, previous).await;
        }
        self.shared.retry_count.store(0, Ordering::Relaxed);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(supervise(shared, shutdown_rx));
        *slot = Some(Supervisor { shutdown, task });
    }

    /// Closes the socket with a normal close frame and stops reconnecting.
    pub async fn close(&self) {
        let mut slot = self.supervisor.lock().await;
        if let Some(previous) = slot.take() {
            stop(&self.shared, previous).await;
        }
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        let state = self.state();
        if state != ConnectionState::Open {
            warn!(target = "setpoint::channel", ?state, "send on a channel that is not open");
            return Err(ChannelError::NotOpen(state));
        }
        let guard = self.shared.outbound.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text.into()))
                .map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::NotOpen(state)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelFrame> {
        self.shared.frames.subscribe()
    }

    /// Runs `handler` for every inbound frame until the channel is dropped.
    pub fn on_message<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(ChannelFrame) + Send + 'static,
    {
        let mut frames = self.subscribe();
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => handler(frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = "setpoint::channel", skipped, "message handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Reconnect attempts scheduled since the last `open`.
    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::Relaxed)
    }

    pub fn live_sockets(&self) -> usize {
        self.shared.live_sockets.load(Ordering::Relaxed)
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.task.abort();
        }
    }
}

async fn stop(shared: &Shared, supervisor: Supervisor) {
    supervisor.shutdown.send_replace(true);
    if let Err(err) = supervisor.task.await {
        if !err.is_cancelled() {
            warn!(target = "setpoint::channel", error = %err, "channel supervisor panicked");
        }
    }
    *shared.outbound.lock() = None;
    shared.set_state(ConnectionState::Closed);
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // a dropped sender counts as a request
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum Ended {
    Shutdown,
    Dropped,
}

async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        shared.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            result = connect_async(shared.url.as_str()) => result,
        };

        match connected {
            Ok((stream, _)) => {
                attempt = 0;
                shared.live_sockets.fetch_add(1, Ordering::SeqCst);
                info!(target = "setpoint::channel", url = %shared.url, "channel open");
                let ended = run_connection(&shared, stream, &mut shutdown).await;
                *shared.outbound.lock() = None;
                shared.live_sockets.fetch_sub(1, Ordering::SeqCst);
                if matches!(ended, Ended::Shutdown) {
                    break;
                }
                warn!(target = "setpoint::channel", url = %shared.url, "channel dropped");
            }
            Err(err) => {
                warn!(
                    target = "setpoint::channel",
                    url = %shared.url,
                    error = %err,
                    "channel connect failed"
                );
            }
        }

        shared.set_state(ConnectionState::Closed);
        attempt = attempt.saturating_add(1);
        shared.retry_count.fetch_add(1, Ordering::Relaxed);
        let delay = shared.policy.delay_for(attempt);
        info!(
            target = "setpoint::channel",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    shared.set_state(ConnectionState::Closed);
    debug!(target = "setpoint::channel", "supervisor exited");
}

async fn run_connection(
    shared: &Shared,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Ended {
    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *shared.outbound.lock() = Some(tx);
    shared.set_state(ConnectionState::Open);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: SHUTDOWN_REASON.into(),
                };
                if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                    debug!(target = "setpoint::channel", error = %err, "close frame not delivered");
                    return Ended::Shutdown;
                }
                // give the server a moment to answer the close handshake
                let _ = tokio::time::timeout(CLOSE_HANDSHAKE_GRACE, async {
                    while let Some(Ok(message)) = source.next().await {
                        if message.is_close() {
                            break;
                        }
                    }
                })
                .await;
                return Ended::Shutdown;
            }
            outbound = rx.recv() => {
                let Some(message) = outbound else {
                    return Ended::Dropped;
                };
                if let Err(err) = sink.send(message).await {
                    warn!(target = "setpoint::channel", error = %err, "channel send failed");
                    return Ended::Dropped;
                }
            }
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => shared.dispatch(&text),
                    Err(_) => {
                        warn!(target = "setpoint::channel", "dropping non-utf8 binary frame");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(target = "setpoint::channel", ?frame, "server closed channel");
                    return Ended::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target = "setpoint::channel", error = %err, "channel read failed");
                    return Ended::Dropped;
                }
                None => return Ended::Dropped,
            },
        }
    }
}
