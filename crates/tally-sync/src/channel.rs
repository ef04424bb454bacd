//! Push channel: one shared WebSocket connection with automatic reconnect.
//!
//! ```text
//!  Disconnected --start()--> Connecting --open--> Open
//!        ^                        |                 |
//!        |                        | connect error   | read error / close
//!        +---- reconnect_delay ---+-----------------+
//! ```
//!
//! The connection is created lazily by the first [`PushChannel::subscribe`]
//! and lives until [`PushChannel::stop`]; unsubscribing the last handler does
//! not close it. Every text frame is parsed as a [`PushMessage`] and handed
//! to all handlers in subscription order. Malformed frames are logged and
//! dropped without affecting the connection.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::SyncError;
use crate::types::{Action, Record};

/// Default delay before reconnecting after the connection drops.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1200);

/// A connection with no frames for this long is considered dead.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// One server-originated change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub resource: String,
    pub action: Action,
    #[serde(default)]
    pub payload: Record,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
}

/// Inbound text frames of one connection. Ends on close; an `Err` item ends
/// the connection as well.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, SyncError>> + Send>>;

/// Opens the underlying transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<FrameStream, SyncError>;
}

/// Connector over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream, SyncError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SyncError::WebSocket(format!("connection failed: {}", e)))?;

        let (_, read) = ws_stream.split();

        let frames = read.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        trace!("ignoring non-UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(_)) => {
                    Some(Err(SyncError::WebSocket("connection closed".to_string())))
                }
                // tungstenite answers pings itself
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::WebSocket(format!("read error: {}", e)))),
            }
        });
        Ok(Box::pin(frames))
    }
}

/// Callback invoked for every parsed message.
pub type Handler = Arc<dyn Fn(&PushMessage) + Send + Sync>;

/// Shared push-channel connection manager.
pub struct PushChannel {
    url: String,
    reconnect_delay: Duration,
    connector: Arc<dyn Connector>,
    handlers: Mutex<Vec<(u64, Handler)>>,
    next_handler_id: AtomicU64,
    state_tx: watch::Sender<ChannelState>,
    connect_attempts: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannel {
    /// Create a channel over WebSocket. Nothing connects until the first
    /// subscription (or an explicit [`start`](Self::start)).
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Arc<Self> {
        Self::with_connector(url, reconnect_delay, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(
        url: impl Into<String>,
        reconnect_delay: Duration,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            url: url.into(),
            reconnect_delay,
            connector,
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(0),
            state_tx,
            connect_attempts: AtomicU64::new(0),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Number of times the loop has entered `Connecting`.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.lock_handlers().len()
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Handler)>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
    }

    /// Start the connection loop if it is not running. Returns true if this
    /// call started it.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let channel = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            channel.run(shutdown_rx).await;
        }));
        true
    }

    /// The running channel, starting it on first use.
    pub fn get_or_create(self: &Arc<Self>) -> Arc<Self> {
        if self.start() {
            debug!(url = %self.url, "push channel started");
        }
        Arc::clone(self)
    }

    /// Stop the connection loop and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "push channel task ended abnormally");
        }
        self.set_state(ChannelState::Disconnected);
        info!("push channel stopped");
    }

    /// Register a handler. Starts the shared connection if needed.
    ///
    /// Safe to call from inside a handler.
    pub fn subscribe(
        self: &Arc<Self>,
        handler: impl Fn(&PushMessage) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.lock_handlers().push((id, Arc::new(handler)));
        trace!(id, "push handler subscribed");
        self.get_or_create();
        Subscription {
            channel: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock_handlers().retain(|(h, _)| *h != id);
        trace!(id, "push handler unsubscribed");
    }

    /// Parse one frame and fan it out.
    ///
    /// Handlers run on a snapshot of the handler list, so they may subscribe
    /// or unsubscribe while being invoked.
    pub fn dispatch(&self, text: &str) {
        let message: PushMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed push frame");
                return;
            }
        };
        let handlers: Vec<Handler> = self
            .lock_handlers()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        trace!(
            resource = %message.resource,
            action = %message.action,
            handlers = handlers.len(),
            "push message"
        );
        for handler in handlers {
            handler(&message);
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_state(ChannelState::Connecting);
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            info!(url = %self.url, "connecting to push channel");

            let connected = tokio::select! {
                _ = shutdown_rx.changed() => None,
                result = self.connector.connect(&self.url) => Some(result),
            };

            match connected {
                None => break,
                Some(Ok(frames)) => {
                    self.set_state(ChannelState::Open);
                    info!("push channel open");
                    if let Err(e) = self.read_frames(frames, &mut shutdown_rx).await {
                        warn!(error = %e, "push channel disconnected, reconnecting");
                    } else {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "push channel connection failed, reconnecting");
                }
            }

            self.set_state(ChannelState::Disconnected);
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        self.set_state(ChannelState::Disconnected);
        debug!("push channel loop exited");
    }

    /// Read until the connection drops (`Err`) or shutdown (`Ok`).
    async fn read_frames(
        &self,
        mut frames: FrameStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("push channel received shutdown signal");
                        return Ok(());
                    }
                }

                result = tokio::time::timeout(READ_TIMEOUT, frames.next()) => {
                    match result {
                        Ok(Some(Ok(text))) => self.dispatch(&text),
                        Ok(Some(Err(e))) => return Err(e),
                        Ok(None) => {
                            return Err(SyncError::WebSocket("stream ended".to_string()));
                        }
                        Err(_) => {
                            return Err(SyncError::WebSocket(format!(
                                "read timeout after {}s",
                                READ_TIMEOUT.as_secs()
                            )));
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle for a registered handler. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: Weak<PushChannel>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.unsubscribe(self.id);
        }
    }
}
