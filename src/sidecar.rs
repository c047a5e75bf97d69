//! Messaging client backed by a bridge process
//!
//! The WhatsApp protocol library runs in a separate bridge process. Each
//! [`SidecarClient`] opens its own websocket to the bridge and exchanges
//! JSON frames:
//!
//! ```text
//! engine ──login{device}──────────▶ bridge
//! engine ──send{request_id,...}───▶ bridge
//! engine ◀──qr{item}─────────────── bridge
//! engine ◀──event{event}─────────── bridge
//! engine ◀──device{device}───────── bridge   (credentials changed)
//! engine ◀──send_result{...}─────── bridge
//! ```
//!
//! Events are handed to the registered handlers one at a time, in frame
//! order, from the socket reader task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{
    ClientError, ClientFactory, Event, EventHandler, MessagingClient, OutgoingMessage, QrEvent,
    SendReceipt,
};
use crate::jid::Jid;
use crate::storage::{CredentialStore, Device};

/// Pending sends older than this are forgotten
const PENDING_MAX_AGE: Duration = Duration::from_secs(120);

const QR_CHANNEL_CAPACITY: usize = 16;
const OUTGOING_CAPACITY: usize = 32;

// =============================================================================
// Wire Frames
// =============================================================================

/// Frames sent to the bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    Login {
        device: Device,
    },
    Send {
        request_id: Uuid,
        to: Jid,
        message: OutgoingMessage,
    },
}

/// Frames received from the bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    Qr {
        item: QrEvent,
    },
    Event {
        event: Event,
    },
    Device {
        device: Device,
    },
    SendResult {
        request_id: Uuid,
        success: bool,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        error: Option<String>,
    },
}

// =============================================================================
// Client
// =============================================================================

struct PendingSend {
    tx: oneshot::Sender<Result<SendReceipt, ClientError>>,
    created_at: Instant,
}

/// State reachable from the socket tasks
struct Shared {
    device: RwLock<Device>,
    store: Arc<CredentialStore>,
    handlers: RwLock<Vec<(u32, EventHandler)>>,
    qr_tx: Mutex<Option<mpsc::Sender<QrEvent>>>,
    pending: DashMap<Uuid, PendingSend>,
    connected: AtomicBool,
    outgoing: Mutex<Option<mpsc::Sender<GatewayFrame>>>,
}

impl Shared {
    fn label(&self) -> String {
        self.device
            .read()
            .id
            .as_ref()
            .map(|jid| jid.to_string())
            .unwrap_or_else(|| "unpaired".to_string())
    }

    fn handle_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<BridgeFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to parse bridge frame: {}", e);
                return;
            }
        };

        match frame {
            BridgeFrame::Qr { item } => self.forward_qr(item),
            BridgeFrame::Event { event } => {
                self.apply_event(&event);
                self.dispatch(event);
            }
            BridgeFrame::Device { device } => self.persist_device(device),
            BridgeFrame::SendResult {
                request_id,
                success,
                message_id,
                timestamp,
                error,
            } => {
                let Some((_, pending)) = self.pending.remove(&request_id) else {
                    warn!("No pending send found for request {}", request_id);
                    return;
                };
                let result = if success {
                    Ok(SendReceipt {
                        id: message_id.unwrap_or_default(),
                        timestamp: timestamp
                            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
                            .unwrap_or_else(Utc::now),
                    })
                } else {
                    Err(ClientError::Rejected(
                        error.unwrap_or_else(|| "unknown error".to_string()),
                    ))
                };
                if pending.tx.send(result).is_err() {
                    debug!("Send {} finished after its caller went away", request_id);
                }
            }
        }
    }

    fn forward_qr(&self, item: QrEvent) {
        let finished = matches!(item, QrEvent::Success | QrEvent::Timeout);
        let tx = self.qr_tx.lock().clone();
        if let Some(tx) = tx
            && let Err(e) = tx.try_send(item)
        {
            warn!("QR channel for {} is not keeping up: {}", self.label(), e);
        }
        if finished {
            self.qr_tx.lock().take();
        }
    }

    /// Keep the credential store in step with pairing and logout
    fn apply_event(&self, event: &Event) {
        match event {
            Event::PairSuccess { id, platform, .. } => {
                let device = {
                    let mut device = self.device.write();
                    device.id = Some(id.clone());
                    device.platform = platform.clone();
                    device.clone()
                };
                self.persist_device(device);
            }
            Event::LoggedOut { .. } => {
                let jid = self.device.write().id.take();
                if let Some(jid) = jid {
                    match self.store.delete_device(&jid) {
                        Ok(_) => info!("Removed credentials for {}", jid),
                        Err(e) => error!("Failed to remove credentials for {}: {}", jid, e),
                    }
                }
            }
            _ => {}
        }
    }

    fn persist_device(&self, device: Device) {
        *self.device.write() = device.clone();
        if !device.is_paired() {
            return;
        }
        if let Err(e) = self.store.save_device(&device) {
            error!("Failed to save device {}: {}", self.label(), e);
        }
    }

    fn dispatch(&self, event: Event) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Socket is gone: release the connection, end pairing, fail in-flight
    /// sends and tell handlers the client is done
    fn on_closed(&self, reason: Option<String>) {
        self.outgoing.lock().take();
        self.connected.store(false, Ordering::SeqCst);
        self.qr_tx.lock().take();
        self.pending.clear();
        self.dispatch(Event::ConnectionLost { reason });
    }

    fn cleanup_old_pending(&self) {
        let now = Instant::now();
        self.pending
            .retain(|_, pending| now.duration_since(pending.created_at) < PENDING_MAX_AGE);
    }
}

/// [`MessagingClient`] speaking to the bridge over a websocket
pub struct SidecarClient {
    url: String,
    shared: Arc<Shared>,
    next_handler_id: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SidecarClient {
    pub fn new(url: impl Into<String>, device: Device, store: Arc<CredentialStore>) -> Self {
        Self {
            url: url.into(),
            shared: Arc::new(Shared {
                device: RwLock::new(device),
                store,
                handlers: RwLock::new(Vec::new()),
                qr_tx: Mutex::new(None),
                pending: DashMap::new(),
                connected: AtomicBool::new(false),
                outgoing: Mutex::new(None),
            }),
            next_handler_id: AtomicU32::new(1),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn device(&self) -> Device {
        self.shared.device.read().clone()
    }
}

#[async_trait]
impl MessagingClient for SidecarClient {
    fn add_event_handler(&self, handler: EventHandler) -> u32 {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.shared.handlers.write().push((id, handler));
        id
    }

    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, ClientError> {
        if self.is_logged_in() {
            return Err(ClientError::AlreadyLoggedIn);
        }
        if self.shared.connected.load(Ordering::SeqCst) {
            return Err(ClientError::Transport(
                "QR channel must be requested before connecting".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(QR_CHANNEL_CAPACITY);
        *self.shared.qr_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn connect(&self) -> Result<(), ClientError> {
        if self.shared.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let ws = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.shared.connected.store(false, Ordering::SeqCst);
                return Err(ClientError::Transport(e.to_string()));
            }
        };
        debug!("Connected to bridge at {}", self.url);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::channel::<GatewayFrame>(OUTGOING_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to encode bridge frame: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => shared.handle_frame(&text),
                    Ok(Message::Close(frame)) => {
                        info!("Bridge closed connection for {}", shared.label());
                        reason = frame.map(|f| f.reason.as_str().to_string());
                        break;
                    }
                    Err(e) => {
                        error!("Bridge socket error for {}: {}", shared.label(), e);
                        reason = Some(e.to_string());
                        break;
                    }
                    _ => {}
                }
            }
            shared.on_closed(reason.or_else(|| Some("bridge socket closed".to_string())));
        });

        let login = GatewayFrame::Login {
            device: self.device(),
        };
        if tx.send(login).await.is_err() {
            writer.abort();
            reader.abort();
            self.shared.connected.store(false, Ordering::SeqCst);
            return Err(ClientError::NotConnected);
        }

        *self.shared.outgoing.lock() = Some(tx);
        self.tasks.lock().extend([writer, reader]);
        Ok(())
    }

    async fn disconnect(&self) {
        // Dropping the sender lets the writer close the socket
        self.shared.outgoing.lock().take();
        self.shared.qr_tx.lock().take();
        self.shared.pending.clear();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    async fn send_message(
        &self,
        cancel: CancellationToken,
        to: &Jid,
        message: OutgoingMessage,
    ) -> Result<SendReceipt, ClientError> {
        let tx = self
            .shared
            .outgoing
            .lock()
            .clone()
            .ok_or(ClientError::NotConnected)?;

        self.shared.cleanup_old_pending();

        let request_id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        self.shared.pending.insert(
            request_id,
            PendingSend {
                tx: done_tx,
                created_at: Instant::now(),
            },
        );

        let frame = GatewayFrame::Send {
            request_id,
            to: to.clone(),
            message,
        };
        if tx.send(frame).await.is_err() {
            self.shared.pending.remove(&request_id);
            return Err(ClientError::NotConnected);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.shared.pending.remove(&request_id);
                Err(ClientError::Cancelled)
            }
            result = done_rx => result.unwrap_or(Err(ClientError::NotConnected)),
        }
    }

    fn is_logged_in(&self) -> bool {
        self.shared.device.read().is_paired()
    }
}

/// Builds one [`SidecarClient`] per session
pub struct SidecarFactory {
    url: String,
    store: Arc<CredentialStore>,
}

impl SidecarFactory {
    pub fn new(url: impl Into<String>, store: Arc<CredentialStore>) -> Self {
        Self {
            url: url.into(),
            store,
        }
    }
}

impl ClientFactory for SidecarFactory {
    fn new_client(&self, device: Device) -> Arc<dyn MessagingClient> {
        Arc::new(SidecarClient::new(
            self.url.clone(),
            device,
            Arc::clone(&self.store),
        ))
    }
}
