//! A single logical WhatsApp connection
//!
//! A [`Session`] owns one library client and mirrors its lifecycle into an
//! observable `(status, qr)` pair. Two things write that pair: the event
//! handler registered on the client, and the QR reader task spawned by
//! [`Session::start`]. Both forward what they see to the session's webhook
//! outbox.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{
    ClientError, Event, MessageEvent, MessagingClient, OutgoingMessage, QrEvent, SendReceipt,
};
use crate::dispatcher::Outbox;
use crate::error::{EngineError, EngineResult};
use crate::filter::SenderFilter;
use crate::jid::Jid;
use crate::qr;
use crate::types::{EventEnvelope, InstanceView, SessionId, SessionStatus};

/// Observable state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub qr: String,
}

/// State shared between the session, its event handler and its QR reader
struct SessionCore {
    id: SessionId,
    state: RwLock<SessionState>,
    outbox: Outbox,
    filter: Arc<SenderFilter>,
    /// Set once the session is shut down locally; events are ignored from then on
    closed: AtomicBool,
}

impl SessionCore {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Change status and report it. `CONNECTED` always clears the QR code.
    fn transition(&self, status: SessionStatus) {
        {
            let mut state = self.state.write();
            state.status = status;
            if status == SessionStatus::Connected {
                state.qr.clear();
            }
        }
        self.outbox.emit(EventEnvelope::status(&self.id, status));
    }

    /// Store the freshest pairing code. Codes arriving outside pairing are stale.
    fn set_qr(&self, code: &str) {
        {
            let mut state = self.state.write();
            if state.status != SessionStatus::Connecting {
                debug!("[{}] Ignoring QR code outside of pairing", self.id);
                return;
            }
            state.qr = code.to_string();
        }
        match qr::render_terminal(code) {
            Ok(block) => info!("📸 [{}] New QR code, scan to pair:\n{}", self.id, block),
            Err(e) => warn!("📸 [{}] New QR code (not renderable: {})", self.id, e),
        }
        self.outbox.emit(EventEnvelope::qr(&self.id, code));
    }

    fn handle_event(&self, event: Event) {
        if self.is_closed() {
            return;
        }

        match event {
            Event::Message(message) => self.handle_message(message),
            Event::Connected => {
                self.transition(SessionStatus::Connected);
                info!("✅ [{}] Connected", self.id);
            }
            Event::LoggedOut { on_connect, reason } => {
                self.transition(SessionStatus::Disconnected);
                info!(
                    "🚪 [{}] Logged out (on_connect={}, reason={:?})",
                    self.id, on_connect, reason
                );
            }
            Event::PairSuccess {
                id,
                business_name,
                platform,
            } => {
                info!(
                    "🔗 [{}] Paired as {} ({} on {})",
                    self.id, id, business_name, platform
                );
            }
            Event::Disconnected => {
                debug!("[{}] Transport dropped, bridge will reconnect", self.id);
            }
            Event::ConnectionLost { reason } => {
                warn!("⚠️ [{}] Lost the messaging library: {:?}", self.id, reason);
                self.transition(SessionStatus::Disconnected);
            }
            Event::Other => {}
        }
    }

    fn handle_message(&self, message: MessageEvent) {
        let info = &message.info;
        if info.is_from_me {
            return;
        }

        let sender = info.sender.user.as_str();
        if !self.filter.is_allowed(sender) {
            info!("🚫 [{}] Message from {} ignored (not allowed)", self.id, sender);
            return;
        }

        let scope = if info.chat.is_group() { "group" } else { "direct" };
        debug!(
            "📩 [{}] {} message {} from {}",
            self.id, scope, info.id, info.sender
        );
        match EventEnvelope::message(&self.id, &message) {
            Ok(envelope) => self.outbox.emit(envelope),
            Err(e) => warn!("[{}] {}", self.id, EngineError::from(e)),
        }
    }
}

/// One logical connection, owned by the registry
pub struct Session {
    core: Arc<SessionCore>,
    client: Arc<dyn MessagingClient>,
    /// Parent of every per-send cancellation token
    cancel: CancellationToken,
    send_timeout: Duration,
    qr_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Build a session in `CONNECTING` and register its event handler
    pub fn new(
        id: impl Into<SessionId>,
        client: Arc<dyn MessagingClient>,
        outbox: Outbox,
        filter: Arc<SenderFilter>,
        cancel: CancellationToken,
        send_timeout: Duration,
    ) -> Self {
        let core = Arc::new(SessionCore {
            id: id.into(),
            state: RwLock::new(SessionState {
                status: SessionStatus::Connecting,
                qr: String::new(),
            }),
            outbox,
            filter,
            closed: AtomicBool::new(false),
        });

        let session = Self {
            core,
            client,
            cancel,
            send_timeout,
            qr_task: Mutex::new(None),
        };
        session.attach_handler();
        session
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn state(&self) -> SessionState {
        self.core.state.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.core.state.read().status
    }

    pub fn view(&self) -> InstanceView {
        let state = self.state();
        InstanceView {
            id: self.core.id.clone(),
            status: state.status,
            qr: state.qr,
        }
    }

    /// Register the single event handler; a panic inside it costs only that event
    fn attach_handler(&self) {
        let core = Arc::clone(&self.core);
        self.client.add_event_handler(Arc::new(move |event| {
            run_guarded(&core.id, || core.handle_event(event));
        }));
    }

    /// Open the QR channel, connect, and keep `qr` fresh until pairing ends.
    ///
    /// A device that is already paired gets no QR channel and simply connects.
    pub async fn start(&self) -> EngineResult<()> {
        match self.client.qr_channel().await {
            Ok(rx) => {
                let core = Arc::clone(&self.core);
                *self.qr_task.lock() = Some(tokio::spawn(read_qr(core, rx)));
            }
            Err(ClientError::AlreadyLoggedIn) => {
                debug!("[{}] Device already paired, skipping QR", self.id());
            }
            Err(e) => return Err(self.fail_start(e)),
        }

        if let Err(e) = self.client.connect().await {
            return Err(self.fail_start(e));
        }

        info!("🔌 [{}] Connecting", self.id());
        Ok(())
    }

    fn fail_start(&self, e: ClientError) -> EngineError {
        error!("❌ [{}] Failed to connect: {}", self.id(), e);
        if let Some(task) = self.qr_task.lock().take() {
            task.abort();
        }
        self.core.transition(SessionStatus::Disconnected);
        EngineError::Client(e)
    }

    /// Send a text message to `to` (a JID string)
    pub async fn send(&self, to: &str, text: &str) -> EngineResult<SendReceipt> {
        if self.status() != SessionStatus::Connected {
            return Err(EngineError::NotConnected);
        }

        let recipient: Jid = to.parse()?;

        // Dropping this future (caller went away) cancels only this send
        let cancel = self.cancel.child_token();
        let _guard = cancel.clone().drop_guard();

        let send = self
            .client
            .send_message(cancel, &recipient, OutgoingMessage::text(text));

        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(Ok(receipt)) => {
                debug!("📤 [{}] Sent {} to {}", self.id(), receipt.id, recipient);
                Ok(receipt)
            }
            Ok(Err(e)) => {
                warn!("[{}] Send to {} failed: {}", self.id(), recipient, e);
                Err(EngineError::Send(e))
            }
            Err(_) => {
                warn!("[{}] Send to {} timed out", self.id(), recipient);
                Err(EngineError::Send(ClientError::Timeout))
            }
        }
    }

    /// Local shutdown: mark `DISCONNECTED` without reporting it, then drop the connection
    pub async fn disconnect(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.core.state.write();
            state.status = SessionStatus::Disconnected;
            state.qr.clear();
        }

        self.cancel.cancel();
        self.client.disconnect().await;

        if let Some(task) = self.qr_task.lock().take() {
            task.abort();
        }
        info!("🛑 [{}] Disconnected", self.id());
    }
}

/// Run one event through `f`, logging and swallowing any panic
fn run_guarded(id: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("[{}] Event handler panicked: {}", id, reason);
    }
}

/// Drain a QR channel until the library closes it
async fn read_qr(core: Arc<SessionCore>, mut rx: mpsc::Receiver<QrEvent>) {
    while let Some(item) = rx.recv().await {
        if core.is_closed() {
            break;
        }
        match item {
            QrEvent::Code { code } => core.set_qr(&code),
            QrEvent::Success => info!("[{}] Pairing succeeded", core.id),
            QrEvent::Timeout => {
                warn!("[{}] Pairing timed out", core.id);
                core.transition(SessionStatus::Disconnected);
            }
            QrEvent::Other => debug!("[{}] Unhandled QR channel event", core.id),
        }
    }
    debug!("[{}] QR channel closed", core.id);
}
