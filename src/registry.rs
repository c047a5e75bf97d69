//! Session registry - process-wide map of session id to [`Session`]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientFactory, SendReceipt};
use crate::dispatcher::WebhookDispatcher;
use crate::error::{EngineError, EngineResult};
use crate::filter::SenderFilter;
use crate::session::Session;
use crate::storage::{CredentialStore, Device};
use crate::types::{InstanceView, SessionId, SessionStatus};

/// Owns every live session.
///
/// `connect` is the only writer of the map; `list`, `get` and `send` take the
/// read lock just long enough to copy what they need.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    store: Arc<CredentialStore>,
    factory: Arc<dyn ClientFactory>,
    dispatcher: WebhookDispatcher,
    filter: Arc<SenderFilter>,
    shutdown: CancellationToken,
    send_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<CredentialStore>,
        factory: Arc<dyn ClientFactory>,
        dispatcher: WebhookDispatcher,
        filter: Arc<SenderFilter>,
        shutdown: CancellationToken,
        send_timeout: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            factory,
            dispatcher,
            filter,
            shutdown,
            send_timeout,
        }
    }

    /// Point-in-time view of every session
    pub async fn list(&self) -> BTreeMap<SessionId, InstanceView> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.view()))
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<InstanceView> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|session| session.view())
    }

    /// Create (or re-create) a session and start pairing/connecting it.
    ///
    /// The new entry is visible to `list` before the library connect runs.
    /// A `DISCONNECTED` entry is replaced by a fresh session bound to the
    /// persisted device, so credentials survive a logout/reconnect cycle.
    pub async fn connect(&self, id: &str) -> EngineResult<SessionStatus> {
        let (session, replaced) = {
            let mut sessions = self.sessions.write().await;

            if let Some(existing) = sessions.get(id) {
                match existing.status() {
                    SessionStatus::Connected => return Err(EngineError::AlreadyConnected),
                    SessionStatus::Connecting => return Err(EngineError::AlreadyConnecting),
                    SessionStatus::Disconnected => {
                        debug!("[{}] Replacing disconnected session", id);
                    }
                }
            }

            let device = self.resolve_device(id)?;
            let client = self.factory.new_client(device);
            let session = Arc::new(Session::new(
                id,
                client,
                self.dispatcher.outbox(id),
                Arc::clone(&self.filter),
                self.shutdown.child_token(),
                self.send_timeout,
            ));

            let replaced = sessions.insert(id.to_string(), Arc::clone(&session));
            (session, replaced)
        };

        if let Some(old) = replaced {
            old.disconnect().await;
        }

        session.start().await?;
        Ok(session.status())
    }

    fn resolve_device(&self, id: &str) -> EngineResult<Device> {
        match self.store.get_device(id)? {
            Some(device) => {
                info!("♻️ [{}] Reusing stored device {:?}", id, device.id);
                Ok(device)
            }
            None => {
                info!("🆕 [{}] No stored device, pairing a new one", id);
                Ok(self.store.new_device())
            }
        }
    }

    /// Send a text message through a connected session
    pub async fn send(&self, id: &str, to: &str, text: &str) -> EngineResult<SendReceipt> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(id).cloned()
        };

        match session {
            Some(session) => session.send(to, text).await,
            None => Err(EngineError::NotConnected),
        }
    }

    /// Drop a session: disconnect its client and remove the entry
    pub async fn disconnect(&self, id: &str) -> EngineResult<()> {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.disconnect().await;
                Ok(())
            }
            None => Err(EngineError::NotFound),
        }
    }

    /// Devices the store knows about; candidates for restoring sessions
    pub fn restorable_devices(&self) -> EngineResult<Vec<Device>> {
        Ok(self.store.list_devices()?)
    }

    /// Disconnect every session without reporting it to the webhook
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        if sessions.is_empty() {
            return;
        }

        info!("Disconnecting {} session(s)", sessions.len());
        join_all(sessions.iter().map(|session| session.disconnect())).await;

        let still_up = sessions
            .iter()
            .filter(|s| s.status() != SessionStatus::Disconnected)
            .count();
        if still_up > 0 {
            warn!("{} session(s) did not reach DISCONNECTED", still_up);
        }
    }
}
