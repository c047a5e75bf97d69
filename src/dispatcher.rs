//! Webhook dispatcher - best-effort JSON delivery of event envelopes
//!
//! Each session owns an [`Outbox`]: emitting never blocks, and a single worker
//! per session POSTs envelopes in the order they were emitted.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::EventEnvelope;

/// Shared webhook client; holds no mutable state
#[derive(Clone)]
pub struct WebhookDispatcher {
    url: String,
    http: Client,
    shutdown: CancellationToken,
}

impl WebhookDispatcher {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> EngineResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            http,
            shutdown,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST one envelope and return the response status.
    ///
    /// The body is drained so the connection goes back to the pool.
    pub async fn post(&self, envelope: &EventEnvelope) -> EngineResult<StatusCode> {
        let response = self
            .http
            .post(&self.url)
            .json(envelope)
            .send()
            .await
            .map_err(EngineError::Webhook)?;

        let status = response.status();
        let _ = response.bytes().await;
        Ok(status)
    }

    /// Ordered, non-blocking outbox for one session
    pub fn outbox(&self, session_id: &str) -> Outbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move { worker.drain(session_id, rx).await });

        Outbox {
            tx,
            shutdown: self.shutdown.clone(),
        }
    }

    async fn drain(self, session_id: String, mut rx: mpsc::UnboundedReceiver<EventEnvelope>) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.post(&envelope) => match result {
                    Ok(status) if status.is_success() => {
                        debug!("[{}] Webhook {:?} delivered ({})", session_id, envelope.event, status);
                    }
                    Ok(status) => {
                        warn!("[{}] Webhook {:?} answered {}", session_id, envelope.event, status);
                    }
                    Err(e) => {
                        warn!("[{}] Webhook error: {}", session_id, e);
                    }
                },
            }
        }
        debug!("[{}] Outbox closed", session_id);
    }
}

/// Sending half of a session's webhook queue
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<EventEnvelope>,
    shutdown: CancellationToken,
}

impl Outbox {
    /// Queue an envelope. Dropped silently once shutdown has begun.
    pub fn emit(&self, envelope: EventEnvelope) {
        if self.shutdown.is_cancelled() {
            debug!("Shutdown in progress, dropping {:?} envelope", envelope.event);
            return;
        }
        if self.tx.send(envelope).is_err() {
            debug!("Outbox worker gone, envelope dropped");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionStatus;
    use mockito::Matcher;

    fn dispatcher(url: String) -> WebhookDispatcher {
        WebhookDispatcher::new(url, Duration::from_secs(5), CancellationToken::new()).unwrap()
    }

    async fn wait_until(mock: &mockito::Mock) {
        for _ in 0..100 {
            if mock.matched_async().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_post_sends_json_envelope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/webhook/whatsapp")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({
                "instanceId": "111",
                "event": "status",
                "data": { "status": "CONNECTED" }
            })))
            .with_status(200)
            .create_async()
            .await;

        let dispatcher = dispatcher(format!("{}/api/webhook/whatsapp", server.url()));
        let status = dispatcher
            .post(&EventEnvelope::status("111", SessionStatus::Connected))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let dispatcher = dispatcher(format!("{}/hook", server.url()));
        let status = dispatcher.post(&EventEnvelope::qr("111", "abc")).await.unwrap();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_failure_is_webhook_error() {
        let dispatcher = dispatcher("http://127.0.0.1:9/unreachable".to_string());
        let result = dispatcher.post(&EventEnvelope::qr("111", "abc")).await;
        assert!(matches!(result, Err(EngineError::Webhook(_))));
    }

    #[tokio::test]
    async fn test_outbox_keeps_going_after_failures() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/hook")
            .match_body(Matcher::PartialJson(serde_json::json!({ "event": "qr" })))
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/hook")
            .match_body(Matcher::PartialJson(serde_json::json!({ "event": "status" })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let outbox = dispatcher(format!("{}/hook", server.url())).outbox("111");
        outbox.emit(EventEnvelope::qr("111", "abc"));
        outbox.emit(EventEnvelope::status("111", SessionStatus::Connected));

        wait_until(&ok).await;
        failing.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_outbox_drops_after_shutdown() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .expect(0)
            .create_async()
            .await;

        let shutdown = CancellationToken::new();
        let dispatcher =
            WebhookDispatcher::new(format!("{}/hook", server.url()), Duration::from_secs(5), shutdown.clone())
                .unwrap();
        let outbox = dispatcher.outbox("111");

        shutdown.cancel();
        outbox.emit(EventEnvelope::status("111", SessionStatus::Disconnected));
        tokio::time::sleep(Duration::from_millis(100)).await;

        mock.assert_async().await;
    }
}
