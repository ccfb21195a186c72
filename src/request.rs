use crate::client::Client;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;
use wxcore::Frame;
use wxcore::query::Envelope;

/// Custom error types for correlated requests.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("client is not connected")]
    NotConnected,
    #[error("socket error: {0}")]
    Socket(String),
    #[error("internal channel closed unexpectedly")]
    InternalChannelClosed,
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Table of requests waiting for an answer from the box, keyed by request id.
///
/// An entry lives from [`PendingRequests::register`] until a frame with the
/// same id arrives or the caller gives up. Disconnecting does not clear the
/// table: waiters simply never resolve.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: &str) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.lock().await.insert(id.to_string(), tx).is_some() {
            warn!(target: "Client/Request", "Replaced an existing waiter for request {id}");
        }
        rx
    }

    /// Hands `frame` to the waiter registered under its id. Gives the frame
    /// back when nobody is waiting for it.
    pub async fn resolve(&self, frame: Frame) -> Result<(), Frame> {
        let Some(id) = frame.id.clone() else {
            return Err(frame);
        };
        let Some(waiter) = self.waiters.lock().await.remove(&id) else {
            return Err(frame);
        };
        if waiter.send(frame).is_err() {
            warn!(
                target: "Client/Request",
                "Failed to deliver response for request {id}. Receiver was likely dropped."
            );
        }
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> bool {
        self.waiters.lock().await.remove(id).is_some()
    }

    pub async fn is_pending(&self, id: &str) -> bool {
        self.waiters.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Client {
    /// Generates a new unique request ID string.
    pub fn generate_request_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    /// Sends a request over the socket and waits for the frame that carries
    /// the same id, using the configured request timeout.
    pub async fn request(&self, envelope: Envelope) -> Result<Frame, RequestError> {
        self.request_with_timeout(envelope, self.config.request_timeout)
            .await
    }

    /// Never retried here: the box gives no idempotency guarantee, so callers
    /// own the retry policy.
    pub async fn request_with_timeout(
        &self,
        envelope: Envelope,
        wait: Duration,
    ) -> Result<Frame, RequestError> {
        let req_id = envelope.id.clone();
        let rx = self.response_waiters.register(&req_id).await;

        if let Err(e) = self.enqueue(envelope.to_json()).await {
            self.response_waiters.cancel(&req_id).await;
            return Err(e);
        }
        debug!(
            target: "Client/Request",
            "Sent request {req_id} (type {})",
            envelope.frame_type.code()
        );

        match timeout(wait, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(RequestError::InternalChannelClosed),
            Err(_) => {
                self.response_waiters.cancel(&req_id).await;
                Err(RequestError::Timeout)
            }
        }
    }

    /// Handles an incoming frame by forwarding it to the waiting task.
    /// Returns the frame when it is not a response.
    pub async fn handle_response(&self, frame: Frame) -> Option<Frame> {
        self.response_waiters.resolve(frame).await.err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wxcore::FrameType;

    fn frame(id: &str) -> Frame {
        Frame::decode(&format!(r#"{{"id":"{id}","type":5000,"content":[]}}"#)).unwrap()
    }

    #[tokio::test]
    async fn resolves_matching_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register("a-1").await;
        assert!(pending.resolve(frame("a-1")).await.is_ok());
        let got = rx.await.unwrap();
        assert_eq!(got.frame_type, FrameType::UserList);
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_ids_are_returned() {
        let pending = PendingRequests::new();
        let _rx = pending.register("a-1").await;
        let back = pending.resolve(frame("b-7")).await.unwrap_err();
        assert_eq!(back.id.as_deref(), Some("b-7"));
        assert!(pending.is_pending("a-1").await);
    }

    #[tokio::test]
    async fn cancel_removes_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register("a-2").await;
        assert!(pending.cancel("a-2").await);
        assert!(!pending.cancel("a-2").await);
        assert!(rx.await.is_err());
    }
}
