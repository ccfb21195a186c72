use super::traits::FrameHandler;
use crate::client::Client;
use log::{error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use wxcore::{Frame, FrameType};

/// Central router for dispatching frames to their handlers.
///
/// The router maintains a registry of handlers keyed by frame type, built once
/// when the client is constructed.
pub struct FrameRouter {
    handlers: HashMap<FrameType, Arc<dyn FrameHandler>>,
}

impl FrameRouter {
    /// Create a new empty router.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for its frame type.
    ///
    /// # Panics
    /// Panics if a handler is already registered for the same type to prevent
    /// accidental overwrites during initialization.
    pub fn register(&mut self, handler: Arc<dyn FrameHandler>) {
        let frame_type = handler.frame_type();
        if self.handlers.insert(frame_type, handler).is_some() {
            panic!(
                "Handler for frame type {} already registered",
                frame_type.code()
            );
        }
    }

    /// Dispatch a frame to its handler. Inline handlers are awaited, the rest
    /// are spawned. Every handler runs in its own task, so a panicking handler
    /// is logged and never takes the read loop down with it.
    ///
    /// Returns `false` when no handler is registered for the frame's type.
    pub async fn dispatch(&self, client: &Arc<Client>, frame: Frame) -> bool {
        let Some(handler) = self.handlers.get(&frame.frame_type).cloned() else {
            return false;
        };
        if handler.inline() {
            let (id, code) = (frame.id.clone(), frame.frame_type.code());
            let task = tokio::spawn(run_handler(handler, client.clone(), frame));
            if let Err(e) = task.await {
                error!(
                    target: "Client/Recv",
                    "Handler for frame {id:?} of type {code} did not finish: {e}"
                );
            }
        } else {
            tokio::spawn(run_handler(handler, client.clone(), frame));
        }
        true
    }

    /// Get the number of registered handlers (useful for testing).
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for FrameRouter {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_handler(handler: Arc<dyn FrameHandler>, client: Arc<Client>, frame: Frame) {
    if let Err(e) = handler.handle(client, &frame).await {
        warn!(
            target: "Client/Recv",
            "Handler for frame type {} failed: {e:?}",
            frame.frame_type.code()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::test_utils::{MockHttpClient, MockTransportFactory};
    use tokio::sync::mpsc;

    struct MockHandler {
        frame_type: FrameType,
        inline: bool,
        fail: bool,
        panic: bool,
        seen: mpsc::UnboundedSender<Option<String>>,
    }

    impl MockHandler {
        fn new(frame_type: FrameType, seen: mpsc::UnboundedSender<Option<String>>) -> Self {
            Self {
                frame_type,
                inline: false,
                fail: false,
                panic: false,
                seen,
            }
        }
    }

    #[async_trait::async_trait]
    impl FrameHandler for MockHandler {
        fn frame_type(&self) -> FrameType {
            self.frame_type
        }

        fn inline(&self) -> bool {
            self.inline
        }

        async fn handle(&self, _client: Arc<Client>, frame: &Frame) -> anyhow::Result<()> {
            if self.panic && frame.id.as_deref() == Some("boom") {
                panic!("handler blew up on {:?}", frame.id);
            }
            let _ = self.seen.send(frame.id.clone());
            if self.fail {
                anyhow::bail!("handler failure");
            }
            Ok(())
        }
    }

    fn client() -> Arc<Client> {
        Client::new(
            ClientConfig::default(),
            Arc::new(MockTransportFactory::new()),
            Arc::new(MockHttpClient::new()),
        )
        .0
    }

    fn frame(id: &str, frame_type: i64) -> Frame {
        Frame::decode(&format!(r#"{{"id":"{id}","type":{frame_type},"content":"x"}}"#)).unwrap()
    }

    #[test]
    fn test_router_registration() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut router = FrameRouter::new();
        router.register(Arc::new(MockHandler::new(FrameType::HeartBeat, tx)));
        assert_eq!(router.handler_count(), 1);
    }

    #[test]
    #[should_panic(expected = "Handler for frame type 5005 already registered")]
    fn test_router_double_registration_panics() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut router = FrameRouter::new();
        router.register(Arc::new(MockHandler::new(FrameType::HeartBeat, tx.clone())));
        router.register(Arc::new(MockHandler::new(FrameType::HeartBeat, tx)));
    }

    #[tokio::test]
    async fn test_router_dispatch_inline_and_spawned() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = FrameRouter::new();
        let mut inline = MockHandler::new(FrameType::RecvTxtMsg, tx.clone());
        inline.inline = true;
        router.register(Arc::new(inline));
        router.register(Arc::new(MockHandler::new(FrameType::UserList, tx)));

        let client = client();
        assert!(router.dispatch(&client, frame("a", 1)).await);
        // Inline handlers have finished by the time dispatch returns.
        assert_eq!(rx.try_recv().unwrap().as_deref(), Some("a"));

        assert!(router.dispatch(&client, frame("b", 5000)).await);
        assert_eq!(rx.recv().await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_router_dispatch_not_found() {
        let router = FrameRouter::new();
        assert!(!router.dispatch(&client(), frame("c", 4242)).await);
    }

    #[tokio::test]
    async fn test_handler_errors_stay_in_the_router() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = FrameRouter::new();
        let mut failing = MockHandler::new(FrameType::RecvTxtMsg, tx);
        failing.inline = true;
        failing.fail = true;
        router.register(Arc::new(failing));

        let client = client();
        assert!(router.dispatch(&client, frame("d", 1)).await);
        assert!(router.dispatch(&client, frame("e", 1)).await);
        assert_eq!(rx.try_recv().unwrap().as_deref(), Some("d"));
        assert_eq!(rx.try_recv().unwrap().as_deref(), Some("e"));
    }

    #[tokio::test]
    async fn test_panicking_inline_handler_does_not_stop_dispatch() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = FrameRouter::new();
        let mut handler = MockHandler::new(FrameType::RecvTxtMsg, tx);
        handler.inline = true;
        handler.panic = true;
        router.register(Arc::new(handler));

        let client = client();
        assert!(router.dispatch(&client, frame("boom", 1)).await);
        assert!(router.dispatch(&client, frame("f", 1)).await);
        assert_eq!(rx.try_recv().unwrap().as_deref(), Some("f"));
        assert!(rx.try_recv().is_err());
    }
}
