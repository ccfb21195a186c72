//! Socket transport to the box.
//!
//! The transport is a dumb pipe for text frames; framing and correlation live
//! in the client.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// One complete frame has been received.
    DataReceived(Bytes),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame.
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        let text = std::str::from_utf8(data)
            .map_err(|e| anyhow::anyhow!("Frame is not valid UTF-8: {e}"))?;
        trace!(target: "Transport", "--> {text}");
        sink.send(Message::text(text.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {e}"))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(target: "Transport", "Error while closing socket: {e}");
            }
        }
    }
}

/// Dials `ws://{host}:{port}` with tokio-tungstenite.
pub struct TokioWebSocketTransportFactory {
    url: String,
}

impl TokioWebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn for_box(host: &str, port: u16) -> Self {
        Self::new(format!("ws://{host}:{port}"))
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Transport", "Dialing {}", self.url);
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {e}"))?;
        let (sink, stream) = ws.split();

        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = Arc::new(TokioWebSocketTransport {
            ws_sink: Mutex::new(Some(sink)),
        });

        tokio::spawn(read_pump(stream, event_tx.clone()));
        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let data = Bytes::copy_from_slice(text.as_str().as_bytes());
                if event_tx
                    .send(TransportEvent::DataReceived(data))
                    .await
                    .is_err()
                {
                    warn!(target: "Transport", "Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if event_tx
                    .send(TransportEvent::DataReceived(data))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(target: "Transport", "Received close frame: {frame:?}");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(target: "Transport", "Error reading from websocket: {e}");
                break;
            }
            None => {
                debug!(target: "Transport", "Websocket stream ended");
                break;
            }
        }
    }
    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

pub mod mock {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex as StdMutex, PoisonError};

    /// Produces the frames the box would answer a sent frame with.
    pub type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

    #[derive(Default)]
    struct Shared {
        sent: StdMutex<Vec<String>>,
        event_tx: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
        responder: StdMutex<Option<Responder>>,
        connects: AtomicUsize,
        fail_connect: AtomicBool,
        fail_send: AtomicBool,
    }

    impl Shared {
        fn event_tx(&self) -> Option<mpsc::Sender<TransportEvent>> {
            self.event_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    /// Records every frame and feeds scripted answers back.
    pub struct MockTransport {
        shared: Arc<Shared>,
        event_tx: mpsc::Sender<TransportEvent>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
            if self.shared.fail_send.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("mock send failure"));
            }
            let text = String::from_utf8_lossy(data).into_owned();
            self.shared
                .sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(text.clone());

            let responder = self
                .shared
                .responder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(responder) = responder {
                let request: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                for reply in responder(&request) {
                    let _ = self
                        .event_tx
                        .send(TransportEvent::DataReceived(Bytes::from(reply)))
                        .await;
                }
            }
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    /// A mock transport factory for testing.
    #[derive(Default)]
    pub struct MockTransportFactory {
        shared: Arc<Shared>,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_responder(
            responder: impl Fn(&Value) -> Vec<String> + Send + Sync + 'static,
        ) -> Self {
            let factory = Self::new();
            factory.set_responder(responder);
            factory
        }

        pub fn set_responder(&self, responder: impl Fn(&Value) -> Vec<String> + Send + Sync + 'static) {
            *self
                .shared
                .responder
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(responder));
        }

        pub fn connect_count(&self) -> usize {
            self.shared.connects.load(Ordering::SeqCst)
        }

        pub fn set_fail_connect(&self, fail: bool) {
            self.shared.fail_connect.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_send(&self, fail: bool) {
            self.shared.fail_send.store(fail, Ordering::SeqCst);
        }

        pub fn sent_frames(&self) -> Vec<String> {
            self.shared
                .sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn sent_values(&self) -> Vec<Value> {
            self.sent_frames()
                .iter()
                .filter_map(|f| serde_json::from_str(f).ok())
                .collect()
        }

        /// Delivers `text` as if the box had pushed it. Returns false when no
        /// connection is open.
        pub async fn push_frame(&self, text: impl Into<String>) -> bool {
            let Some(tx) = self.shared.event_tx() else {
                return false;
            };
            tx.send(TransportEvent::DataReceived(Bytes::from(text.into())))
                .await
                .is_ok()
        }

        /// Simulates the box closing the socket.
        pub async fn drop_connection(&self) {
            if let Some(tx) = self.shared.event_tx() {
                let _ = tx.send(TransportEvent::Disconnected).await;
            }
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            self.shared.connects.fetch_add(1, Ordering::SeqCst);
            if self.shared.fail_connect.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("connection refused"));
            }
            let (tx, rx) = mpsc::channel(100);
            *self
                .shared
                .event_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());
            let transport = Arc::new(MockTransport {
                shared: self.shared.clone(),
                event_tx: tx,
            });
            Ok((transport, rx))
        }
    }
}
