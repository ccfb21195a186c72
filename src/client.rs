mod api;

pub use api::SelfInfo;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::handlers::router::FrameRouter;
use crate::http::HttpClient;
use crate::request::{PendingRequests, RequestError};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::events::Event;
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use wxcore::{Frame, WechatId, WechatUser};
use wxcore::query::Envelope;

/// Connection to one box instance.
///
/// Owns the socket, the outbound queue and the table of pending requests.
/// Frames that answer a request resolve it; everything else is routed by
/// frame type to a [`FrameHandler`](crate::handlers::traits::FrameHandler).
/// Reconnecting is left to the [`Supervisor`](crate::supervisor::Supervisor).
pub struct Client {
    pub(crate) config: ClientConfig,

    pub(crate) transport_factory: Arc<dyn TransportFactory>,
    pub(crate) transport: Mutex<Option<Arc<dyn Transport>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    pub(crate) is_connecting: AtomicBool,
    is_connected: AtomicBool,
    connection_lost: Notify,

    pub(crate) response_waiters: PendingRequests,
    pub(crate) unique_id: String,
    pub(crate) id_counter: AtomicU64,

    /// Milliseconds since `heartbeat_epoch` plus one; zero until the first
    /// heartbeat.
    last_heartbeat: AtomicU64,
    heartbeat_epoch: Instant,

    pub(crate) self_info: RwLock<SelfInfo>,
    pub(crate) contacts: DashMap<WechatId, WechatUser>,

    router: FrameRouter,
    event_tx: mpsc::UnboundedSender<Event>,

    /// HTTP client for the box's action endpoints.
    pub http_client: Arc<dyn HttpClient>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        http_client: Arc<dyn HttpClient>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let mut unique_id_bytes = [0u8; 2];
        rand::rng().fill_bytes(&mut unique_id_bytes);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = Self {
            config,
            transport_factory,
            transport: Mutex::new(None),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            is_connecting: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            connection_lost: Notify::new(),
            response_waiters: PendingRequests::new(),
            unique_id: format!("{}.{}", unique_id_bytes[0], unique_id_bytes[1]),
            id_counter: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(0),
            heartbeat_epoch: Instant::now(),
            self_info: RwLock::new(SelfInfo::default()),
            contacts: DashMap::new(),
            router: Self::create_frame_router(),
            event_tx,
            http_client,
        };
        (Arc::new(client), event_rx)
    }

    /// Create and configure the frame router with all the handlers.
    fn create_frame_router() -> FrameRouter {
        use crate::handlers::{
            basic::{ChatroomMemberHandler, HeartbeatHandler, PersonalInfoHandler, UserListHandler},
            message::MessageHandler,
            unimplemented::UnimplementedHandler,
        };
        use wxcore::FrameType;

        let mut router = FrameRouter::new();

        router.register(Arc::new(HeartbeatHandler::new()));
        router.register(Arc::new(PersonalInfoHandler::new()));
        router.register(Arc::new(UserListHandler::new()));
        router.register(Arc::new(ChatroomMemberHandler::new()));
        router.register(Arc::new(MessageHandler::new(FrameType::RecvTxtMsg)));
        router.register(Arc::new(MessageHandler::new(FrameType::RecvPicMsg)));
        router.register(Arc::new(MessageHandler::new(FrameType::RecvTxtCiteMsg)));

        router.register(Arc::new(UnimplementedHandler::new(FrameType::AtMsg)));
        router.register(Arc::new(UnimplementedHandler::new(FrameType::DebugSwitch)));

        router
    }

    /// Opens the socket and starts the read and drain loops. Fails when the
    /// box is unreachable; retrying is up to the caller.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }

        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        let (transport, transport_events) = self
            .transport_factory
            .create_transport()
            .await
            .map_err(ClientError::Connection)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.transport.lock().await = Some(transport.clone());
        *self.outbound.lock().await = Some(outbound_tx);
        self.is_connected.store(true, Ordering::SeqCst);
        self.mark_heartbeat();

        // Held across the spawns so a loss reported by either loop finds the
        // handles it has to abort.
        let mut tasks = self.tasks.lock().await;
        let reader = tokio::spawn({
            let client = self.clone();
            async move { client.read_loop(transport_events).await }
        });
        let drainer = tokio::spawn({
            let client = self.clone();
            async move { client.drain_loop(transport, outbound_rx).await }
        });
        *tasks = vec![reader, drainer];
        drop(tasks);

        info!(target: "Client", "Connected to box at {}", self.config.ws_url());
        self.emit(Event::Connected);
        Ok(())
    }

    /// Stops both loops and closes the socket. Pending requests are left
    /// unresolved; their callers time out on their own.
    pub async fn disconnect(&self) {
        info!(target: "Client", "Disconnecting client intentionally.");
        let was_connected = self.is_connected.swap(false, Ordering::SeqCst);
        for task in std::mem::take(&mut *self.tasks.lock().await) {
            task.abort();
        }
        *self.outbound.lock().await = None;
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        if was_connected {
            self.emit(Event::Disconnected);
        }
    }

    /// Tears the connection down after the socket failed underneath us and
    /// wakes the supervisor. Runs at most once per connection.
    async fn on_connection_lost(&self) {
        if !self.is_connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(target: "Client", "Connection to the box lost");
        *self.outbound.lock().await = None;
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        self.emit(Event::Disconnected);
        self.connection_lost.notify_one();

        // May abort the task running this; nothing awaits after it.
        for task in std::mem::take(&mut *self.tasks.lock().await) {
            task.abort();
        }
    }

    /// Resolves once the connection has been lost without `disconnect()`
    /// being called. A loss that happened while nobody was waiting is
    /// reported to the next caller.
    pub async fn connection_lost(&self) {
        self.connection_lost.notified().await;
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    async fn read_loop(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        info!(target: "Client", "Starting frame processing loop...");
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::DataReceived(data) => self.process_data(&data).await,
                TransportEvent::Connected => {
                    debug!(target: "Client", "Transport connected event received");
                }
                TransportEvent::Disconnected => break,
            }
        }
        info!(target: "Client", "Transport disconnected.");
        self.on_connection_lost().await;
    }

    async fn process_data(self: &Arc<Self>, data: &[u8]) {
        let text = match std::str::from_utf8(data) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "Client/Recv", "Dropping non UTF-8 frame: {e}");
                return;
            }
        };
        trace!(target: "Client/Recv", "<-- {text}");
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Client/Recv", "Dropping malformed frame: {e}");
                return;
            }
        };
        if let Some(frame) = self.handle_response(frame).await {
            let (id, frame_type) = (frame.id.clone(), frame.frame_type);
            if !self.router.dispatch(self, frame).await {
                warn!(
                    target: "Client/Recv",
                    "Received unhandled frame {id:?} of type {}",
                    frame_type.code()
                );
            }
        }
    }

    async fn drain_loop(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = transport.send(text.as_bytes()).await {
                warn!(target: "Client/Send", "Failed to write frame: {e}");
                self.on_connection_lost().await;
                return;
            }
        }
        debug!(target: "Client/Send", "Outbound queue closed");
    }

    /// Queues a serialized frame for the drain loop.
    pub(crate) async fn enqueue(&self, text: String) -> Result<(), RequestError> {
        let guard = self.outbound.lock().await;
        let sender = guard.as_ref().ok_or(RequestError::NotConnected)?;
        trace!(target: "Client/Send", "--> {text}");
        sender
            .send(text)
            .map_err(|_| RequestError::InternalChannelClosed)
    }

    /// Sends a frame without waiting for an answer.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.enqueue(envelope.to_json()).await?;
        Ok(())
    }

    pub(crate) fn mark_heartbeat(&self) {
        let elapsed = self.heartbeat_epoch.elapsed().as_millis();
        let encoded = u64::try_from(elapsed).unwrap_or(u64::MAX - 1) + 1;
        self.last_heartbeat.store(encoded, Ordering::Relaxed);
    }

    /// When the last sign of life from the box arrived, in local time.
    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        match self.last_heartbeat.load(Ordering::Relaxed) {
            0 => None,
            encoded => Some(self.heartbeat_epoch + Duration::from_millis(encoded - 1)),
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        if self.event_tx.send(event).is_err() {
            trace!(target: "Client", "Event receiver dropped");
        }
    }
}
