//! WebSocket relay transport
//!
//! Clients connect to `ws://host:port/<path>?id=<peer-id>`; without an id
//! they get a random one. Each client runs in its own task that forwards
//! queued envelopes, reports inbound text to the manager, and drops the
//! connection once the client stays silent past the alive timeout. The
//! server pings every third of that timeout, so a viewer that only listens
//! stays alive through its pongs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{RelayTransport, TransportEvent};
use crate::config::PeerServerConfig;
use crate::error::{BridgeError, PeerSendError, Result};
use crate::gateway::PeerChannel;
use crate::logging::targets;

/// One connected WebSocket client.
#[derive(Debug)]
pub struct WsClient {
    id: String,
    outbound: mpsc::UnboundedSender<Arc<str>>,
    buffered: AtomicUsize,
    connected: AtomicBool,
    close: CancellationToken,
}

impl WsClient {
    fn shut(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.close.cancel();
    }
}

impl PeerChannel for WsClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, text: Arc<str>) -> std::result::Result<(), PeerSendError> {
        if !self.is_connected() {
            return Err(PeerSendError::NotConnected);
        }
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::Relaxed);
        self.outbound.send(text).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::Relaxed);
            PeerSendError::Closed
        })
    }

    fn close(&self) {
        self.shut();
    }
}

struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    clients: RwLock<HashMap<String, Arc<WsClient>>>,
    listener: Mutex<Option<ListenerHandle>>,
}

/// [`RelayTransport`] over plain WebSockets.
#[derive(Clone, Default)]
pub struct WsRelayTransport {
    shared: Arc<Shared>,
}

impl WsRelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound address, once listening. Useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.lock().as_ref().map(|l| l.local_addr)
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.read().len()
    }
}

#[async_trait::async_trait]
impl RelayTransport for WsRelayTransport {
    async fn listen(
        &self,
        config: &PeerServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        if self.has_listener() {
            return Err(BridgeError::transport("relay transport is already listening"));
        }

        let listener = TcpListener::bind(config.bind_addr()).await.map_err(|e| {
            BridgeError::transport_with_source(format!("failed to bind {}", config.bind_addr()), Box::new(e))
        })?;
        let local_addr = listener.local_addr()?;
        info!(target: targets::NETWORK, "Relay transport bound to {}", local_addr);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            config.clone(),
            events,
            cancel.clone(),
        ));
        *self.shared.listener.lock() = Some(ListenerHandle { local_addr, cancel, task });
        Ok(())
    }

    fn has_listener(&self) -> bool {
        self.shared.listener.lock().is_some()
    }

    fn is_client_connected(&self, client_id: &str) -> bool {
        self.shared.clients.read().get(client_id).is_some_and(|c| c.is_connected())
    }

    fn connected_clients(&self) -> Vec<Arc<dyn PeerChannel>> {
        self.shared
            .clients
            .read()
            .values()
            .filter(|c| c.is_connected())
            .map(|c| Arc::clone(c) as Arc<dyn PeerChannel>)
            .collect()
    }

    fn reject(&self, client_id: &str) {
        if let Some(client) = self.shared.clients.write().remove(client_id) {
            client.shut();
        }
    }

    async fn close_client_sockets(&self) -> Result<()> {
        let clients: Vec<_> = self.shared.clients.write().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.shut();
        }
        debug!(target: targets::NETWORK, "Closed {} client sockets", clients.len());
        Ok(())
    }

    async fn close_listener(&self) -> Result<()> {
        let handle = self.shared.listener.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        handle.cancel.cancel();
        handle
            .task
            .await
            .map_err(|e| BridgeError::transport_with_source("listener task failed", Box::new(e)))
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    config: PeerServerConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    let config = Arc::new(config);
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                trace!(target: targets::NETWORK, "TCP connection from {}", addr);
                tokio::spawn(serve_client(
                    Arc::clone(&shared),
                    stream,
                    Arc::clone(&config),
                    events.clone(),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                warn!(target: targets::NETWORK, "Accept failed: {}", e);
                let _ = events.send(TransportEvent::Error { error: e.into() });
                break;
            }
        }
    }
    debug!(target: targets::NETWORK, "Accept loop stopped");
}

/// Pull `id` out of a query string.
fn query_id(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "id" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

async fn serve_client(
    shared: Arc<Shared>,
    stream: TcpStream,
    config: Arc<PeerServerConfig>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut requested_id = None;
    let handshake = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        if request.uri().path() != config.path {
            let mut not_found = ErrorResponse::new(Some("unknown path".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        requested_id = query_id(request.uri().query());
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, handshake).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(target: targets::NETWORK, "WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut sink, mut inbound) = ws.split();

    let id = requested_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let (outbound, mut queue) = mpsc::unbounded_channel::<Arc<str>>();
    let client = Arc::new(WsClient {
        id: id.clone(),
        outbound,
        buffered: AtomicUsize::new(0),
        connected: AtomicBool::new(true),
        close: shutdown,
    });

    let taken = {
        let mut clients = shared.clients.write();
        let taken = clients.get(&id).is_some_and(|c| c.is_connected());
        if !taken {
            clients.insert(id.clone(), Arc::clone(&client));
        }
        taken
    };
    if taken {
        warn!(target: targets::NETWORK, client = %id, "Peer id already connected");
        let _ = sink.send(Message::Close(None)).await;
        return;
    }
    if events.send(TransportEvent::Connected { peer: client.clone() }).is_err() {
        client.shut();
    }

    let alive_timeout = config.alive_timeout();
    let mut deadline = Instant::now() + alive_timeout;
    let ping_every = ping_interval(alive_timeout);
    let mut heartbeat = interval_at(Instant::now() + ping_every, ping_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = client.close.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(text) = queue.recv() => {
                let len = text.len();
                let sent = sink.send(Message::Text(text.to_string())).await;
                client.buffered.fetch_sub(len, Ordering::Relaxed);
                if let Err(e) = sent {
                    debug!(target: targets::NETWORK, client = %id, "Send failed: {}", e);
                    break;
                }
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    deadline = Instant::now() + alive_timeout;
                    let _ = events.send(TransportEvent::Message { client_id: id.clone(), text });
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {
                    deadline = Instant::now() + alive_timeout;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(target: targets::NETWORK, client = %id, "Receive failed: {}", e);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                trace!(target: targets::NETWORK, client = %id, "Ping");
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!(target: targets::NETWORK, client = %id, "Ping failed: {}", e);
                    break;
                }
            }
            _ = sleep_until(deadline) => {
                info!(target: targets::NETWORK, client = %id, "Dropping client after alive timeout");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    client.connected.store(false, Ordering::SeqCst);
    {
        let mut clients = shared.clients.write();
        if clients.get(&id).is_some_and(|c| Arc::ptr_eq(c, &client)) {
            clients.remove(&id);
        }
    }
    let _ = events.send(TransportEvent::Disconnected { client_id: id });
}

fn ping_interval(alive_timeout: Duration) -> Duration {
    (alive_timeout / 3).max(Duration::from_millis(1))
}
