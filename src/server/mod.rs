//! Relay server lifecycle
//!
//! [`PeerServerManager`] supervises a [`RelayTransport`]: it admits clients up
//! to the connection limit, registers them with the [`PeerGateway`], runs a
//! periodic health check and restarts the transport after failures, within a
//! bounded restart budget. Running out of budget is the one fatal error in the
//! bridge and is returned to the caller of [`PeerServerManager::initialize`].
//!
//! State machine:
//!
//! ```text
//! Stopped -> Starting -> Running -> (error) -> Error -> Restarting -> Starting -> ...
//!                                      any -> close() -> Stopped
//! ```

mod admission;
mod ws;

pub use admission::AdmissionSet;
pub use ws::{WsClient, WsRelayTransport};

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PeerServerConfig;
use crate::error::{BridgeError, Result};
use crate::gateway::{BroadcastReport, InboundEnvelope, PeerChannel, PeerGateway};
use crate::logging::targets;
use crate::types::ServerState;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event name peers use to ask for the list of connected peer ids.
pub const DISCOVERY_EVENT: &str = "peers";

/// What a transport reports to its manager.
pub enum TransportEvent {
    /// A client finished its handshake.
    Connected { peer: Arc<dyn PeerChannel> },
    Disconnected { client_id: String },
    /// A text message from a client.
    Message { client_id: String, text: String },
    /// The listener failed; the manager restarts the transport.
    Error { error: BridgeError },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Connected { peer } => write!(f, "Connected({})", peer.id()),
            TransportEvent::Disconnected { client_id } => write!(f, "Disconnected({client_id})"),
            TransportEvent::Message { client_id, text } => {
                write!(f, "Message({client_id}, {} bytes)", text.len())
            }
            TransportEvent::Error { error } => write!(f, "Error({error})"),
        }
    }
}

/// Relay endpoint that remote peers connect to.
#[async_trait::async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// Start accepting clients, reporting through `events`.
    async fn listen(
        &self,
        config: &PeerServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()>;

    fn has_listener(&self) -> bool;

    fn is_client_connected(&self, client_id: &str) -> bool;

    /// Clients currently connected, whether or not they were admitted.
    fn connected_clients(&self) -> Vec<Arc<dyn PeerChannel>>;

    /// Close a client's connection immediately.
    fn reject(&self, client_id: &str);

    async fn close_client_sockets(&self) -> Result<()>;

    async fn close_listener(&self) -> Result<()>;
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEvent {
    Ready { host: String, port: u16, path: String, state: ServerState },
    Connection { client_id: String },
    Disconnect { client_id: String },
    Error { message: String, state: ServerState, connections: usize },
    Closed { state: ServerState },
    Fatal { message: String },
}

/// A message from a peer that the manager does not handle itself.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRequest {
    pub client_id: String,
    pub event: String,
    pub data: serde_json::Value,
}

/// Result of one health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub listening: bool,
    /// Admitted connections before dead ones were purged.
    pub tracked: usize,
    pub active: usize,
    pub dead: usize,
    pub healthy: bool,
}

impl HealthReport {
    /// Restart only when unhealthy and clients were being tracked.
    pub fn needs_restart(&self) -> bool {
        !self.healthy && self.tracked > 0
    }
}

struct ManagerInner<T> {
    transport: T,
    config: PeerServerConfig,
    gateway: Arc<PeerGateway>,
    state: watch::Sender<ServerState>,
    admission: SyncMutex<AdmissionSet>,
    restart_attempts: AtomicU32,
    tasks: SyncMutex<CancellationToken>,
    events: broadcast::Sender<ManagerEvent>,
    requests: broadcast::Sender<PeerRequest>,
    lifecycle: Mutex<()>,
}

/// Supervises the relay transport.
pub struct PeerServerManager<T: RelayTransport> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: RelayTransport> PeerServerManager<T> {
    pub fn new(transport: T, config: PeerServerConfig, gateway: Arc<PeerGateway>) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (requests, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let admission = SyncMutex::new(AdmissionSet::new(config.max_connections));
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                config,
                gateway,
                state,
                admission,
                restart_attempts: AtomicU32::new(0),
                tasks: SyncMutex::new(CancellationToken::new()),
                events,
                requests,
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Start the transport. No-op when already running.
    ///
    /// Failures go through the restart path; only an exhausted restart budget
    /// is returned as an error.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.state() == ServerState::Running {
            debug!(target: targets::NETWORK, "Relay server already running");
            return Ok(());
        }
        info!("Initializing relay server on {}", self.inner.config.bind_addr());
        match self.inner.try_start().await {
            Ok(()) => Ok(()),
            Err(e) => self.inner.recover_locked(e).await,
        }
    }

    /// Tear the transport down and start it again.
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        match self.inner.restart_locked().await {
            Ok(()) => Ok(()),
            Err(e) => self.inner.recover_locked(e).await,
        }
    }

    /// Stop everything. Always ends in `Stopped`.
    pub async fn close(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.teardown().await;
        self.inner.set_state(ServerState::Stopped);
        self.inner.emit(ManagerEvent::Closed { state: ServerState::Stopped });
        info!("Relay server closed");
    }

    /// Count live and dead admitted connections and purge the dead ones.
    pub fn check_health(&self) -> HealthReport {
        self.inner.check_health()
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Peer messages the manager does not answer itself.
    pub fn requests(&self) -> broadcast::Receiver<PeerRequest> {
        self.inner.requests.subscribe()
    }

    pub fn can_accept_connections(&self) -> bool {
        self.inner.can_accept()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.admission.lock().len()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.inner.admission.lock().ids()
    }

    pub fn restart_attempts(&self) -> u32 {
        self.inner.restart_attempts.load(Ordering::SeqCst)
    }

    pub fn broadcast<D: Serialize>(&self, event: &str, data: &D, lossy: bool) -> Result<BroadcastReport> {
        self.inner.gateway.broadcast(event, data, lossy)
    }

    pub fn gateway(&self) -> &Arc<PeerGateway> {
        &self.inner.gateway
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn config(&self) -> &PeerServerConfig {
        &self.inner.config
    }
}

impl<T: RelayTransport> Drop for PeerServerManager<T> {
    fn drop(&mut self) {
        self.inner.tasks.lock().cancel();
    }
}

impl<T: RelayTransport> ManagerInner<T> {
    fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ServerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(target: targets::NETWORK, "Relay server state {} -> {}", previous, state);
        }
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn can_accept(&self) -> bool {
        self.state() == ServerState::Running && !self.admission.lock().is_full()
    }

    async fn try_start(self: &Arc<Self>) -> Result<()> {
        self.set_state(ServerState::Starting);

        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.listen(&self.config, tx).await?;

        let token = CancellationToken::new();
        std::mem::replace(&mut *self.tasks.lock(), token.clone()).cancel();

        tokio::spawn(Arc::clone(self).event_pump(rx, token.clone()));
        tokio::spawn(Arc::clone(self).health_loop(token.clone()));
        tokio::spawn(Arc::clone(self).scan_existing(token));

        self.set_state(ServerState::Running);
        info!(
            "Relay server listening on {}{}",
            self.config.bind_addr(),
            self.config.path
        );
        self.emit(ManagerEvent::Ready {
            host: self.config.host.clone(),
            port: self.config.port,
            path: self.config.path.clone(),
            state: ServerState::Running,
        });
        Ok(())
    }

    /// Error path. Caller holds the lifecycle lock.
    async fn recover_locked(self: &Arc<Self>, mut error: BridgeError) -> Result<()> {
        loop {
            self.set_state(ServerState::Error);
            error!("Relay server error: {}", error);
            let connections = self.admission.lock().len();
            self.emit(ManagerEvent::Error {
                message: error.to_string(),
                state: ServerState::Error,
                connections,
            });

            let attempts = self.restart_attempts.load(Ordering::SeqCst);
            if attempts >= self.config.max_restart_attempts {
                let fatal = BridgeError::restart_budget_exhausted(attempts, error);
                error!("{}; manual intervention required", fatal);
                self.emit(ManagerEvent::Fatal { message: fatal.to_string() });
                return Err(fatal);
            }

            match self.restart_locked().await {
                Ok(()) => return Ok(()),
                Err(e) => error = e,
            }
        }
    }

    /// One restart attempt. Caller holds the lifecycle lock.
    async fn restart_locked(self: &Arc<Self>) -> Result<()> {
        self.set_state(ServerState::Restarting);
        let attempt = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "Attempting relay server restart ({}/{})",
            attempt, self.config.max_restart_attempts
        );

        self.teardown().await;
        tokio::time::sleep(self.config.restart_cooldown()).await;

        self.try_start().await?;
        self.restart_attempts.store(0, Ordering::SeqCst);
        info!("Relay server restarted");
        Ok(())
    }

    async fn teardown(&self) {
        self.tasks.lock().cancel();
        if let Err(e) = self.transport.close_client_sockets().await {
            warn!("Error closing client sockets: {}", e);
        }
        if let Err(e) = self.transport.close_listener().await {
            warn!("Error closing relay listener: {}", e);
        }
        self.admission.lock().clear();
        self.gateway.clear();
    }

    fn check_health(&self) -> HealthReport {
        if !self.transport.has_listener() {
            let tracked = self.admission.lock().len();
            return HealthReport { listening: false, tracked, healthy: false, ..HealthReport::default() };
        }

        let ids = self.admission.lock().ids();
        let (live, dead): (Vec<String>, Vec<String>) =
            ids.iter().cloned().partition(|id| self.transport.is_client_connected(id));

        if !dead.is_empty() {
            let mut admission = self.admission.lock();
            for id in &dead {
                admission.remove(id);
            }
            drop(admission);
            for id in &dead {
                self.gateway.remove_peer(id);
            }
            debug!(target: targets::NETWORK, "Purged {} dead connections", dead.len());
        }

        HealthReport {
            listening: true,
            tracked: ids.len(),
            active: live.len(),
            dead: dead.len(),
            healthy: dead.is_empty() || !live.is_empty(),
        }
    }

    // Boxed: the restart path spawns a fresh loop from inside this one.
    fn health_loop(self: Arc<Self>, token: CancellationToken) -> BoxFuture<'static, ()> {
        async move { self.run_health_checks(token).await }.boxed()
    }

    async fn run_health_checks(self: &Arc<Self>, token: CancellationToken) {
        let period = self.config.health_check_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.state() != ServerState::Running {
                continue;
            }

            let report = self.check_health();
            debug!(
                target: targets::NETWORK,
                active = report.active,
                dead = report.dead,
                healthy = report.healthy,
                "Health check"
            );
            if report.needs_restart() {
                warn!("Relay server health check failed, attempting restart");
                self.supervise(None).await;
                // A successful restart runs its own health loop
                break;
            }
        }
    }

    /// Run the error path from a background task.
    async fn supervise(self: &Arc<Self>, error: Option<BridgeError>) {
        let _guard = self.lifecycle.lock().await;
        if self.state() != ServerState::Running {
            return;
        }
        let result = match error {
            Some(error) => self.recover_locked(error).await,
            None => match self.restart_locked().await {
                Ok(()) => Ok(()),
                Err(e) => self.recover_locked(e).await,
            },
        };
        if let Err(e) = result {
            error!("Relay server supervision stopped: {}", e);
        }
    }

    fn event_pump(
        self: Arc<Self>,
        rx: mpsc::UnboundedReceiver<TransportEvent>,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        async move { self.pump_events(rx, token).await }.boxed()
    }

    async fn pump_events(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<TransportEvent>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                TransportEvent::Connected { peer } => self.admit(peer),
                TransportEvent::Disconnected { client_id } => self.disconnected(&client_id),
                TransportEvent::Message { client_id, text } => self.message(client_id, &text),
                TransportEvent::Error { error } => {
                    self.supervise(Some(error)).await;
                    if token.is_cancelled() {
                        break;
                    }
                }
            }
        }
        debug!(target: targets::NETWORK, "Transport event pump stopped");
    }

    async fn scan_existing(self: Arc<Self>, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.config.existing_connection_scan()) => {}
        }
        for peer in self.transport.connected_clients() {
            if !self.admission.lock().contains(peer.id()) {
                debug!(target: targets::NETWORK, client = peer.id(), "Found existing connection");
                self.admit(peer);
            }
        }
    }

    fn admit(&self, peer: Arc<dyn PeerChannel>) {
        let client_id = peer.id().to_string();
        let admitted =
            self.state() == ServerState::Running && self.admission.lock().try_admit(&client_id);
        if !admitted {
            warn!(client = %client_id, "Connection rejected: server at capacity or not running");
            self.transport.reject(&client_id);
            return;
        }
        self.gateway.add_peer(peer);
        info!(client = %client_id, "Client connected");
        self.emit(ManagerEvent::Connection { client_id });
    }

    fn disconnected(&self, client_id: &str) {
        let was_admitted = self.admission.lock().remove(client_id);
        self.gateway.remove_peer(client_id);
        if was_admitted {
            info!(client = %client_id, "Client disconnected");
            self.emit(ManagerEvent::Disconnect { client_id: client_id.to_string() });
        }
    }

    fn message(&self, client_id: String, text: &str) {
        let envelope: InboundEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(target: targets::NETWORK, client = %client_id, "Ignoring malformed message: {}", e);
                return;
            }
        };

        if envelope.event == DISCOVERY_EVENT {
            if self.config.allow_discovery {
                let ids = self.gateway.peer_ids();
                if let Err(e) = self.gateway.send_to(&client_id, DISCOVERY_EVENT, &ids) {
                    warn!(client = %client_id, "Failed to answer discovery: {}", e);
                }
            }
            return;
        }

        let _ = self.requests.send(PeerRequest {
            client_id,
            event: envelope.event,
            data: envelope.data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockPeer, MockTransport};
    use crate::ui::LocalUi;
    use std::time::Duration;

    fn manager(config: PeerServerConfig) -> (PeerServerManager<MockTransport>, MockTransport) {
        let transport = MockTransport::new();
        let gateway = Arc::new(PeerGateway::new(LocalUi::new()));
        (PeerServerManager::new(transport.clone(), config, gateway), transport)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_emits_ready_and_is_idempotent() {
        let (manager, transport) = manager(PeerServerConfig::default());
        let mut events = manager.subscribe();

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();

        assert_eq!(manager.state(), ServerState::Running);
        assert_eq!(transport.listen_calls(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::Ready {
                host: "0.0.0.0".to_string(),
                port: 9001,
                path: "/".to_string(),
                state: ServerState::Running,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connections_are_admitted_into_the_gateway() {
        let (manager, transport) = manager(PeerServerConfig::default());
        manager.initialize().await.unwrap();

        transport.connect(MockPeer::new("a"));
        settle().await;
        assert_eq!(manager.connection_count(), 1);
        assert!(manager.gateway().contains("a"));

        transport.disconnect("a");
        settle().await;
        assert_eq!(manager.connection_count(), 0);
        assert!(!manager.gateway().contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_answers_with_peer_ids() {
        let (manager, transport) = manager(PeerServerConfig::default());
        manager.initialize().await.unwrap();
        let a = MockPeer::new("a");
        transport.connect(a.clone());
        transport.connect(MockPeer::new("b"));
        settle().await;

        transport.message("a", r#"{"event":"peers"}"#);
        settle().await;
        let sent = a.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["event"], "peers");
        assert_eq!(sent[0]["data"], serde_json::json!(["a", "b"]));
    }

    #[tokio::test(start_paused = true)]
    async fn other_messages_become_requests() {
        let (manager, transport) = manager(PeerServerConfig::default());
        let mut requests = manager.requests();
        manager.initialize().await.unwrap();
        transport.connect(MockPeer::new("a"));
        transport.message("a", r#"{"event":"feed","data":{"feed":"body"}}"#);
        transport.message("a", "not json");
        settle().await;

        let request = requests.recv().await.unwrap();
        assert_eq!(request.client_id, "a");
        assert_eq!(request.event, "feed");
        assert_eq!(request.data["feed"], "body");
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn health_predicate() {
        let (manager, transport) = manager(PeerServerConfig::default());
        manager.initialize().await.unwrap();

        let report = manager.check_health();
        assert!(report.healthy);
        assert!(!report.needs_restart());

        for id in ["a", "b"] {
            transport.connect(MockPeer::new(id));
        }
        settle().await;

        // One dead, one alive: still healthy, dead one purged
        transport.drop_silently("a");
        let report = manager.check_health();
        assert_eq!((report.active, report.dead, report.healthy), (1, 1, true));
        assert_eq!(manager.connection_ids(), vec!["b".to_string()]);

        // All dead: unhealthy and worth a restart
        transport.drop_silently("b");
        let report = manager.check_health();
        assert_eq!((report.active, report.dead, report.healthy), (0, 1, false));
        assert!(report.needs_restart());
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_restarts_after_cooldown() {
        let (manager, transport) = manager(PeerServerConfig::default());
        manager.initialize().await.unwrap();
        transport.push_error("listener reset");
        settle().await;
        assert_eq!(manager.state(), ServerState::Restarting);

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        settle().await;
        assert_eq!(manager.state(), ServerState::Running);
        assert_eq!(transport.listen_calls(), 2);
        assert_eq!(manager.restart_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_always_ends_stopped() {
        let (manager, transport) = manager(PeerServerConfig::default());
        let mut events = manager.subscribe();
        manager.initialize().await.unwrap();
        transport.fail_close_listener();
        manager.close().await;

        assert_eq!(manager.state(), ServerState::Stopped);
        assert!(!transport.has_listener());
        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            saw_closed |= event == ManagerEvent::Closed { state: ServerState::Stopped };
        }
        assert!(saw_closed);
    }
}
