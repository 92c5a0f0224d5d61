//! Peer broadcast gateway
//!
//! Fans one serialized envelope out to every connected peer and mirrors it
//! to the local UI. Peers whose channel has closed are pruned on the spot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{PeerSendError, Result};
use crate::logging::targets;
use crate::types::now_millis;
use crate::ui::{LocalUi, UiEvent};

/// One connected remote peer, as seen by the gateway.
pub trait PeerChannel: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Bytes queued for this peer and not yet flushed.
    fn buffered_amount(&self) -> usize;

    fn is_connected(&self) -> bool;

    /// Queue a serialized envelope. Must not block.
    fn send(&self, text: Arc<str>) -> std::result::Result<(), PeerSendError>;

    fn close(&self);
}

/// Outbound message envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    pub event: &'a str,
    pub data: &'a T,
    pub timestamp: u64,
}

/// Inbound message envelope sent by peers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    /// Skipped because the peer was back-pressured on a lossy send.
    pub skipped: usize,
    /// Removed after a closed-channel failure.
    pub pruned: usize,
    /// Failed for other reasons and kept.
    pub failed: usize,
}

type PeerMap = HashMap<String, Arc<dyn PeerChannel>>;

/// Sends events to all connected peers.
pub struct PeerGateway {
    peers: RwLock<PeerMap>,
    ui: LocalUi,
}

impl PeerGateway {
    pub fn new(ui: LocalUi) -> Self {
        Self { peers: RwLock::new(HashMap::new()), ui }
    }

    /// Register a peer, replacing any previous channel with the same id.
    pub fn add_peer(&self, peer: Arc<dyn PeerChannel>) {
        let id = peer.id().to_string();
        if let Some(previous) = self.peers.write().insert(id.clone(), peer) {
            debug!(target: targets::PEER, peer = %id, "Replaced existing peer channel");
            previous.close();
        } else {
            debug!(target: targets::PEER, peer = %id, "Peer added");
        }
    }

    pub fn remove_peer(&self, id: &str) -> bool {
        let removed = self.peers.write().remove(id).is_some();
        if removed {
            debug!(target: targets::PEER, peer = %id, "Peer removed");
        }
        removed
    }

    /// Drop every peer without closing it; the transport owns the sockets.
    pub fn clear(&self) {
        self.peers.write().clear();
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Send `data` under `event` to every peer and mirror it to the UI.
    ///
    /// With `lossy` set, peers that still have bytes buffered are skipped for
    /// this message. Serialization happens once; a serialization failure is
    /// the only error returned.
    pub fn broadcast<T: Serialize>(&self, event: &str, data: &T, lossy: bool) -> Result<BroadcastReport> {
        let mut report = BroadcastReport::default();
        let snapshot: Vec<Arc<dyn PeerChannel>> = self.peers.read().values().cloned().collect();

        if !snapshot.is_empty() {
            let text: Arc<str> =
                serde_json::to_string(&Envelope { event, data, timestamp: now_millis() })?.into();

            let mut dead = Vec::new();
            for peer in &snapshot {
                if lossy && peer.buffered_amount() > 0 {
                    trace!(target: targets::PEER, peer = peer.id(), "Skipping back-pressured peer");
                    report.skipped += 1;
                    continue;
                }
                match peer.send(Arc::clone(&text)) {
                    Ok(()) => report.sent += 1,
                    Err(e) if e.prunes_peer() => {
                        debug!(target: targets::PEER, peer = peer.id(), "Pruning peer: {}", e);
                        dead.push(Arc::clone(peer));
                    }
                    Err(e) => {
                        warn!(target: targets::PEER, peer = peer.id(), "Send failed: {}", e);
                        report.failed += 1;
                    }
                }
            }

            if !dead.is_empty() {
                let mut peers = self.peers.write();
                for peer in dead {
                    // Only drop the entry if it is still the channel that failed
                    let stale = peers.get(peer.id()).is_some_and(|current| Arc::ptr_eq(current, &peer));
                    if stale {
                        peers.remove(peer.id());
                        report.pruned += 1;
                    }
                }
            }
        }

        self.ui.emit(UiEvent::Broadcast {
            event: event.to_string(),
            data: Arc::new(serde_json::to_value(data)?),
            lossy,
        });

        Ok(report)
    }

    /// Send one envelope to a single peer.
    pub fn send_to<T: Serialize>(&self, id: &str, event: &str, data: &T) -> Result<bool> {
        let Some(peer) = self.peers.read().get(id).cloned() else {
            return Ok(false);
        };
        let text: Arc<str> =
            serde_json::to_string(&Envelope { event, data, timestamp: now_millis() })?.into();
        match peer.send(text) {
            Ok(()) => Ok(true),
            Err(e) => {
                if e.prunes_peer() {
                    self.peers.write().remove(id);
                }
                warn!(target: targets::PEER, peer = %id, "Direct send failed: {}", e);
                Ok(false)
            }
        }
    }

    pub fn ui(&self) -> &LocalUi {
        &self.ui
    }
}

impl std::fmt::Debug for PeerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerGateway").field("peers", &self.peer_ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockPeer;
    use serde_json::json;

    fn gateway() -> (PeerGateway, tokio::sync::broadcast::Receiver<UiEvent>) {
        let ui = LocalUi::new();
        let rx = ui.subscribe();
        (PeerGateway::new(ui), rx)
    }

    #[test]
    fn no_peers_still_reaches_ui() {
        let (gateway, mut rx) = gateway();
        let report = gateway.broadcast("bodyFrame", &json!({"bodies": []}), true).unwrap();
        assert_eq!(report, BroadcastReport::default());
        match rx.try_recv().unwrap() {
            UiEvent::Broadcast { event, lossy, .. } => {
                assert_eq!(event, "bodyFrame");
                assert!(lossy);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn envelope_shape() {
        let (gateway, _rx) = gateway();
        let peer = MockPeer::new("p1");
        gateway.add_peer(peer.clone());
        gateway.broadcast("feed", &json!({"feed": "stop", "type": "body"}), false).unwrap();

        let sent = peer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["event"], "feed");
        assert_eq!(sent[0]["data"]["type"], "body");
        assert!(sent[0]["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn lossy_skips_only_backpressured_peers() {
        let (gateway, _rx) = gateway();
        let a = MockPeer::new("a");
        let b = MockPeer::new("b");
        let c = MockPeer::new("c");
        b.set_buffered(4096);
        for peer in [&a, &b, &c] {
            gateway.add_peer(peer.clone());
        }

        let report = gateway.broadcast("depth-key", &json!({}), true).unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(a.send_count(), 1);
        assert_eq!(b.send_count(), 0);
        assert_eq!(c.send_count(), 1);

        // Non-lossy sends ignore the buffer
        let report = gateway.broadcast("feed", &json!({}), false).unwrap();
        assert_eq!(report.sent, 3);
    }

    #[test]
    fn closed_peers_are_pruned_others_kept() {
        let (gateway, _rx) = gateway();
        let alive = MockPeer::new("alive");
        let closed = MockPeer::new("closed");
        let flaky = MockPeer::new("flaky");
        closed.fail_with(PeerSendError::Closed);
        flaky.fail_with(PeerSendError::Other("queue full".into()));
        for peer in [&alive, &closed, &flaky] {
            gateway.add_peer(peer.clone());
        }

        let report = gateway.broadcast("bodyFrame", &json!({}), true).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.pruned, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(gateway.peer_ids(), vec!["alive".to_string(), "flaky".to_string()]);
    }

    #[test]
    fn prune_does_not_remove_replacement_channel() {
        let (gateway, _rx) = gateway();
        let old = MockPeer::new("same");
        old.fail_with(PeerSendError::NotConnected);
        gateway.add_peer(old.clone());

        let replacement = MockPeer::new("same");
        // Simulate a reconnect racing the failed send
        let snapshot_peer: Arc<dyn PeerChannel> = old.clone();
        gateway.add_peer(replacement.clone());
        assert!(!Arc::ptr_eq(&snapshot_peer, &(replacement.clone() as Arc<dyn PeerChannel>)));

        let report = gateway.broadcast("x", &json!(1), false).unwrap();
        assert_eq!(report.sent, 1);
        assert!(gateway.contains("same"));
    }

    #[test]
    fn send_to_targets_single_peer() {
        let (gateway, _rx) = gateway();
        let a = MockPeer::new("a");
        let b = MockPeer::new("b");
        gateway.add_peer(a.clone());
        gateway.add_peer(b.clone());

        assert!(gateway.send_to("b", "peers", &vec!["a", "b"]).unwrap());
        assert!(!gateway.send_to("zzz", "peers", &()).unwrap());
        assert_eq!(a.send_count(), 0);
        assert_eq!(b.sent()[0]["data"][1], "b");
    }
}
