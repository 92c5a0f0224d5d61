//! Local control surface
//!
//! Named channels the host application invokes to start feeds. Each channel
//! has at most one entry; registering twice is refused so a handler set up
//! twice never runs two start paths for one request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::logging::targets;
use crate::types::{FeedKind, StreamState};

/// Something the control surface can start and stop.
#[async_trait::async_trait]
pub trait ControlEntry: Send + Sync + 'static {
    fn feed(&self) -> FeedKind;

    async fn start(&self) -> bool;

    async fn stop(&self) -> bool;

    fn state(&self) -> StreamState;
}

/// Channel name to entry registry.
#[derive(Default)]
pub struct ControlSurface {
    entries: RwLock<HashMap<&'static str, Arc<dyn ControlEntry>>>,
}

impl ControlSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` under `channel`. `false` if the channel is taken.
    pub fn register(&self, channel: &'static str, entry: Arc<dyn ControlEntry>) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(channel) {
            debug!(target: targets::HANDLERS, "Handler for {} already registered", channel);
            return false;
        }
        entries.insert(channel, entry);
        debug!(target: targets::HANDLERS, "Registered handler for {}", channel);
        true
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        usize::from(self.entries.read().contains_key(channel))
    }

    /// Run the start path registered under `channel`.
    pub async fn invoke(&self, channel: &str) -> bool {
        let entry = self.entries.read().get(channel).cloned();
        match entry {
            Some(entry) => entry.start().await,
            None => {
                warn!("No handler registered for {}", channel);
                false
            }
        }
    }

    pub fn entry(&self, channel: &str) -> Option<Arc<dyn ControlEntry>> {
        self.entries.read().get(channel).cloned()
    }

    pub fn entry_for_feed(&self, feed: FeedKind) -> Option<Arc<dyn ControlEntry>> {
        self.entries.read().values().find(|e| e.feed() == feed).cloned()
    }

    /// Stop every entry that is not already inactive.
    pub async fn stop_all(&self) -> bool {
        let entries: Vec<_> = self.entries.read().values().cloned().collect();
        let mut all_stopped = true;
        for entry in entries {
            if entry.state() != StreamState::Inactive {
                all_stopped &= entry.stop().await;
            }
        }
        all_stopped
    }

    pub fn channels(&self) -> Vec<&'static str> {
        let mut channels: Vec<_> = self.entries.read().keys().copied().collect();
        channels.sort_unstable();
        channels
    }
}

impl std::fmt::Debug for ControlSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSurface").field("channels", &self.channels()).finish()
    }
}
