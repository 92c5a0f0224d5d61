//! Local UI event bus
//!
//! Everything the host application's UI sees goes through one
//! `tokio::sync::broadcast` channel. Slow subscribers lag and miss events
//! rather than slowing the frame path.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::ProcessedFrame;

/// UI event name for body frames.
pub const BODY_FRAME: &str = "body-frame";
/// UI event name for depth-key frames.
pub const DEPTH_KEY_FRAME: &str = "depth-key-frame";

const UI_CHANNEL_CAPACITY: usize = 64;

/// Event delivered to the local UI.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// A processed frame, emitted by a stream handler.
    Frame { event: &'static str, package: Arc<ProcessedFrame> },
    /// Mirror of a peer broadcast.
    Broadcast { event: String, data: Arc<serde_json::Value>, lossy: bool },
}

impl UiEvent {
    pub fn event_name(&self) -> &str {
        match self {
            UiEvent::Frame { event, .. } => event,
            UiEvent::Broadcast { event, .. } => event,
        }
    }
}

/// Cloneable handle to the UI bus.
#[derive(Debug, Clone)]
pub struct LocalUi {
    tx: broadcast::Sender<UiEvent>,
}

impl LocalUi {
    pub fn new() -> Self {
        Self::with_capacity(UI_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Stream of processed frames published under `event`, skipping lag gaps.
    pub fn frames(&self, event: &'static str) -> impl Stream<Item = Arc<ProcessedFrame>> + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| async move {
            match item {
                Ok(UiEvent::Frame { event: name, package }) if name == event => Some(package),
                _ => None,
            }
        })
    }
}

impl Default for LocalUi {
    fn default() -> Self {
        Self::new()
    }
}
