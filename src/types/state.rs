//! Lifecycle states of handlers and the relay server

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream handler state.
///
/// `Starting` and `Stopping` always settle into `Active` or `Inactive`;
/// a failure in either collapses back to `Inactive`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum StreamState {
    #[default]
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl StreamState {
    pub fn is_active(self) -> bool {
        self == StreamState::Active
    }
}

/// Relay server state as seen by the lifecycle manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Restarting,
    Error,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Restarting => "restarting",
            ServerState::Error => "error",
        };
        f.write_str(name)
    }
}
