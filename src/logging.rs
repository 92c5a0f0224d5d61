//! Logging setup and log categories
//!
//! Errors, warnings and info always log. Chatty categories use their own
//! tracing targets so they can be switched on with `RUST_LOG`, e.g.
//! `RUST_LOG=info,kinectron::frames=debug,kinectron::performance=debug`.

use tracing_subscriber::EnvFilter;

/// Tracing targets for the debug categories.
pub mod targets {
    /// Per-frame delivery logs.
    pub const FRAMES: &str = "kinectron::frames";
    /// Handler start/stop steps.
    pub const HANDLERS: &str = "kinectron::handlers";
    /// Peer membership and sends.
    pub const PEER: &str = "kinectron::peer";
    /// Frame-rate and encoding statistics.
    pub const PERFORMANCE: &str = "kinectron::performance";
    /// Data integrity details.
    pub const DATA: &str = "kinectron::data";
    /// Relay transport traffic.
    pub const NETWORK: &str = "kinectron::network";
}

/// Install a formatted subscriber, honouring `RUST_LOG` over `default_filter`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}
