//! Error types for the bridge.
//!
//! Errors are split along the crate's seams:
//!
//! - [`BridgeError`] is the crate-wide error returned by fallible operations.
//! - [`SensorError`] is what a [`DepthSensor`](crate::sensor::DepthSensor)
//!   implementation reports. Some of its variants are expected noise on
//!   teardown paths and are only logged.
//! - [`PeerSendError`] is what a [`PeerChannel`](crate::gateway::PeerChannel)
//!   reports when a send fails. Closed channels are pruned by the gateway.
//!
//! ## Recovery
//!
//! ```rust
//! use kinectron::BridgeError;
//!
//! let error = BridgeError::transport("listener dropped");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Device operation '{operation}' failed")]
    Device {
        operation: String,
        #[source]
        source: SensorError,
    },

    #[error("Device is not initialized")]
    NotInitialized,

    #[error("Image encoding failed: {details}")]
    Codec { details: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Relay transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration error in {context}: {details}")]
    Config { context: String, details: String },

    #[error("Relay server restart budget exhausted after {attempts} attempts")]
    RestartBudgetExhausted {
        attempts: u32,
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Device { source, .. } => !matches!(source, SensorError::NoDevice),
            BridgeError::NotInitialized => true,
            BridgeError::Codec { .. } => false,
            BridgeError::Serialization(_) => false,
            BridgeError::Transport { .. } => true,
            BridgeError::Config { .. } => false,
            BridgeError::RestartBudgetExhausted { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BridgeError::Device { .. } => vec![
                "Check the camera is plugged in and powered",
                "Close other applications holding the device",
                "Re-initialize the device controller",
            ],
            BridgeError::NotInitialized => vec![
                "Call initialize() before starting a feed",
                "Check the sensor factory can create a handle",
            ],
            BridgeError::Codec { .. } => vec![
                "Check the frame dimensions match the buffer length",
                "Verify the codec supports RGBA input",
            ],
            BridgeError::Serialization(_) => vec![
                "Check the payload only contains serializable data",
                "Verify the envelope shape expected by peers",
            ],
            BridgeError::Transport { .. } => vec![
                "Check the relay port is not already in use",
                "Verify firewall rules allow local connections",
                "Wait for the lifecycle manager to restart the server",
            ],
            BridgeError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Compare the values against the documented defaults",
            ],
            BridgeError::RestartBudgetExhausted { .. } => vec![
                "Inspect the underlying error for the root cause",
                "Free the relay port and restart the bridge",
                "Increase max_restart_attempts if failures are transient",
            ],
        }
    }

    /// Helper constructor for device errors with operation context.
    pub fn device(operation: impl Into<String>, source: SensorError) -> Self {
        BridgeError::Device { operation: operation.into(), source }
    }

    /// Helper constructor for transport errors.
    pub fn transport(reason: impl Into<String>) -> Self {
        BridgeError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for codec errors.
    pub fn codec(details: impl Into<String>) -> Self {
        BridgeError::Codec { details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(context: impl Into<String>, details: impl Into<String>) -> Self {
        BridgeError::Config { context: context.into(), details: details.into() }
    }

    /// Helper constructor for the fatal restart error.
    pub fn restart_budget_exhausted(attempts: u32, last: BridgeError) -> Self {
        BridgeError::RestartBudgetExhausted { attempts, source: Box::new(last) }
    }

    /// Configuration file could not be read.
    pub fn config_file(path: PathBuf, source: std::io::Error) -> Self {
        BridgeError::Config { context: path.display().to_string(), details: source.to_string() }
    }

    /// Whether this error ends supervision and must reach the operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::RestartBudgetExhausted { .. })
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

impl From<serde_yaml_ng::Error> for BridgeError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        BridgeError::Config { context: "yaml".to_string(), details: err.to_string() }
    }
}

/// Errors reported by a sensor SDK binding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SensorError {
    #[error("no device connected")]
    NoDevice,

    #[error("device is not open")]
    NotOpen,

    #[error("cameras not started")]
    NotStarted,

    #[error("cameras already stopped")]
    AlreadyStopped,

    #[error("body tracker not created")]
    TrackerNotCreated,

    #[error("not listening")]
    NotListening,

    #[error("{0}")]
    Failed(String),
}

impl SensorError {
    /// Expected on best-effort stop paths; logged at warning level at most.
    pub fn is_teardown_noise(&self) -> bool {
        matches!(
            self,
            SensorError::NotStarted
                | SensorError::AlreadyStopped
                | SensorError::TrackerNotCreated
                | SensorError::NotListening
        )
    }

    /// Helper constructor for generic SDK failures.
    pub fn failed(message: impl Into<String>) -> Self {
        SensorError::Failed(message.into())
    }
}

/// Errors reported by a peer channel send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerSendError {
    #[error("connection closed")]
    Closed,

    #[error("peer not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Other(String),
}

impl PeerSendError {
    /// Closed and not-connected peers are removed from the broadcast set.
    pub fn prunes_peer(&self) -> bool {
        matches!(self, PeerSendError::Closed | PeerSendError::NotConnected)
    }
}
