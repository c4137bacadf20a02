//! Error types for swarm coordination.

use thiserror::Error;

/// Swarm errors.
#[derive(Error, Debug)]
pub enum SwarmError {
    /// A peer could not be reached or the exchange broke off.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A peer answered with a non-success status.
    #[error("{route} returned {status}")]
    Status {
        route: &'static str,
        status: reqwest::StatusCode,
    },

    /// Shared secret or registration token rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// Peers speak different major swarm protocol versions.
    #[error("swarm protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },

    /// Request rejected because of concurrent state; retry later.
    #[error("conflict: {0}")]
    Conflict(String),

    /// This node holds no live registration with the controller.
    #[error("not registered with the controller")]
    NotRegistered,

    /// The controller has not pushed its membership view to this node yet.
    #[error("membership view not received from the controller yet")]
    MembershipPending,

    /// Too few nodes are connected for an update to proceed.
    #[error("{connected} nodes connected, {required} required")]
    InsufficientNodes { connected: usize, required: usize },

    /// At least one member failed to prepare.
    #[error("{acknowledged} of {expected} nodes prepared")]
    FanOut { acknowledged: usize, expected: usize },

    /// A response or request body was malformed.
    #[error("malformed payload: {0}")]
    Payload(String),

    /// File transfer ticket missing, unknown or corrupt.
    #[error("ticket error: {0}")]
    Ticket(String),

    /// The external updater refused an operation.
    #[error("updater error: {0}")]
    Updater(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Result type for swarm operations.
pub type Result<T> = std::result::Result<T, SwarmError>;
