//! Fleet error types.

/// Errors that can occur in the convoy crates.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// A request was rejected before any state was touched.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested car is not in the registry.
    #[error("Car not found: {0}")]
    CarNotFound(String),

    /// The requested car is known but currently disconnected.
    #[error("Car disconnected: {0}")]
    CarDisconnected(String),

    /// An operation needs an active formation but none is running.
    #[error("Formation control is not active")]
    FormationInactive,

    /// A transport-level error (UDP send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A socket could not be bound.
    #[error("Bind failed for {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// The server is not running.
    #[error("Server not running")]
    NotRunning,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Creates a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether this error was a rejected request rather than a failed operation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::CarNotFound(_)
                | Self::CarDisconnected(_)
                | Self::FormationInactive
        )
    }
}
