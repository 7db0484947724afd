use thiserror::Error;

/// Errors raised by the host orchestration layer.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The requested placement does not fit the fleet (PE count or PE memory)
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A bulk copy to or from a PE was rejected
    #[error("Transfer error: {0}")]
    TransferError(String),

    /// Embeddings within one call do not share the same batch count
    #[error("Unsupported batch shape: {0}")]
    UnsupportedBatchShape(String),

    /// Launch or synchronization of the fleet failed
    #[error("Dispatch error: {0}")]
    DispatchError(String),

    /// Input batch violates its offsets/indices invariants
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Embedding table set does not match the rank mapping
    #[error("Invalid table: {0}")]
    InvalidTable(String),

    /// Pipeline ring or task failure
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error occurred (config files, log directories)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FleetError {
    /// Whether the fleet must be considered unusable after this error.
    ///
    /// Transfer and capacity failures leave PE memory in an undefined state;
    /// a failed launch only invalidates the call that issued it.
    pub fn is_fatal_for_fleet(&self) -> bool {
        !matches!(
            self,
            FleetError::DispatchError(_)
                | FleetError::UnsupportedBatchShape(_)
                | FleetError::InvalidBatch(_)
        )
    }
}

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;

impl From<toml::ser::Error> for FleetError {
    fn from(e: toml::ser::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(e: toml::de::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}
