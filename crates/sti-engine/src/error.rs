//! Error types for sti-engine.

/// Errors produced by engine transport calls.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine did not answer at the configured endpoint.
    #[error("cannot connect to container engine at {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    /// The engine rejected or failed an operation.
    #[error("engine {operation} failed: {message}")]
    Operation { operation: String, message: String },

    /// The engine answered with output we could not interpret.
    #[error("cannot parse engine {operation} output: {message}")]
    Parse { operation: String, message: String },

    /// Spawning, timing out, or reading from the transport process failed.
    #[error(transparent)]
    Util(#[from] sti_util::error::UtilError),
}
