use thiserror::Error;

/// Error types for netbench operations.
///
/// Startup-phase operations (configuration, resolution, worker launch)
/// surface failures through this enum. Transport callback handlers never
/// propagate errors; they adjust per-stream state and return.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from a socket or thread operation.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or conflicting run-plan parameters.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The target hostname could not be resolved to a usable address.
    #[error("Resolution error: {0}")]
    Resolve(String),

    /// A transport stack rejected an operation during connection setup.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias for netbench operations.
pub type Result<T> = std::result::Result<T, Error>;
