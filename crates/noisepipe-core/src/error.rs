//! Error taxonomy shared by the channel, the device layer, the sampler and
//! the broker.

use std::path::PathBuf;

/// Errors returned by noisepipe.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No device exists at the requested path, or discovery found none.
    #[error("No entropy device found: {0}")]
    NotFound(String),

    /// Another process holds the exclusive lock on the device.
    #[error("Device {} is locked by another process", .0.display())]
    Busy(PathBuf),

    /// A bounded read returned nothing before the expected length arrived.
    #[error("Device read timed out after {partial} bytes")]
    Timeout {
        /// Bytes already copied into the caller's buffer.
        partial: usize,
    },

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or out-of-bounds command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Sampler working buffers could not be allocated.
    #[error("Could not allocate {requested} sampler slots")]
    AllocationFailure { requested: usize },

    /// More unique values requested than the range holds.
    #[error("Requested {size} unique values from a range of {range}")]
    RangeExceeded { size: usize, range: usize },

    /// Continuous or on-demand health test rejected device output.
    #[error("Health test failed: {0}")]
    HealthTest(String),

    /// Invalid startup configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an `Io` error from a kind and message.
    pub fn io(kind: std::io::ErrorKind, msg: impl Into<String>) -> Self {
        Self::Io(std::io::Error::new(kind, msg.into()))
    }
}
