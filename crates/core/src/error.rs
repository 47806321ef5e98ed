//! Error types for the link simulator.
//!
//! Only configuration and resource problems are surfaced as errors. Runtime
//! data problems on a simulated link (short packets, bad sync words, backlog)
//! are expected degradation and are logged by the streams instead.

use crate::stream::{StreamState, StreamType};
use thiserror::Error;

/// Top-level error type for all operations in the simulator.
///
/// Each variant corresponds to a specific failure domain:
/// - Config: schema violations and inconsistent parameters
/// - Resource: unknown interfaces and unavailable transport endpoints
/// - Lifecycle: operations invoked in the wrong stream state
/// - Audio: audio file collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected at construction or `config()`
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Interface or transport resource could not be obtained
    #[error("resource unavailable: {0}")]
    Resource(#[from] ResourceError),

    /// Lifecycle operation not valid in the current state
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Audio file could not be read or written
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),
}

/// Configuration errors. Every variant names the offending key.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Key is not part of the stream kind's schema
    #[error("unknown key '{key}'")]
    UnknownKey { key: String },

    /// Mandatory key was not supplied
    #[error("missing mandatory key '{key}'")]
    MissingKey { key: String },

    /// Value has the wrong JSON type
    #[error("key '{key}' expects {expected}")]
    InvalidType { key: String, expected: &'static str },

    /// Numeric value outside the declared bounds
    #[error("key '{key}' value {value} outside [{min}, {max}]")]
    OutOfRange {
        key: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Value is not one of the declared choices
    #[error("key '{key}' value {value} not one of {choices}")]
    InvalidChoice {
        key: String,
        value: String,
        choices: String,
    },

    /// Combination of keys is not coherent (e.g. channel >= channels)
    #[error("key '{key}': {reason}")]
    Inconsistent { key: String, reason: String },

    /// Validated map could not be turned into the typed configuration
    #[error("malformed configuration: {0}")]
    Malformed(String),
}

/// Resource errors raised at lookup or `create()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
    /// No stream implementation registered under this interface name
    #[error("unknown interface '{0}'")]
    UnknownInterface(String),

    /// Interface name already taken; the first registrant is kept
    #[error("interface '{0}' already registered")]
    DuplicateInterface(String),

    /// Stream kind does not implement the requested stream type
    #[error("interface '{interface}' does not support {stream_type} streams")]
    UnsupportedStreamType {
        interface: String,
        stream_type: StreamType,
    },

    /// The virtual device has no endpoint with this name
    #[error("endpoint '{0}' cannot be identified on the virtual device")]
    EndpointUnavailable(String),

    /// Handle is not (or no longer) open on the virtual device
    #[error("invalid transport handle {0}")]
    InvalidHandle(usize),

    /// Stream id does not refer to a live instance
    #[error("no stream instance with id {0}")]
    UnknownInstance(usize),
}

/// Lifecycle errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LifecycleError {
    /// Operation is not a legal transition from the current state
    #[error("cannot {operation} a stream in state {from:?}")]
    InvalidTransition {
        from: StreamState,
        operation: &'static str,
    },
}

/// Audio file collaborator errors.
#[derive(Debug, Error)]
pub enum AudioError {
    /// WAV file decoding/encoding failed
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    /// Raw file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel index beyond the number of channels in the file
    #[error("channel {channel} out of range ({channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: usize },

    /// Sample width not supported by the simulated transport
    #[error("unsupported sample width {0}")]
    UnsupportedWidth(u32),
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
