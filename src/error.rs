//! Error types for telemetry distribution.
//!
//! Every fallible operation in the crate returns [`TelemuxError`]. Conditions that
//! the distribution core is required to absorb locally (an out-of-domain
//! conversion, a full channel) are deliberately absent from this enum: a full
//! channel evicts its oldest item, and conversion failures fall back to raw
//! values inside the delta engine.
//!
//! ## Error Categories
//!
//! - **Session Errors**: unknown or malformed session tokens (surfaced as 401)
//! - **Definition Errors**: unknown packet ids, malformed packet layouts
//! - **Codec Errors**: packets too short to decode, archived rows that cannot be re-encoded
//! - **Datastore Errors**: archive connection and query failures
//! - **Transport Errors**: closed or broken client connections
//!
//! ```rust
//! use telemux::TelemuxError;
//!
//! let error = TelemuxError::session_not_found("4f1c");
//! assert!(error.is_unauthorized());
//! assert!(!error.is_retryable());
//! ```

use thiserror::Error;

/// Result type alias for telemux operations.
pub type Result<T, E = TelemuxError> = std::result::Result<T, E>;

/// Main error type for telemux operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TelemuxError {
    #[error("Invalid session id: {token}")]
    SessionNotFound { token: String },

    #[error("No packet definition matching {packet}")]
    UnknownPacket { packet: String },

    #[error("Failed to decode {packet}: {details}")]
    Decode { packet: String, details: String },

    #[error("Failed to encode field '{field}': {details}")]
    Encode { field: String, details: String },

    #[error("Invalid definition in {context}: {details}")]
    Definition { context: String, details: String },

    #[error("Historical datastore unavailable: {reason}")]
    DatastoreUnavailable {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Historical datastore query failed: {reason}")]
    Datastore {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Historic data playback is disabled")]
    PlaybackDisabled,

    #[error("Invalid time range: {details}")]
    InvalidTimeRange { details: String },

    #[error("Configuration error: {details}")]
    Config { details: String },

    #[error("Serialization failed")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Stream transport failed")]
    Transport {
        #[from]
        source: std::io::Error,
    },
}

impl TelemuxError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TelemuxError::Datastore { .. } => true,
            TelemuxError::Transport { .. } => true,
            TelemuxError::SessionNotFound { .. } => false,
            TelemuxError::UnknownPacket { .. } => false,
            TelemuxError::Decode { .. } => false,
            TelemuxError::Encode { .. } => false,
            TelemuxError::Definition { .. } => false,
            TelemuxError::DatastoreUnavailable { .. } => false,
            TelemuxError::PlaybackDisabled => false,
            TelemuxError::InvalidTimeRange { .. } => false,
            TelemuxError::Config { .. } => false,
            TelemuxError::Serialization { .. } => false,
        }
    }

    /// Whether the caller should answer with an unauthorized-access response.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TelemuxError::SessionNotFound { .. })
    }

    /// Helper constructor for unknown session tokens.
    pub fn session_not_found(token: impl Into<String>) -> Self {
        TelemuxError::SessionNotFound { token: token.into() }
    }

    /// Helper constructor for packet ids or names missing from the definitions.
    pub fn unknown_packet(packet: impl std::fmt::Display) -> Self {
        TelemuxError::UnknownPacket { packet: packet.to_string() }
    }

    /// Helper constructor for decode failures.
    pub fn decode_failed(packet: impl Into<String>, details: impl Into<String>) -> Self {
        TelemuxError::Decode { packet: packet.into(), details: details.into() }
    }

    /// Helper constructor for encode failures.
    pub fn encode_failed(field: impl Into<String>, details: impl Into<String>) -> Self {
        TelemuxError::Encode { field: field.into(), details: details.into() }
    }

    /// Helper constructor for malformed definitions.
    pub fn invalid_definition(context: impl Into<String>, details: impl Into<String>) -> Self {
        TelemuxError::Definition { context: context.into(), details: details.into() }
    }

    /// Helper constructor for a datastore that could not be reached at startup.
    pub fn datastore_unavailable(reason: impl Into<String>) -> Self {
        TelemuxError::DatastoreUnavailable { reason: reason.into(), source: None }
    }

    /// Helper constructor for failed datastore queries.
    pub fn datastore_failed(reason: impl Into<String>) -> Self {
        TelemuxError::Datastore { reason: reason.into(), source: None }
    }

    /// Helper constructor for failed datastore queries with source.
    pub fn datastore_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TelemuxError::Datastore { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for invalid time ranges.
    pub fn invalid_time_range(details: impl Into<String>) -> Self {
        TelemuxError::InvalidTimeRange { details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        TelemuxError::Config { details: details.into() }
    }
}
