//! Error types for the OSD engine

use thiserror::Error;

use crate::output::OutputId;

/// Errors surfaced by the overlay engine.
///
/// Only [`OsdError::ProtocolFailure`] is process-fatal; the others are scoped
/// to one request, one output or one session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OsdError {
    #[error("invalid drawing spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("surface unavailable on output {output}: {reason}")]
    SurfaceUnavailable { output: OutputId, reason: String },

    #[error("no output available for channel '{channel}'")]
    NoOutputAvailable { channel: String },

    #[error("compositor protocol failure: {0}")]
    ProtocolFailure(String),
}

impl OsdError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    pub(crate) fn surface(output: OutputId, reason: impl Into<String>) -> Self {
        Self::SurfaceUnavailable {
            output,
            reason: reason.into(),
        }
    }

    /// True when the process can no longer talk to the compositor
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolFailure(_))
    }
}
