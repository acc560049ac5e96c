//! The engine error taxonomy.
//!
//! Engine errors are cheap to clone so that coalesced requests for the same
//! key can all observe the one failure.

use std::fmt;
use std::sync::Arc;

use crate::key::KeyDescriptor;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// An error surfaced by key evaluation.
#[derive(Clone, Debug)]
pub enum Error {
    /// A request would close a dependency loop. The cycle lists every key
    /// on the loop in request order, starting and ending with the same key.
    CycleDetected { cycle: Vec<KeyDescriptor> },

    /// No function is registered for the requested key identifier.
    FunctionNotFound { identifier: String },

    /// A serialized value names a type the registry does not know.
    UnknownType { identifier: String },

    /// A value was present but of the wrong type.
    TypeMismatch { expected: String, got: String },

    /// The evaluation was cancelled.
    Cancelled { reason: String },

    /// A typed domain error raised by a function body. Downcast through
    /// [`Error::downcast_failed`] to recover the concrete type.
    Failed(Arc<dyn std::error::Error + Send + Sync>),

    /// Storage or infrastructure failure.
    Internal(Arc<color_eyre::Report>),
}

impl Error {
    /// Wrap a typed domain error.
    pub fn failed(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(err))
    }

    /// Access the typed domain error inside a [`Error::Failed`], if it is
    /// of type `E`.
    pub fn downcast_failed<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Failed(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CycleDetected { cycle } => {
                write!(f, "cycle detected: ")?;
                for (index, key) in cycle.iter().enumerate() {
                    if index > 0 {
                        write!(f, " -> ")?;
                    }
                    write!(f, "{key}")?;
                }
                Ok(())
            }
            Self::FunctionNotFound { identifier } => {
                write!(f, "no function registered for key identifier {identifier:?}")
            }
            Self::UnknownType { identifier } => {
                write!(f, "unknown type identifier {identifier:?}")
            }
            Self::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {expected:?}, got {got:?}")
            }
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
            Self::Failed(err) => write!(f, "{err}"),
            Self::Internal(report) => write!(f, "{report}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<color_eyre::Report> for Error {
    fn from(report: color_eyre::Report) -> Self {
        Self::Internal(Arc::new(report))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(Arc::new(err.into()))
    }
}
