//! Error types for tilemosaic operations.
//!
//! Every failure surfaced by the engines is one of four kinds. Setup failures
//! (no device, zero workers, device memory exhausted) and dimension violations
//! are caught before any kernel is dispatched; transfer failures come from a
//! peer that went away mid-collective. Validation *mismatches* are not errors,
//! see [`crate::validate::ValidationReport`].

use std::fmt;

/// Errors that can occur during tilemosaic operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileError {
    /// A compute resource could not be set up.
    SetupError {
        /// The resource that failed (device, queue, pool, buffer...).
        resource: String,
        /// Human-readable error message.
        message: String,
    },
    /// Operand shapes do not agree or are not aligned to the tile size.
    DimensionError {
        /// Human-readable error message.
        message: String,
    },
    /// A transfer between host, devices or ranks failed.
    TransferError {
        /// Rank or device on the other side of the transfer.
        peer: usize,
        /// Human-readable error message.
        message: String,
    },
    /// Input validation error.
    ValidationError {
        /// Human-readable error message.
        message: String,
    },
}

impl fmt::Display for TileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileError::SetupError { resource, message } => {
                write!(f, "Setup failed for {}: {}", resource, message)
            }
            TileError::DimensionError { message } => {
                write!(f, "Dimension error: {}", message)
            }
            TileError::TransferError { peer, message } => {
                write!(f, "Transfer with peer {} failed: {}", peer, message)
            }
            TileError::ValidationError { message } => {
                write!(f, "Validation error: {}", message)
            }
        }
    }
}

impl std::error::Error for TileError {}

/// Result type alias for tilemosaic operations.
pub type Result<T> = std::result::Result<T, TileError>;

/// Creates a setup error.
pub fn setup_error(resource: impl Into<String>, message: impl Into<String>) -> TileError {
    TileError::SetupError {
        resource: resource.into(),
        message: message.into(),
    }
}

/// Creates a dimension error.
pub fn dimension_error(message: impl Into<String>) -> TileError {
    TileError::DimensionError {
        message: message.into(),
    }
}

/// Creates a transfer error.
pub fn transfer_error(peer: usize, message: impl Into<String>) -> TileError {
    TileError::TransferError {
        peer,
        message: message.into(),
    }
}

/// Creates a validation error.
pub fn validation_error(message: impl Into<String>) -> TileError {
    TileError::ValidationError {
        message: message.into(),
    }
}
