// Parkline - Parking occupancy, pricing and booking core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Parkline
//!
//! Every failure is classified into one of four [`ErrorKind`]s so that
//! callers (and the HTTP layer) can tell a retryable conflict apart from a
//! malformed request.

use thiserror::Error;

use crate::model::{BookingId, BookingStatus, SlotId, SlotStatus};

/// Result type alias for Parkline operations
pub type Result<T> = std::result::Result<T, ParkError>;

/// Coarse classification of a [`ParkError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, rejected with no state change
    Validation,
    /// Slot not claimable right now; the caller may pick another slot
    Conflict,
    /// Unknown identifier
    NotFound,
    /// Storage unavailable or corrupt state; surfaced to the operator
    Fatal,
}

impl ErrorKind {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Fatal => "fatal",
        }
    }
}

/// Main error type for Parkline operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParkError {
    /// Input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Booking is not in a state that allows the requested action
    #[error("Booking {booking} is {status}, cannot {action}")]
    InvalidTransition {
        booking: BookingId,
        status: BookingStatus,
        action: &'static str,
    },

    /// Slot could not be claimed
    #[error("Conflict: slot {slot} is {status}")]
    Conflict { slot: SlotId, status: SlotStatus },

    /// Unknown identifier
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Backing store failed
    #[error("Storage unavailable: {0}")]
    Storage(String),

    /// In-memory or persisted state violates an invariant
    #[error("Corrupt state: {0}")]
    Corrupt(String),
}

impl ParkError {
    /// Build a [`ParkError::NotFound`]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidTransition { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Storage(_) | Self::Corrupt(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the operator has to intervene
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<std::io::Error> for ParkError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ParkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}
