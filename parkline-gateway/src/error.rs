// Parkline Gateway - Edge buffering and batch sync
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Parkline Gateway

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gateway operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// No acknowledgment within the ack timeout
    #[error("Sync timed out after {0:?}")]
    Timeout(Duration),

    /// Coordinator could not be reached
    #[error("Coordinator unreachable: {0}")]
    Unreachable(String),

    /// Coordinator refused or failed to merge the batch
    #[error("Batch {batch} rejected: {reason}")]
    Rejected { batch: String, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Buffer invariants no longer hold
    #[error("Buffer corrupt: {0}")]
    BufferCorrupt(String),
}

impl GatewayError {
    /// Whether this is a sync failure the sender retries
    pub fn is_sync_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Unreachable(_) | Self::Rejected { .. }
        )
    }
}

/// Result type alias for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_failure_classification() {
        assert!(GatewayError::Timeout(Duration::from_secs(5)).is_sync_failure());
        assert!(GatewayError::Unreachable("down".into()).is_sync_failure());
        assert!(!GatewayError::BufferCorrupt("x".into()).is_sync_failure());
        assert!(!GatewayError::InvalidConfig("x".into()).is_sync_failure());
    }
}
