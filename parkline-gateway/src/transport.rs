// Parkline Gateway - Edge buffering and batch sync
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Delivery seam between a gateway and the coordinator
//!
//! The gateway only needs "send this batch, get an ack back". HTTP, an
//! in-process call or a test double all fit behind [`SyncTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use parkline::{BatchAck, ParkingService, SyncBatch};

use crate::error::{GatewayError, Result};

/// Delivers sync batches to a coordinator
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Deliver one batch and wait for its acknowledgment
    async fn deliver(&self, batch: &SyncBatch) -> Result<BatchAck>;
}

/// Transport calling an in-process [`ParkingService`]
#[derive(Debug, Clone)]
pub struct LocalTransport {
    service: Arc<ParkingService>,
}

impl LocalTransport {
    pub fn new(service: Arc<ParkingService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn deliver(&self, batch: &SyncBatch) -> Result<BatchAck> {
        // merge may block on store I/O
        let service = Arc::clone(&self.service);
        let owned = batch.clone();
        let merged = tokio::task::spawn_blocking(move || service.apply_batch(&owned))
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        merged.map_err(|e| GatewayError::Rejected {
            batch: batch.batch_id.to_string(),
            reason: e.to_string(),
        })
    }
}
