// Parkline Gateway - Edge buffering and batch sync
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for Parkline Gateway

use std::time::Duration;

use parkline::GatewayId;

use crate::error::{GatewayError, Result};

/// Gateway-level configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identifier sent with every batch
    pub gateway_id: GatewayId,

    /// Maximum queued (not yet batched) events
    pub buffer_capacity: usize,

    /// Maximum events per sync batch
    pub batch_size: usize,

    /// Pause between sync rounds while healthy
    pub sync_interval: Duration,

    /// Time allowed for one delivery round trip
    pub ack_timeout: Duration,

    /// First retry delay after a failure
    pub backoff_initial: Duration,

    /// Upper bound on the retry delay
    pub backoff_max: Duration,

    /// Growth factor between consecutive retry delays
    pub backoff_multiplier: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: GatewayId::from("gateway"),
            buffer_capacity: 100,
            batch_size: 50,
            sync_interval: Duration::from_secs(4),
            ack_timeout: Duration::from_secs(5),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl GatewayConfig {
    /// Create a configuration for a named gateway
    pub fn for_gateway(gateway_id: impl Into<GatewayId>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            ..Default::default()
        }
    }

    /// Create a configuration with a custom buffer capacity
    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// Create a configuration with a custom batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Create a configuration with a custom sync interval
    pub fn with_sync_interval(mut self, sync_interval: Duration) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.gateway_id.as_str().is_empty() {
            return Err(GatewayError::InvalidConfig("empty gateway id".into()));
        }
        if self.buffer_capacity == 0 {
            return Err(GatewayError::InvalidConfig(
                "buffer capacity must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(GatewayError::InvalidConfig(
                "batch size must be at least 1".into(),
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "ack timeout must be positive".into(),
            ));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(GatewayError::InvalidConfig(format!(
                "initial backoff {:?} exceeds maximum {:?}",
                self.backoff_initial, self.backoff_max
            )));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(GatewayError::InvalidConfig(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}
