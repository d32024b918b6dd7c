// Parkline Gateway - Edge buffering and batch sync
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Edge gateway
//!
//! [`EdgeGateway::ingest`] is synchronous and only touches the buffer, so
//! sensor producers never wait on the network. [`EdgeGateway::run`] is the
//! sender task: it drains the buffer into batches on a fixed interval, waits
//! for each acknowledgment with a timeout and backs off exponentially while
//! the coordinator is unavailable.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parkline_gateway::{EdgeGateway, GatewayConfig, LocalTransport};
//! # fn service() -> Arc<parkline::ParkingService> { unimplemented!() }
//!
//! # async fn demo() {
//! let transport = Arc::new(LocalTransport::new(service()));
//! let gateway = Arc::new(
//!     EdgeGateway::new(GatewayConfig::for_gateway("gw-1"), transport).unwrap(),
//! );
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! tokio::spawn({
//!     let gateway = Arc::clone(&gateway);
//!     async move { gateway.run(shutdown).await }
//! });
//! gateway
//!     .ingest(parkline::SensorEvent::new("F1-01", true, 1, "gw-1"))
//!     .unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parkline::{BatchAck, GatewayId, SensorEvent};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::buffer::EdgeBuffer;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::retry::Backoff;
use crate::transport::SyncTransport;

/// Snapshot of a gateway's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStats {
    pub gateway_id: GatewayId,
    pub received: u64,
    pub forwarded: u64,
    pub batches_delivered: u64,
    /// Acks reporting the batch had already been applied
    pub duplicate_acks: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub evicted: u64,
    pub buffered: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub current_backoff_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct SyncState {
    backoff: Backoff,
    batches_delivered: u64,
    duplicate_acks: u64,
    failures: u64,
    next_retry: Duration,
    last_sync: Option<DateTime<Utc>>,
}

/// Buffers sensor events and forwards them in batches
pub struct EdgeGateway {
    config: GatewayConfig,
    buffer: Mutex<EdgeBuffer>,
    transport: Arc<dyn SyncTransport>,
    sync: Mutex<SyncState>,
}

impl std::fmt::Debug for EdgeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeGateway")
            .field("config", &self.config)
            .field("buffer", &*self.buffer.lock())
            .finish()
    }
}

impl EdgeGateway {
    /// Create a gateway
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: GatewayConfig, transport: Arc<dyn SyncTransport>) -> Result<Self> {
        config.validate()?;
        let buffer = EdgeBuffer::new(config.gateway_id.clone(), config.buffer_capacity);
        Ok(Self::with_buffer(config, buffer, transport))
    }

    /// Create a gateway around an existing buffer
    pub fn with_buffer(
        config: GatewayConfig,
        buffer: EdgeBuffer,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        let backoff = Backoff::from_config(&config);
        Self {
            config,
            buffer: Mutex::new(buffer),
            transport,
            sync: Mutex::new(SyncState {
                backoff,
                batches_delivered: 0,
                duplicate_acks: 0,
                failures: 0,
                next_retry: Duration::ZERO,
                last_sync: None,
            }),
        }
    }

    /// Get the gateway configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Gateway identifier
    pub fn id(&self) -> &GatewayId {
        &self.config.gateway_id
    }

    /// Accept a sensor event
    ///
    /// Never waits on the network. When the buffer is full the oldest queued
    /// event is evicted and reported to the coordinator as a gap.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BufferCorrupt`] only.
    pub fn ingest(&self, event: SensorEvent) -> Result<()> {
        let evicted = self.buffer.lock().push(event)?;
        if let Some(old) = evicted {
            warn!(
                gateway = %self.config.gateway_id,
                slot = %old.slot_id,
                sequence = old.sequence,
                "buffer full, oldest event evicted"
            );
        }
        Ok(())
    }

    /// Deliver at most one batch
    ///
    /// Returns `Ok(None)` when nothing is buffered. On failure the batch stays
    /// in flight and the next call resends it with the same id.
    pub async fn sync_once(&self) -> Result<Option<BatchAck>> {
        let batch = match self.buffer.lock().next_batch(self.config.batch_size) {
            Some(batch) => batch,
            None => return Ok(None),
        };

        let outcome = tokio::time::timeout(self.config.ack_timeout, self.transport.deliver(&batch))
            .await
            .unwrap_or(Err(GatewayError::Timeout(self.config.ack_timeout)))
            .and_then(|ack| {
                if ack.batch_id == batch.batch_id {
                    Ok(ack)
                } else {
                    Err(GatewayError::Rejected {
                        batch: batch.batch_id.to_string(),
                        reason: format!("acknowledged {} instead", ack.batch_id),
                    })
                }
            });

        match outcome {
            Ok(ack) => {
                self.buffer.lock().acknowledge(&ack.batch_id);
                let mut sync = self.sync.lock();
                sync.backoff.reset();
                sync.next_retry = Duration::ZERO;
                sync.batches_delivered += 1;
                sync.last_sync = Some(Utc::now());
                if ack.duplicate {
                    sync.duplicate_acks += 1;
                }
                info!(
                    gateway = %self.config.gateway_id,
                    batch = %ack.batch_id,
                    events = batch.event_count(),
                    duplicate = ack.duplicate,
                    "batch delivered"
                );
                Ok(Some(ack))
            }
            Err(err) => {
                let mut sync = self.sync.lock();
                sync.failures += 1;
                sync.next_retry = sync.backoff.next_delay();
                warn!(
                    gateway = %self.config.gateway_id,
                    batch = %batch.batch_id,
                    error = %err,
                    attempt = sync.backoff.attempts(),
                    retry_in_ms = sync.next_retry.as_millis() as u64,
                    "batch delivery failed"
                );
                Err(err)
            }
        }
    }

    /// Sender loop; returns when `shutdown` turns true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            gateway = %self.config.gateway_id,
            interval_ms = self.config.sync_interval.as_millis() as u64,
            "gateway sync loop started"
        );
        let mut delay = self.config.sync_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            delay = match self.sync_once().await {
                Ok(Some(_)) if self.has_backlog() => Duration::ZERO,
                Ok(_) => self.config.sync_interval,
                Err(err) if err.is_sync_failure() => self.sync.lock().next_retry,
                Err(err) => {
                    tracing::error!(
                        gateway = %self.config.gateway_id,
                        error = %err,
                        "gateway stopped"
                    );
                    break;
                }
            };
        }
        info!(gateway = %self.config.gateway_id, "gateway sync loop stopped");
    }

    fn has_backlog(&self) -> bool {
        !self.buffer.lock().is_drained()
    }

    /// Current counters
    pub fn stats(&self) -> GatewayStats {
        let buffer = self.buffer.lock();
        let sync = self.sync.lock();
        let counters = buffer.counters();
        GatewayStats {
            gateway_id: self.config.gateway_id.clone(),
            received: counters.received,
            forwarded: counters.forwarded,
            batches_delivered: sync.batches_delivered,
            duplicate_acks: sync.duplicate_acks,
            failures: sync.failures,
            consecutive_failures: sync.backoff.attempts(),
            evicted: counters.evicted,
            buffered: buffer.queued(),
            in_flight: buffer.in_flight(),
            capacity: buffer.capacity(),
            current_backoff_ms: sync.backoff.current().as_millis() as u64,
            last_sync: sync.last_sync,
        }
    }
}
