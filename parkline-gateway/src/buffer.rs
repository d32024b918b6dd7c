// Parkline Gateway - Edge buffering and batch sync
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Bounded edge buffer
//!
//! Events move through three places:
//!
//! ```text
//! ingest ──► queue (bounded) ──► in-flight batch ──ack──► dropped
//!              │
//!              └─ overflow: oldest queued event folded into the pending gap
//! ```
//!
//! The in-flight batch is never evicted and is re-sent with the same batch id
//! until acknowledged. Evicted events are summarized by one [`GapMarker`] that
//! leads the next freshly built batch.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parkline::{BatchEntry, BatchId, GapMarker, GatewayId, SensorEvent, SyncBatch};

use crate::error::{GatewayError, Result};

/// Buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCounters {
    /// Events ingested
    pub received: u64,
    /// Events acknowledged by the coordinator
    pub forwarded: u64,
    /// Events dropped by the overflow policy
    pub evicted: u64,
}

/// Ordered, bounded event buffer owned by one gateway
#[derive(Debug)]
pub struct EdgeBuffer {
    gateway_id: GatewayId,
    capacity: usize,
    queue: VecDeque<SensorEvent>,
    pending_gap: Option<GapMarker>,
    inflight: Option<SyncBatch>,
    incarnation: u64,
    next_batch: u64,
    counters: BufferCounters,
}

impl EdgeBuffer {
    /// Create an empty buffer
    ///
    /// Batch ids embed the creation time, so a restarted gateway never reuses
    /// an id the coordinator has already applied.
    pub fn new(gateway_id: GatewayId, capacity: usize) -> Self {
        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_incarnation(gateway_id, capacity, incarnation)
    }

    /// Create an empty buffer with an explicit batch id prefix
    pub fn with_incarnation(gateway_id: GatewayId, capacity: usize, incarnation: u64) -> Self {
        Self {
            gateway_id,
            capacity,
            queue: VecDeque::with_capacity(capacity),
            pending_gap: None,
            inflight: None,
            incarnation,
            next_batch: 0,
            counters: BufferCounters::default(),
        }
    }

    /// Enqueue an event, evicting the oldest queued one when full
    ///
    /// Returns the evicted event, if any.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BufferCorrupt`] if the buffer's invariants are
    /// broken; the event is not enqueued.
    pub fn push(&mut self, event: SensorEvent) -> Result<Option<SensorEvent>> {
        self.check()?;
        self.counters.received += 1;

        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            self.pending_gap
                .get_or_insert_with(|| GapMarker::new(self.gateway_id.clone()))
                .absorb(old);
            self.counters.evicted += 1;
        }
        self.queue.push_back(event);
        Ok(evicted)
    }

    fn check(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(GatewayError::BufferCorrupt("zero capacity".into()));
        }
        if self.queue.len() > self.capacity {
            return Err(GatewayError::BufferCorrupt(format!(
                "{} queued events exceed capacity {}",
                self.queue.len(),
                self.capacity
            )));
        }
        if let Some(batch) = &self.inflight {
            if batch.is_empty() || batch.gateway_id != self.gateway_id {
                return Err(GatewayError::BufferCorrupt(format!(
                    "invalid in-flight batch {}",
                    batch.batch_id
                )));
            }
        }
        Ok(())
    }

    /// Batch to send next
    ///
    /// Returns the unacknowledged in-flight batch unchanged if there is one.
    /// Otherwise drains up to `batch_size` events (after the pending gap
    /// marker, if any) into a new batch. `None` when there is nothing to send.
    pub fn next_batch(&mut self, batch_size: usize) -> Option<SyncBatch> {
        if let Some(batch) = &self.inflight {
            return Some(batch.clone());
        }
        if self.queue.is_empty() && self.pending_gap.is_none() {
            return None;
        }

        let take = batch_size.max(1).min(self.queue.len());
        let mut entries = Vec::with_capacity(take + 1);
        if let Some(gap) = self.pending_gap.take() {
            entries.push(BatchEntry::ResyncRequired(gap));
        }
        entries.extend(self.queue.drain(..take).map(BatchEntry::Event));

        let batch = SyncBatch {
            gateway_id: self.gateway_id.clone(),
            batch_id: BatchId(format!("{:x}-{:06}", self.incarnation, self.next_batch)),
            entries,
        };
        self.next_batch += 1;
        self.inflight = Some(batch.clone());
        Some(batch)
    }

    /// Drop the in-flight batch once the coordinator acknowledged it
    ///
    /// Returns `false` if `batch_id` is not the in-flight batch.
    pub fn acknowledge(&mut self, batch_id: &BatchId) -> bool {
        match &self.inflight {
            Some(batch) if &batch.batch_id == batch_id => {
                self.counters.forwarded += batch.event_count() as u64;
                self.inflight = None;
                true
            }
            _ => false,
        }
    }

    /// Queued events (excluding the in-flight batch)
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Events in the unacknowledged batch
    pub fn in_flight(&self) -> usize {
        self.inflight.as_ref().map_or(0, SyncBatch::event_count)
    }

    /// Evicted events not yet reported to the coordinator
    pub fn unreported_gap(&self) -> u64 {
        self.pending_gap.as_ref().map_or(0, |g| g.evicted)
    }

    /// Whether nothing is waiting to be delivered
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.pending_gap.is_none() && self.inflight.is_none()
    }

    /// Maximum queued events
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counters since creation
    pub fn counters(&self) -> BufferCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity: usize) -> EdgeBuffer {
        EdgeBuffer::with_incarnation(GatewayId::from("gw-1"), capacity, 0xabc)
    }

    fn event(slot: &str, seq: u64) -> SensorEvent {
        SensorEvent::new(slot, seq % 2 == 1, seq, "gw-1")
    }

    #[test]
    fn test_push_and_batch_in_order() {
        let mut buf = buffer(10);
        for seq in 1..=3 {
            buf.push(event("A-01", seq)).unwrap();
        }
        let batch = buf.next_batch(2).unwrap();
        assert_eq!(batch.batch_id.as_str(), "abc-000000");
        assert_eq!(batch.event_count(), 2);
        assert_eq!(buf.queued(), 1);
        assert_eq!(buf.in_flight(), 2);
    }

    #[test]
    fn test_unacknowledged_batch_is_resent_unchanged() {
        let mut buf = buffer(10);
        buf.push(event("A-01", 1)).unwrap();
        let first = buf.next_batch(5).unwrap();
        buf.push(event("A-01", 2)).unwrap();
        let again = buf.next_batch(5).unwrap();
        assert_eq!(first, again);

        assert!(!buf.acknowledge(&BatchId::from("other")));
        assert!(buf.acknowledge(&first.batch_id));
        let next = buf.next_batch(5).unwrap();
        assert_ne!(next.batch_id, first.batch_id);
        assert_eq!(next.event_count(), 1);
        assert_eq!(buf.counters().forwarded, 1);
    }

    #[test]
    fn test_overflow_evicts_oldest_into_gap() {
        let mut buf = buffer(3);
        for seq in 1..=3 {
            assert!(buf.push(event("A-01", seq)).unwrap().is_none());
        }
        let evicted = buf.push(event("A-02", 1)).unwrap().unwrap();
        assert_eq!(evicted.sequence, 1);
        buf.push(event("A-02", 2)).unwrap();
        assert_eq!(buf.queued(), 3);
        assert_eq!(buf.unreported_gap(), 2);

        let batch = buf.next_batch(10).unwrap();
        match &batch.entries[0] {
            BatchEntry::ResyncRequired(gap) => {
                assert_eq!(gap.evicted, 2);
                assert!(gap.slots.contains(&parkline::SlotId::from("A-01")));
            }
            other => panic!("expected gap marker first, got {:?}", other),
        }
        assert_eq!(batch.event_count(), 3);
        assert_eq!(buf.unreported_gap(), 0);
        assert_eq!(buf.counters().evicted, 2);
    }

    #[test]
    fn test_inflight_batch_is_never_evicted() {
        let mut buf = buffer(2);
        buf.push(event("A-01", 1)).unwrap();
        buf.push(event("A-01", 2)).unwrap();
        let batch = buf.next_batch(2).unwrap();

        for seq in 3..=6 {
            buf.push(event("A-01", seq)).unwrap();
        }
        assert_eq!(buf.next_batch(2).unwrap(), batch);
        assert_eq!(buf.queued(), 2);
        assert_eq!(buf.unreported_gap(), 2);
    }

    #[test]
    fn test_gap_only_batch() {
        let mut buf = buffer(1);
        buf.push(event("A-01", 1)).unwrap();
        let batch = buf.next_batch(1).unwrap();
        buf.push(event("A-01", 2)).unwrap();
        buf.push(event("A-01", 3)).unwrap();
        assert!(buf.acknowledge(&batch.batch_id));

        let next = buf.next_batch(1).unwrap();
        assert_eq!(next.entries.len(), 2);
        assert!(matches!(next.entries[0], BatchEntry::ResyncRequired(_)));
    }

    #[test]
    fn test_empty_buffer_has_no_batch() {
        let mut buf = buffer(4);
        assert!(buf.next_batch(4).is_none());
        assert!(buf.is_drained());
    }

    #[test]
    fn test_zero_capacity_is_corrupt() {
        let mut buf = buffer(0);
        let err = buf.push(event("A-01", 1)).unwrap_err();
        assert!(matches!(err, GatewayError::BufferCorrupt(_)));
    }
}
