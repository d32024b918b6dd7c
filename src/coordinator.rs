// Parkline - Parking occupancy, pricing and booking core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Cloud coordinator
//!
//! Single source of truth for slot status. Sync batches from edge gateways are
//! merged here with a per-slot monotonic sequence rule, which makes the merge
//! commutative and idempotent:
//!
//! ```text
//! if event.sequence > slot.last_sequence {
//!     slot.last_sequence = event.sequence
//!     slot.status        = derive(event.occupied)   // unless Reserved / OutOfService
//! }
//! ```
//!
//! Every slot has its own mutex. The slot table itself is fixed at
//! provisioning, so no global lock is ever taken on the merge or claim paths.
//! Per-lot occupancy counters are atomics updated under the slot lock and read
//! without any lock by the pricing cadence.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ParkError, Result};
use crate::model::{
    BatchAck, BatchEntry, BatchId, BookingId, GapMarker, GatewayId, Lot, LotId, SensorEvent, Slot,
    SlotId, SlotStatus, SyncBatch,
};
use crate::store::{Repository, StoreImage};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Recent batch ids remembered per gateway for deduplication
    pub dedup_window: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { dedup_window: 1024 }
    }
}

/// How a released slot picks its next status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Booking cancelled: the slot is Free immediately
    Cancel,
    /// Booking completed: the slot follows the latest sensor reading
    Complete,
}

/// Result of merging one event into a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Event advanced the slot
    Applied,
    /// Sequence not newer than the slot's; absorbed
    Stale,
}

/// Apply the sequence rule to a slot. Pure; callers hold the slot lock.
pub fn merge_event(slot: &mut Slot, event: &SensorEvent) -> MergeOutcome {
    if event.sequence <= slot.last_sequence {
        return MergeOutcome::Stale;
    }
    slot.last_sequence = event.sequence;
    slot.sensed_occupied = event.occupied;
    slot.resync_required = false;
    if slot.status.follows_sensor() {
        slot.status = SlotStatus::from_occupancy(event.occupied);
    }
    MergeOutcome::Applied
}

/// Live counts for one lot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LotOccupancy {
    pub total: usize,
    pub free: usize,
    pub occupied: usize,
    pub reserved: usize,
    pub out_of_service: usize,
}

impl LotOccupancy {
    /// Share of in-service slots that are Occupied or Reserved (0.0-1.0)
    pub fn ratio(&self) -> f64 {
        let in_service = self.total.saturating_sub(self.out_of_service);
        if in_service == 0 {
            return 0.0;
        }
        (self.occupied + self.reserved) as f64 / in_service as f64
    }

    /// Occupancy as a percentage rounded to two decimals
    pub fn percent(&self) -> f64 {
        (self.ratio() * 10_000.0).round() / 100.0
    }
}

#[derive(Debug, Default)]
struct LotCounters {
    total: usize,
    free: AtomicUsize,
    occupied: AtomicUsize,
    reserved: AtomicUsize,
    out_of_service: AtomicUsize,
}

impl LotCounters {
    fn cell(&self, status: SlotStatus) -> &AtomicUsize {
        match status {
            SlotStatus::Free => &self.free,
            SlotStatus::Occupied => &self.occupied,
            SlotStatus::Reserved => &self.reserved,
            SlotStatus::OutOfService => &self.out_of_service,
        }
    }

    fn shift(&self, from: SlotStatus, to: SlotStatus) {
        if from != to {
            self.cell(from).fetch_sub(1, Ordering::Relaxed);
            self.cell(to).fetch_add(1, Ordering::Relaxed);
        }
    }

    fn read(&self) -> LotOccupancy {
        LotOccupancy {
            total: self.total,
            free: self.free.load(Ordering::Relaxed),
            occupied: self.occupied.load(Ordering::Relaxed),
            reserved: self.reserved.load(Ordering::Relaxed),
            out_of_service: self.out_of_service.load(Ordering::Relaxed),
        }
    }
}

/// Bounded set of recently applied batch ids for one gateway
#[derive(Debug)]
struct RecentBatches {
    order: VecDeque<BatchId>,
    ids: HashSet<BatchId>,
    window: usize,
}

impl RecentBatches {
    fn new(window: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            window: window.max(1),
        }
    }

    fn contains(&self, id: &BatchId) -> bool {
        self.ids.contains(id)
    }

    fn remember(&mut self, id: BatchId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.window {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

/// Merge counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub batches_applied: u64,
    pub duplicate_batches: u64,
    pub events_applied: u64,
    pub stale_events: u64,
    pub unknown_events: u64,
    pub gap_markers: u64,
    pub evicted_reported: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches_applied: AtomicU64,
    duplicate_batches: AtomicU64,
    events_applied: AtomicU64,
    stale_events: AtomicU64,
    unknown_events: AtomicU64,
    gap_markers: AtomicU64,
    evicted_reported: AtomicU64,
}

/// Authoritative slot state and the sync batch merge
pub struct CloudCoordinator {
    config: CoordinatorConfig,
    repo: Arc<dyn Repository>,
    lots: BTreeMap<LotId, Lot>,
    slots: HashMap<SlotId, Mutex<Slot>>,
    counters: HashMap<LotId, LotCounters>,
    batches: DashMap<GatewayId, RecentBatches>,
    /// Slots merged in memory whose persistence failed
    dirty: Mutex<HashSet<SlotId>>,
    stats: Counters,
}

impl std::fmt::Debug for CloudCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCoordinator")
            .field("config", &self.config)
            .field("lots", &self.lots.len())
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl CloudCoordinator {
    /// Build the coordinator from a persisted image
    ///
    /// # Errors
    ///
    /// Returns [`ParkError::Corrupt`] if a lot lists an unknown slot, a slot
    /// belongs to an unknown lot, or a Reserved slot has no holder.
    pub fn new(
        config: CoordinatorConfig,
        repo: Arc<dyn Repository>,
        image: &StoreImage,
    ) -> Result<Self> {
        let mut slots = HashMap::with_capacity(image.slots.len());
        let mut counters: HashMap<LotId, LotCounters> = HashMap::new();

        for lot in image.lots.values() {
            let lot_counters = counters.entry(lot.id).or_default();
            lot_counters.total = lot.slots.len();
            for slot_id in &lot.slots {
                let slot = image.slots.get(slot_id).ok_or_else(|| {
                    ParkError::Corrupt(format!("lot {} lists unknown slot {}", lot.id, slot_id))
                })?;
                if slot.lot_id != lot.id {
                    return Err(ParkError::Corrupt(format!(
                        "slot {} belongs to lot {}, listed under lot {}",
                        slot_id, slot.lot_id, lot.id
                    )));
                }
                if slot.status == SlotStatus::Reserved && slot.holder.is_none() {
                    return Err(ParkError::Corrupt(format!(
                        "slot {} is Reserved without a booking",
                        slot_id
                    )));
                }
                lot_counters.cell(slot.status).fetch_add(1, Ordering::Relaxed);
                slots.insert(slot_id.clone(), Mutex::new(slot.clone()));
            }
        }

        if let Some(orphan) = image.slots.keys().find(|id| !slots.contains_key(*id)) {
            return Err(ParkError::Corrupt(format!(
                "slot {} is not listed by any lot",
                orphan
            )));
        }

        let batches = DashMap::new();
        for (gateway, ids) in &image.applied_batches {
            let mut recent = RecentBatches::new(config.dedup_window);
            for id in ids {
                recent.remember(id.clone());
            }
            batches.insert(gateway.clone(), recent);
        }

        Ok(Self {
            config,
            repo,
            lots: image.lots.clone(),
            slots,
            counters,
            batches,
            dirty: Mutex::new(HashSet::new()),
            stats: Counters::default(),
        })
    }

    /// Get the coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // =====================================================================
    // Sync protocol
    // =====================================================================

    /// Merge a sync batch and acknowledge it
    ///
    /// A batch id seen before is acknowledged again without re-merging. The
    /// acknowledgment is only produced after every touched slot and the batch
    /// id itself have been persisted.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the repository rejects the write; the batch is
    /// then not acknowledged and the gateway retries it.
    pub fn apply_batch(&self, batch: &SyncBatch) -> Result<BatchAck> {
        if self.is_duplicate(&batch.gateway_id, &batch.batch_id) {
            self.stats.duplicate_batches.fetch_add(1, Ordering::Relaxed);
            warn!(
                gateway = %batch.gateway_id,
                batch = %batch.batch_id,
                "duplicate batch acknowledged without merge"
            );
            return Ok(BatchAck {
                batch_id: batch.batch_id.clone(),
                duplicate: true,
                ..Default::default()
            });
        }

        let mut ack = BatchAck {
            batch_id: batch.batch_id.clone(),
            ..Default::default()
        };
        let mut touched: HashSet<SlotId> = HashSet::new();

        for entry in &batch.entries {
            match entry {
                BatchEntry::Event(event) => match self.merge(event) {
                    Some(MergeOutcome::Applied) => {
                        ack.applied += 1;
                        touched.insert(event.slot_id.clone());
                    }
                    Some(MergeOutcome::Stale) => ack.stale += 1,
                    None => {
                        ack.unknown += 1;
                        warn!(
                            gateway = %batch.gateway_id,
                            slot = %event.slot_id,
                            "event for unknown slot dropped"
                        );
                    }
                },
                BatchEntry::ResyncRequired(gap) => {
                    ack.gaps += 1;
                    touched.extend(self.flag_gap(gap));
                }
            }
        }

        self.persist_touched(touched)?;
        self.repo.record_batch(&batch.gateway_id, &batch.batch_id)?;
        self.batches
            .entry(batch.gateway_id.clone())
            .or_insert_with(|| RecentBatches::new(self.config.dedup_window))
            .remember(batch.batch_id.clone());

        self.stats.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.stats
            .events_applied
            .fetch_add(ack.applied as u64, Ordering::Relaxed);
        self.stats
            .stale_events
            .fetch_add(ack.stale as u64, Ordering::Relaxed);
        self.stats
            .unknown_events
            .fetch_add(ack.unknown as u64, Ordering::Relaxed);

        info!(
            gateway = %batch.gateway_id,
            batch = %batch.batch_id,
            applied = ack.applied,
            stale = ack.stale,
            gaps = ack.gaps,
            "batch merged"
        );
        Ok(ack)
    }

    fn is_duplicate(&self, gateway: &GatewayId, batch: &BatchId) -> bool {
        self.batches
            .get(gateway)
            .map(|recent| recent.contains(batch))
            .unwrap_or(false)
    }

    /// Merge one event in memory. `None` if the slot is unknown.
    fn merge(&self, event: &SensorEvent) -> Option<MergeOutcome> {
        let cell = self.slots.get(&event.slot_id)?;
        let mut slot = cell.lock();
        let before = slot.status;
        let outcome = merge_event(&mut slot, event);
        if outcome == MergeOutcome::Applied {
            slot.touch(Utc::now());
            self.shift(slot.lot_id, before, slot.status);
        }
        debug!(
            slot = %event.slot_id,
            sequence = event.sequence,
            occupied = event.occupied,
            ?outcome,
            status = %slot.status,
            "sensor event merged"
        );
        Some(outcome)
    }

    fn flag_gap(&self, gap: &GapMarker) -> Vec<SlotId> {
        self.stats.gap_markers.fetch_add(1, Ordering::Relaxed);
        self.stats
            .evicted_reported
            .fetch_add(gap.evicted, Ordering::Relaxed);
        warn!(
            gateway = %gap.gateway_id,
            evicted = gap.evicted,
            slots = gap.slots.len(),
            "gateway reported dropped events; slots flagged for resync"
        );

        let mut flagged = Vec::with_capacity(gap.slots.len());
        for slot_id in &gap.slots {
            if let Some(cell) = self.slots.get(slot_id) {
                let mut slot = cell.lock();
                slot.resync_required = true;
                slot.touch(Utc::now());
                flagged.push(slot_id.clone());
            }
        }
        flagged
    }

    fn persist_touched(&self, mut touched: HashSet<SlotId>) -> Result<()> {
        touched.extend(self.dirty.lock().drain());
        if touched.is_empty() {
            return Ok(());
        }
        let copies: Vec<Slot> = touched
            .iter()
            .filter_map(|id| self.slots.get(id).map(|cell| cell.lock().clone()))
            .collect();
        if let Err(err) = self.repo.save_slots(&copies) {
            tracing::error!(error = %err, slots = copies.len(), "failed to persist merged slots");
            self.dirty.lock().extend(touched);
            return Err(err);
        }
        Ok(())
    }

    // =====================================================================
    // Reads
    // =====================================================================

    /// Current state of one slot
    pub fn current_state(&self, slot_id: &SlotId) -> Result<Slot> {
        self.slots
            .get(slot_id)
            .map(|cell| cell.lock().clone())
            .ok_or_else(|| ParkError::not_found("slot", slot_id))
    }

    /// Lot the slot belongs to
    pub fn lot_of(&self, slot_id: &SlotId) -> Result<LotId> {
        self.current_state(slot_id).map(|slot| slot.lot_id)
    }

    /// All lots in id order
    pub fn lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.values()
    }

    /// One lot
    pub fn lot(&self, lot_id: LotId) -> Result<&Lot> {
        self.lots
            .get(&lot_id)
            .ok_or_else(|| ParkError::not_found("lot", lot_id))
    }

    /// Lock-free occupancy counts for a lot
    pub fn lot_occupancy(&self, lot_id: LotId) -> Result<LotOccupancy> {
        self.counters
            .get(&lot_id)
            .map(LotCounters::read)
            .ok_or_else(|| ParkError::not_found("lot", lot_id))
    }

    /// Slots with the given status, in lot then display order
    pub fn slots_with_status(&self, lot_id: Option<LotId>, status: SlotStatus) -> Result<Vec<Slot>> {
        let lots: Vec<&Lot> = match lot_id {
            Some(id) => vec![self.lot(id)?],
            None => self.lots.values().collect(),
        };
        let mut out = Vec::new();
        for lot in lots {
            for slot_id in &lot.slots {
                if let Some(cell) = self.slots.get(slot_id) {
                    let slot = cell.lock();
                    if slot.status == status {
                        out.push(slot.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Merge counters
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            batches_applied: self.stats.batches_applied.load(Ordering::Relaxed),
            duplicate_batches: self.stats.duplicate_batches.load(Ordering::Relaxed),
            events_applied: self.stats.events_applied.load(Ordering::Relaxed),
            stale_events: self.stats.stale_events.load(Ordering::Relaxed),
            unknown_events: self.stats.unknown_events.load(Ordering::Relaxed),
            gap_markers: self.stats.gap_markers.load(Ordering::Relaxed),
            evicted_reported: self.stats.evicted_reported.load(Ordering::Relaxed),
        }
    }

    // =====================================================================
    // Booking authority
    // =====================================================================

    /// Atomically move a slot Free → Reserved on behalf of a booking
    ///
    /// # Errors
    ///
    /// - [`ParkError::NotFound`] for an unknown slot
    /// - [`ParkError::Conflict`] if the slot is not Free; nothing changes
    /// - a fatal error if persisting fails; the claim is rolled back
    pub fn claim(&self, slot_id: &SlotId, booking: BookingId) -> Result<Slot> {
        let cell = self
            .slots
            .get(slot_id)
            .ok_or_else(|| ParkError::not_found("slot", slot_id))?;
        let mut slot = cell.lock();
        if slot.status != SlotStatus::Free {
            return Err(ParkError::Conflict {
                slot: slot_id.clone(),
                status: slot.status,
            });
        }

        let previous = slot.clone();
        slot.status = SlotStatus::Reserved;
        slot.holder = Some(booking);
        slot.touch(Utc::now());
        if let Err(err) = self.repo.save_slots(&[slot.clone()]) {
            *slot = previous;
            return Err(err);
        }
        self.shift(slot.lot_id, SlotStatus::Free, SlotStatus::Reserved);
        debug!(slot = %slot_id, booking = %booking, "slot claimed");
        Ok(slot.clone())
    }

    /// Give a Reserved slot back
    ///
    /// # Errors
    ///
    /// Returns [`ParkError::Corrupt`] if `booking` does not hold the slot, or a
    /// fatal error if persisting fails (the slot then stays Reserved).
    pub fn release(&self, slot_id: &SlotId, booking: BookingId, mode: Release) -> Result<Slot> {
        let cell = self
            .slots
            .get(slot_id)
            .ok_or_else(|| ParkError::not_found("slot", slot_id))?;
        let mut slot = cell.lock();
        if slot.status != SlotStatus::Reserved || slot.holder != Some(booking) {
            return Err(ParkError::Corrupt(format!(
                "booking {} does not hold slot {} ({})",
                booking, slot_id, slot.status
            )));
        }

        let previous = slot.clone();
        slot.holder = None;
        slot.status = match mode {
            Release::Cancel => SlotStatus::Free,
            Release::Complete => SlotStatus::from_occupancy(slot.sensed_occupied),
        };
        slot.touch(Utc::now());
        if let Err(err) = self.repo.save_slots(&[slot.clone()]) {
            *slot = previous;
            return Err(err);
        }
        self.shift(slot.lot_id, SlotStatus::Reserved, slot.status);
        debug!(slot = %slot_id, booking = %booking, status = %slot.status, "slot released");
        Ok(slot.clone())
    }

    /// Take a slot out of service, or put it back
    ///
    /// # Errors
    ///
    /// Returns [`ParkError::Conflict`] while the slot is Reserved.
    pub fn set_out_of_service(&self, slot_id: &SlotId, out_of_service: bool) -> Result<Slot> {
        let cell = self
            .slots
            .get(slot_id)
            .ok_or_else(|| ParkError::not_found("slot", slot_id))?;
        let mut slot = cell.lock();
        if slot.status == SlotStatus::Reserved {
            return Err(ParkError::Conflict {
                slot: slot_id.clone(),
                status: slot.status,
            });
        }

        let target = if out_of_service {
            SlotStatus::OutOfService
        } else {
            SlotStatus::from_occupancy(slot.sensed_occupied)
        };
        if slot.status == target {
            return Ok(slot.clone());
        }

        let previous = slot.clone();
        slot.status = target;
        slot.touch(Utc::now());
        if let Err(err) = self.repo.save_slots(&[slot.clone()]) {
            *slot = previous;
            return Err(err);
        }
        self.shift(slot.lot_id, previous.status, target);
        info!(slot = %slot_id, status = %target, "slot service state changed");
        Ok(slot.clone())
    }

    fn shift(&self, lot_id: LotId, from: SlotStatus, to: SlotStatus) {
        if let Some(counters) = self.counters.get(&lot_id) {
            counters.shift(from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GatewayId;
    use crate::store::MemoryRepository;

    fn image() -> StoreImage {
        let mut image = StoreImage::default();
        let lot = Lot {
            id: LotId(1),
            name: "North".to_string(),
            location: "Campus".to_string(),
            gateway_id: GatewayId::from("gw-1"),
            slots: vec![SlotId::from("A-01"), SlotId::from("A-02")],
        };
        for id in &lot.slots {
            image.slots.insert(id.clone(), Slot::new(id.clone(), lot.id));
        }
        image.lots.insert(lot.id, lot);
        image
    }

    fn coordinator() -> CloudCoordinator {
        let repo = Arc::new(MemoryRepository::new());
        CloudCoordinator::new(CoordinatorConfig::default(), repo, &image()).unwrap()
    }

    fn event(slot: &str, occupied: bool, sequence: u64) -> BatchEntry {
        BatchEntry::Event(SensorEvent::new(slot, occupied, sequence, "gw-1"))
    }

    fn batch(id: &str, entries: Vec<BatchEntry>) -> SyncBatch {
        SyncBatch {
            gateway_id: GatewayId::from("gw-1"),
            batch_id: BatchId::from(id),
            entries,
        }
    }

    #[test]
    fn test_merge_event_rule() {
        let mut slot = Slot::new("A-01", LotId(1));
        let ev = SensorEvent::new("A-01", true, 3, "gw-1");
        assert_eq!(merge_event(&mut slot, &ev), MergeOutcome::Applied);
        assert_eq!(slot.status, SlotStatus::Occupied);
        assert_eq!(slot.last_sequence, 3);

        let older = SensorEvent::new("A-01", false, 2, "gw-1");
        assert_eq!(merge_event(&mut slot, &older), MergeOutcome::Stale);
        assert_eq!(merge_event(&mut slot, &ev), MergeOutcome::Stale);
        assert_eq!(slot.status, SlotStatus::Occupied);
    }

    #[test]
    fn test_merge_keeps_reserved() {
        let mut slot = Slot::new("A-01", LotId(1));
        slot.status = SlotStatus::Reserved;
        slot.holder = Some(BookingId(1));
        let ev = SensorEvent::new("A-01", true, 1, "gw-1");
        assert_eq!(merge_event(&mut slot, &ev), MergeOutcome::Applied);
        assert_eq!(slot.status, SlotStatus::Reserved);
        assert!(slot.sensed_occupied);
    }

    #[test]
    fn test_apply_batch_out_of_order() {
        let coord = coordinator();
        let ack = coord
            .apply_batch(&batch(
                "b1",
                vec![
                    event("A-01", true, 5),
                    event("A-01", false, 3),
                    event("A-01", true, 5),
                    event("A-01", false, 7),
                ],
            ))
            .unwrap();
        assert_eq!(ack.applied, 2);
        assert_eq!(ack.stale, 2);

        let slot = coord.current_state(&SlotId::from("A-01")).unwrap();
        assert_eq!(slot.last_sequence, 7);
        assert_eq!(slot.status, SlotStatus::Free);
    }

    #[test]
    fn test_duplicate_batch_not_remerged() {
        let coord = coordinator();
        let b = batch("b1", vec![event("A-01", true, 1)]);
        assert!(!coord.apply_batch(&b).unwrap().duplicate);
        let again = coord.apply_batch(&b).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.applied, 0);
        assert_eq!(coord.stats().duplicate_batches, 1);
    }

    #[test]
    fn test_unknown_slot_counted() {
        let coord = coordinator();
        let ack = coord
            .apply_batch(&batch("b1", vec![event("Z-99", true, 1)]))
            .unwrap();
        assert_eq!(ack.unknown, 1);
        assert_eq!(coord.stats().unknown_events, 1);
    }

    #[test]
    fn test_gap_marker_flags_slot_until_next_event() {
        let coord = coordinator();
        let mut gap = GapMarker::new(GatewayId::from("gw-1"));
        gap.absorb(&SensorEvent::new("A-02", true, 1, "gw-1"));
        coord
            .apply_batch(&batch("b1", vec![BatchEntry::ResyncRequired(gap)]))
            .unwrap();
        assert!(coord
            .current_state(&SlotId::from("A-02"))
            .unwrap()
            .resync_required);

        coord
            .apply_batch(&batch("b2", vec![event("A-02", true, 2)]))
            .unwrap();
        assert!(!coord
            .current_state(&SlotId::from("A-02"))
            .unwrap()
            .resync_required);
        assert_eq!(coord.stats().gap_markers, 1);
    }

    #[test]
    fn test_claim_and_conflict() {
        let coord = coordinator();
        let slot = SlotId::from("A-01");
        coord.claim(&slot, BookingId(1)).unwrap();
        let err = coord.claim(&slot, BookingId(2)).unwrap_err();
        assert!(matches!(
            err,
            ParkError::Conflict {
                status: SlotStatus::Reserved,
                ..
            }
        ));
        assert_eq!(coord.lot_occupancy(LotId(1)).unwrap().reserved, 1);
    }

    #[test]
    fn test_release_complete_follows_sensor() {
        let coord = coordinator();
        let slot = SlotId::from("A-01");
        coord.claim(&slot, BookingId(1)).unwrap();
        coord
            .apply_batch(&batch("b1", vec![event("A-01", true, 1)]))
            .unwrap();
        assert_eq!(
            coord.current_state(&slot).unwrap().status,
            SlotStatus::Reserved
        );

        let released = coord
            .release(&slot, BookingId(1), Release::Complete)
            .unwrap();
        assert_eq!(released.status, SlotStatus::Occupied);
    }

    #[test]
    fn test_release_cancel_frees() {
        let coord = coordinator();
        let slot = SlotId::from("A-01");
        coord.claim(&slot, BookingId(1)).unwrap();
        coord
            .apply_batch(&batch("b1", vec![event("A-01", true, 1)]))
            .unwrap();
        let released = coord.release(&slot, BookingId(1), Release::Cancel).unwrap();
        assert_eq!(released.status, SlotStatus::Free);
        assert!(coord.claim(&slot, BookingId(2)).is_ok());
    }

    #[test]
    fn test_release_by_wrong_booking_is_corrupt() {
        let coord = coordinator();
        let slot = SlotId::from("A-01");
        coord.claim(&slot, BookingId(1)).unwrap();
        let err = coord
            .release(&slot, BookingId(9), Release::Cancel)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_out_of_service_toggle() {
        let coord = coordinator();
        let slot = SlotId::from("A-02");
        let s = coord.set_out_of_service(&slot, true).unwrap();
        assert_eq!(s.status, SlotStatus::OutOfService);
        assert!(coord.claim(&slot, BookingId(1)).is_err());

        coord
            .apply_batch(&batch("b1", vec![event("A-02", true, 1)]))
            .unwrap();
        assert_eq!(
            coord.current_state(&slot).unwrap().status,
            SlotStatus::OutOfService
        );

        let s = coord.set_out_of_service(&slot, false).unwrap();
        assert_eq!(s.status, SlotStatus::Occupied);
    }

    #[test]
    fn test_occupancy_ratio() {
        let coord = coordinator();
        assert_eq!(coord.lot_occupancy(LotId(1)).unwrap().ratio(), 0.0);
        coord
            .apply_batch(&batch("b1", vec![event("A-01", true, 1)]))
            .unwrap();
        let occ = coord.lot_occupancy(LotId(1)).unwrap();
        assert_eq!(occ.occupied, 1);
        assert_eq!(occ.free, 1);
        assert_eq!(occ.ratio(), 0.5);
        assert_eq!(occ.percent(), 50.0);
    }

    #[test]
    fn test_corrupt_image_rejected() {
        let mut img = image();
        img.slots.remove(&SlotId::from("A-02"));
        let repo = Arc::new(MemoryRepository::new());
        let err = CloudCoordinator::new(CoordinatorConfig::default(), repo, &img).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_dedup_restored_from_image() {
        let mut img = image();
        img.applied_batches
            .entry(GatewayId::from("gw-1"))
            .or_default()
            .push_back(BatchId::from("b1"));
        let repo = Arc::new(MemoryRepository::new());
        let coord = CloudCoordinator::new(CoordinatorConfig::default(), repo, &img).unwrap();
        let ack = coord
            .apply_batch(&batch("b1", vec![event("A-01", true, 1)]))
            .unwrap();
        assert!(ack.duplicate);
    }

    #[test]
    fn test_recent_batches_window() {
        let mut recent = RecentBatches::new(2);
        recent.remember(BatchId::from("a"));
        recent.remember(BatchId::from("b"));
        recent.remember(BatchId::from("c"));
        assert!(!recent.contains(&BatchId::from("a")));
        assert!(recent.contains(&BatchId::from("c")));
    }
}
