// Parkline - Parking occupancy, pricing and booking core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Data model
//!
//! Identifiers, provisioned records (lots, slots, users), the sensor event and
//! sync batch types exchanged between gateways and the coordinator, pricing
//! snapshots and bookings.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Parking lot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LotId(pub u32);

/// Slot identifier, e.g. `F3-04`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub String);

/// User identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Booking identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(pub u64);

/// Edge gateway identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayId(pub String);

/// Opaque batch identifier, unique per gateway
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BatchId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            /// Borrow the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

macro_rules! numeric_id {
    ($name:ident) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(SlotId);
string_id!(GatewayId);
string_id!(BatchId);
numeric_id!(LotId);
numeric_id!(UserId);
numeric_id!(BookingId);

// ============================================================================
// Provisioned records
// ============================================================================

/// A parking lot. Immutable after provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,
    pub name: String,
    pub location: String,
    /// Gateway responsible for this lot's sensors
    pub gateway_id: GatewayId,
    /// Slots in display order
    pub slots: Vec<SlotId>,
}

/// A registered user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Slot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Free,
    Occupied,
    Reserved,
    OutOfService,
}

impl SlotStatus {
    /// Status implied by a raw occupancy reading
    pub fn from_occupancy(occupied: bool) -> Self {
        if occupied {
            Self::Occupied
        } else {
            Self::Free
        }
    }

    /// Whether sensor merges may overwrite this status
    pub fn follows_sensor(&self) -> bool {
        matches!(self, Self::Free | Self::Occupied)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Free => "Free",
            Self::Occupied => "Occupied",
            Self::Reserved => "Reserved",
            Self::OutOfService => "OutOfService",
        };
        f.write_str(s)
    }
}

/// Authoritative state of one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub lot_id: LotId,
    pub status: SlotStatus,
    /// Highest sensor sequence applied so far (0 = none)
    pub last_sequence: u64,
    /// Latest applied sensor reading, kept even while a booking overrides it
    pub sensed_occupied: bool,
    /// Booking owning the Reserved status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<BookingId>,
    /// Set when a gateway reported dropped events for this slot
    #[serde(default)]
    pub resync_required: bool,
    /// Bumped on every mutation; stores keep the highest revision
    #[serde(default)]
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl Slot {
    /// A freshly provisioned, free slot
    pub fn new(id: impl Into<SlotId>, lot_id: LotId) -> Self {
        Self {
            id: id.into(),
            lot_id,
            status: SlotStatus::Free,
            last_sequence: 0,
            sensed_occupied: false,
            holder: None,
            resync_required: false,
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    /// Record a mutation
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.updated_at = now;
    }
}

// ============================================================================
// Sensor events and sync batches
// ============================================================================

/// A single occupancy change reported by a sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub slot_id: SlotId,
    pub occupied: bool,
    /// Monotonic per slot; the only ordering authority
    pub sequence: u64,
    pub gateway_id: GatewayId,
    /// Informational only
    pub timestamp: DateTime<Utc>,
}

impl SensorEvent {
    /// Create an event stamped with the current time
    pub fn new(
        slot_id: impl Into<SlotId>,
        occupied: bool,
        sequence: u64,
        gateway_id: impl Into<GatewayId>,
    ) -> Self {
        Self {
            slot_id: slot_id.into(),
            occupied,
            sequence,
            gateway_id: gateway_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Synthetic "resync required" marker standing in for evicted events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapMarker {
    pub gateway_id: GatewayId,
    /// Number of events dropped
    pub evicted: u64,
    /// Slots whose events were dropped
    pub slots: BTreeSet<SlotId>,
}

impl GapMarker {
    /// Empty marker for a gateway
    pub fn new(gateway_id: GatewayId) -> Self {
        Self {
            gateway_id,
            evicted: 0,
            slots: BTreeSet::new(),
        }
    }

    /// Account for one evicted event
    pub fn absorb(&mut self, event: &SensorEvent) {
        self.evicted += 1;
        self.slots.insert(event.slot_id.clone());
    }

    /// Fold another marker into this one
    pub fn merge(&mut self, other: GapMarker) {
        self.evicted += other.evicted;
        self.slots.extend(other.slots);
    }
}

/// One entry of a sync batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchEntry {
    Event(SensorEvent),
    ResyncRequired(GapMarker),
}

/// Atomically delivered group of entries from one gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub gateway_id: GatewayId,
    pub batch_id: BatchId,
    pub entries: Vec<BatchEntry>,
}

impl SyncBatch {
    /// Number of sensor events carried (gap markers excluded)
    pub fn event_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, BatchEntry::Event(_)))
            .count()
    }

    /// Whether the batch carries nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Acknowledgment returned once a batch is durably merged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: BatchId,
    /// Batch id had already been applied; nothing was re-merged
    pub duplicate: bool,
    /// Events that advanced a slot
    pub applied: usize,
    /// Events absorbed as stale or duplicate
    pub stale: usize,
    /// Events for slots the coordinator does not know
    pub unknown: usize,
    /// Gap markers received
    pub gaps: usize,
}

// ============================================================================
// Pricing
// ============================================================================

/// Time-of-day band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeBand {
    Peak,
    OffPeak,
}

/// Immutable pricing state for one lot at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    /// Monotonic across all lots
    pub id: u64,
    pub lot_id: LotId,
    pub base_rate: f64,
    pub occupancy_ratio: f64,
    pub occupancy_factor: f64,
    pub band: TimeBand,
    pub time_of_day_multiplier: f64,
    pub daily_cap: f64,
    /// Rate before the hourly ceiling
    pub computed_rate: f64,
    /// Rate quoted to users
    pub final_rate: f64,
    pub valid_from: DateTime<Utc>,
}

impl PricingSnapshot {
    /// Total charge for a duration in cents: `min(final_rate × hours, daily_cap)`
    pub fn quote(&self, duration_hours: u32) -> f64 {
        let uncapped = (self.final_rate * f64::from(duration_hours) * 100.0).round() / 100.0;
        uncapped.min(self.daily_cap)
    }

    /// Whether the snapshot was computed inside a peak window
    pub fn is_peak(&self) -> bool {
        self.band == TimeBand::Peak
    }
}

// ============================================================================
// Bookings
// ============================================================================

/// Booking lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Pending or Active
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// Parse a case-insensitive status name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Pricing data copied into a booking at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLock {
    pub snapshot_id: u64,
    pub rate_per_hour: f64,
    pub daily_cap: f64,
    pub peak: bool,
    pub locked_at: DateTime<Utc>,
}

/// A reservation of one slot by one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub slot_id: SlotId,
    pub lot_id: LotId,
    pub duration_hours: u32,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    price_lock: PriceLock,
    locked_price: f64,
}

impl Booking {
    /// Create a Pending booking, locking the snapshot's price
    pub fn new(
        id: BookingId,
        user_id: UserId,
        slot_id: SlotId,
        snapshot: &PricingSnapshot,
        duration_hours: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            slot_id,
            lot_id: snapshot.lot_id,
            duration_hours,
            status: BookingStatus::Pending,
            created_at: now,
            start_time: now,
            end_time: now + Duration::hours(i64::from(duration_hours)),
            ended_at: None,
            price_lock: PriceLock {
                snapshot_id: snapshot.id,
                rate_per_hour: snapshot.final_rate,
                daily_cap: snapshot.daily_cap,
                peak: snapshot.is_peak(),
                locked_at: now,
            },
            locked_price: snapshot.quote(duration_hours),
        }
    }

    /// Total charge, fixed at creation
    pub fn locked_price(&self) -> f64 {
        self.locked_price
    }

    /// Pricing data fixed at creation
    pub fn price_lock(&self) -> &PriceLock {
        &self.price_lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(final_rate: f64, daily_cap: f64) -> PricingSnapshot {
        PricingSnapshot {
            id: 1,
            lot_id: LotId(1),
            base_rate: 2.0,
            occupancy_ratio: 0.0,
            occupancy_factor: 0.5,
            band: TimeBand::Peak,
            time_of_day_multiplier: 1.5,
            daily_cap,
            computed_rate: final_rate,
            final_rate,
            valid_from: Utc::now(),
        }
    }

    #[test]
    fn test_slot_status_from_occupancy() {
        assert_eq!(SlotStatus::from_occupancy(true), SlotStatus::Occupied);
        assert_eq!(SlotStatus::from_occupancy(false), SlotStatus::Free);
        assert!(SlotStatus::Free.follows_sensor());
        assert!(!SlotStatus::Reserved.follows_sensor());
        assert!(!SlotStatus::OutOfService.follows_sensor());
    }

    #[test]
    fn test_gap_marker_absorb_and_merge() {
        let gw = GatewayId::from("gw-1");
        let mut gap = GapMarker::new(gw.clone());
        gap.absorb(&SensorEvent::new("A-01", true, 1, gw.clone()));
        gap.absorb(&SensorEvent::new("A-01", false, 2, gw.clone()));
        gap.absorb(&SensorEvent::new("A-02", true, 1, gw.clone()));
        assert_eq!(gap.evicted, 3);
        assert_eq!(gap.slots.len(), 2);

        let mut other = GapMarker::new(gw);
        other.evicted = 4;
        other.slots.insert(SlotId::from("A-03"));
        gap.merge(other);
        assert_eq!(gap.evicted, 7);
        assert_eq!(gap.slots.len(), 3);
    }

    #[test]
    fn test_quote_is_capped() {
        let snap = snapshot(3.0, 20.0);
        assert_eq!(snap.quote(2), 6.0);
        assert_eq!(snap.quote(10), 20.0);
    }

    #[test]
    fn test_quote_is_rounded_to_cents() {
        let snap = snapshot(4.2, 25.0);
        assert_eq!(snap.quote(3), 12.6);
        assert_eq!(snapshot(1.15, 25.0).quote(7), 8.05);
    }

    #[test]
    fn test_booking_locks_price() {
        let snap = snapshot(4.5, 25.0);
        let now = Utc::now();
        let booking = Booking::new(
            BookingId(1),
            UserId(1),
            SlotId::from("F3-04"),
            &snap,
            3,
            now,
        );
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.locked_price(), 13.5);
        assert_eq!(booking.price_lock().rate_per_hour, 4.5);
        assert!(booking.price_lock().peak);
        assert_eq!(booking.end_time - booking.start_time, Duration::hours(3));
    }

    #[test]
    fn test_booking_status_parse() {
        assert_eq!(BookingStatus::parse("active"), Some(BookingStatus::Active));
        assert_eq!(
            BookingStatus::parse("Cancelled"),
            Some(BookingStatus::Cancelled)
        );
        assert_eq!(BookingStatus::parse("bogus"), None);
        assert!(BookingStatus::Pending.is_open());
        assert!(!BookingStatus::Completed.is_open());
    }

    #[test]
    fn test_batch_entry_serde_tag() {
        let entry = BatchEntry::Event(SensorEvent::new("A-01", true, 5, "gw-1"));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"event\""));
        let back: BatchEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
