// Parkline - Parking occupancy, pricing and booking core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Booking ledger
//!
//! Reservation state machine:
//!
//! ```text
//! Pending --confirm--> Active --complete--> Completed
//!    |                   |
//!    +------cancel-------+----------------> Cancelled
//! ```
//!
//! Creating a booking claims the slot through the coordinator (Free → Reserved
//! under that slot's lock), then copies the lot's current pricing snapshot into
//! the booking. The locked price is private to [`Booking`] and never rewritten.
//!
//! Lock order is booking entry, then slot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::coordinator::{CloudCoordinator, Release};
use crate::error::{ParkError, Result};
use crate::model::{Booking, BookingId, BookingStatus, SlotId, SlotStatus, User, UserId};
use crate::pricing::PricingEngine;
use crate::store::{Repository, StoreImage};

/// Ledger configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Shortest bookable duration
    pub min_duration_hours: u32,
    /// Longest bookable duration
    pub max_duration_hours: u32,
    /// Create bookings directly in Active
    pub auto_confirm: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_duration_hours: 1,
            max_duration_hours: 24,
            auto_confirm: false,
        }
    }
}

impl LedgerConfig {
    /// Configuration that activates bookings on creation
    pub fn auto_confirming() -> Self {
        Self {
            auto_confirm: true,
            ..Default::default()
        }
    }
}

/// A booking request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub user_id: UserId,
    pub slot_id: SlotId,
    pub duration_hours: u32,
}

impl BookingRequest {
    pub fn new(user_id: UserId, slot_id: impl Into<SlotId>, duration_hours: u32) -> Self {
        Self {
            user_id,
            slot_id: slot_id.into(),
            duration_hours,
        }
    }
}

/// Booking counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BookingStats {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub cancelled: usize,
    /// Claims lost to a concurrent request or a non-free slot
    pub conflicts: u64,
    /// Sum of locked prices of completed bookings
    pub revenue: f64,
}

/// Booking state machine and store
pub struct BookingLedger {
    config: LedgerConfig,
    repo: Arc<dyn Repository>,
    coordinator: Arc<CloudCoordinator>,
    pricing: Arc<PricingEngine>,
    users: BTreeMap<UserId, User>,
    bookings: DashMap<BookingId, Booking>,
    next_id: AtomicU64,
    conflicts: AtomicU64,
}

impl std::fmt::Debug for BookingLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingLedger")
            .field("config", &self.config)
            .field("bookings", &self.bookings.len())
            .finish()
    }
}

impl BookingLedger {
    /// Build the ledger from a persisted image
    ///
    /// # Errors
    ///
    /// Returns [`ParkError::Corrupt`] if two open bookings hold the same slot
    /// or an open booking names an unknown slot.
    pub fn new(
        config: LedgerConfig,
        repo: Arc<dyn Repository>,
        coordinator: Arc<CloudCoordinator>,
        pricing: Arc<PricingEngine>,
        image: &StoreImage,
    ) -> Result<Self> {
        if config.min_duration_hours == 0 || config.min_duration_hours > config.max_duration_hours
        {
            return Err(ParkError::Validation(format!(
                "invalid duration bounds {}..={}",
                config.min_duration_hours, config.max_duration_hours
            )));
        }

        let mut holders: BTreeMap<&SlotId, BookingId> = BTreeMap::new();
        for booking in image.bookings.values().filter(|b| b.status.is_open()) {
            if let Some(other) = holders.insert(&booking.slot_id, booking.id) {
                return Err(ParkError::Corrupt(format!(
                    "bookings {} and {} are both open on slot {}",
                    other, booking.id, booking.slot_id
                )));
            }
        }

        let next_id = image.bookings.keys().map(|id| id.0).max().unwrap_or(0) + 1;
        let ledger = Self {
            config,
            repo,
            coordinator,
            pricing,
            users: image.users.clone(),
            bookings: image
                .bookings
                .iter()
                .map(|(id, b)| (*id, b.clone()))
                .collect(),
            next_id: AtomicU64::new(next_id),
            conflicts: AtomicU64::new(0),
        };
        ledger.reconcile_holds(Utc::now())?;
        Ok(ledger)
    }

    /// Align slot holds with open bookings after an interrupted create or close
    ///
    /// A Reserved slot whose holder is not an open booking on that slot is
    /// released to its sensed status. An open booking that does not hold its
    /// slot claims it again, or is cancelled if the slot has been taken.
    fn reconcile_holds(&self, now: DateTime<Utc>) -> Result<()> {
        for slot in self
            .coordinator
            .slots_with_status(None, SlotStatus::Reserved)?
        {
            let Some(holder) = slot.holder else {
                continue;
            };
            let held_by_open = self
                .bookings
                .get(&holder)
                .map_or(false, |b| b.status.is_open() && b.slot_id == slot.id);
            if !held_by_open {
                let released = self
                    .coordinator
                    .release(&slot.id, holder, Release::Complete)?;
                warn!(
                    slot = %slot.id,
                    booking = %holder,
                    status = %released.status,
                    "released hold without an open booking"
                );
            }
        }

        let stranded: Vec<BookingId> = self
            .bookings
            .iter()
            .filter(|b| b.status.is_open())
            .map(|b| b.id)
            .collect();
        for id in stranded {
            let Some(mut entry) = self.bookings.get_mut(&id) else {
                continue;
            };
            let slot = self.coordinator.current_state(&entry.slot_id).map_err(|_| {
                ParkError::Corrupt(format!(
                    "booking {} refers to unknown slot {}",
                    id, entry.slot_id
                ))
            })?;
            if slot.holder == Some(id) {
                continue;
            }
            match self.coordinator.claim(&entry.slot_id, id) {
                Ok(_) => warn!(booking = %id, slot = %entry.slot_id, "re-claimed slot for open booking"),
                Err(ParkError::Conflict { status, .. }) => {
                    let mut updated = entry.clone();
                    updated.status = BookingStatus::Cancelled;
                    updated.ended_at = Some(now);
                    self.repo.save_booking(&updated)?;
                    *entry = updated;
                    warn!(
                        booking = %id,
                        slot = %slot.id,
                        slot_status = %status,
                        "cancelled open booking whose slot was taken"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Get the ledger configuration
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Registered users in id order
    pub fn users(&self) -> Vec<User> {
        self.users.values().cloned().collect()
    }

    /// Look up a user
    pub fn user(&self, user_id: UserId) -> Result<&User> {
        self.users
            .get(&user_id)
            .ok_or_else(|| ParkError::not_found("user", user_id))
    }

    /// Claim a slot and create a booking at the current price
    ///
    /// # Errors
    ///
    /// - [`ParkError::Validation`] for an unknown user or slot, or a duration
    ///   outside the configured bounds
    /// - [`ParkError::Conflict`] if the slot is not Free; nothing changes
    pub fn create(&self, request: &BookingRequest, now: DateTime<Utc>) -> Result<Booking> {
        let BookingRequest {
            user_id,
            slot_id,
            duration_hours,
        } = request;
        if *duration_hours < self.config.min_duration_hours
            || *duration_hours > self.config.max_duration_hours
        {
            return Err(ParkError::Validation(format!(
                "duration must be between {} and {} hours, got {}",
                self.config.min_duration_hours, self.config.max_duration_hours, duration_hours
            )));
        }
        if !self.users.contains_key(user_id) {
            return Err(ParkError::Validation(format!("unknown user {}", user_id)));
        }
        let lot_id = self
            .coordinator
            .lot_of(slot_id)
            .map_err(|_| ParkError::Validation(format!("unknown slot {}", slot_id)))?;

        let id = BookingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Err(err) = self.coordinator.claim(slot_id, id) {
            if matches!(err, ParkError::Conflict { .. }) {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(slot = %slot_id, user = %user_id, "booking conflict");
            }
            return Err(err);
        }

        let booking = self
            .pricing
            .current_snapshot(lot_id)
            .and_then(|snapshot| {
                let mut booking =
                    Booking::new(id, *user_id, slot_id.clone(), &snapshot, *duration_hours, now);
                if self.config.auto_confirm {
                    booking.status = BookingStatus::Active;
                }
                self.repo.save_booking(&booking)?;
                Ok(booking)
            });
        let booking = match booking {
            Ok(booking) => booking,
            Err(err) => {
                if let Err(release_err) = self.coordinator.release(slot_id, id, Release::Cancel) {
                    error!(slot = %slot_id, error = %release_err, "failed to roll back claim");
                }
                return Err(err);
            }
        };

        self.bookings.insert(id, booking.clone());
        info!(
            booking = %id,
            user = %user_id,
            slot = %slot_id,
            hours = duration_hours,
            price = booking.locked_price(),
            status = %booking.status,
            "booking created"
        );
        Ok(booking)
    }

    /// Look up a booking
    pub fn get(&self, id: BookingId) -> Result<Booking> {
        self.bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or_else(|| ParkError::not_found("booking", id))
    }

    /// Pending → Active
    pub fn confirm(&self, id: BookingId) -> Result<Booking> {
        let mut entry = self
            .bookings
            .get_mut(&id)
            .ok_or_else(|| ParkError::not_found("booking", id))?;
        if entry.status != BookingStatus::Pending {
            return Err(ParkError::InvalidTransition {
                booking: id,
                status: entry.status,
                action: "confirm",
            });
        }

        let mut updated = entry.clone();
        updated.status = BookingStatus::Active;
        self.repo.save_booking(&updated)?;
        *entry = updated;
        info!(booking = %id, "booking confirmed");
        Ok(entry.clone())
    }

    /// Active → Completed; the slot follows the latest sensor reading
    pub fn complete(&self, id: BookingId, now: DateTime<Utc>) -> Result<Booking> {
        self.finish(id, now, Release::Complete)
    }

    /// Pending/Active → Cancelled; the slot is Free on return
    pub fn cancel(&self, id: BookingId, now: DateTime<Utc>) -> Result<Booking> {
        self.finish(id, now, Release::Cancel)
    }

    fn finish(&self, id: BookingId, now: DateTime<Utc>, mode: Release) -> Result<Booking> {
        let (action, target) = match mode {
            Release::Complete => ("complete", BookingStatus::Completed),
            Release::Cancel => ("cancel", BookingStatus::Cancelled),
        };
        let mut entry = self
            .bookings
            .get_mut(&id)
            .ok_or_else(|| ParkError::not_found("booking", id))?;
        let allowed = match mode {
            Release::Complete => entry.status == BookingStatus::Active,
            Release::Cancel => entry.status.is_open(),
        };
        if !allowed {
            return Err(ParkError::InvalidTransition {
                booking: id,
                status: entry.status,
                action,
            });
        }

        // The closed booking is persisted before the hold is dropped; a hold
        // left behind by a crash is released on the next open.
        let mut updated = entry.clone();
        updated.status = target;
        updated.ended_at = Some(now);
        self.repo.save_booking(&updated)?;
        let slot = match self.coordinator.release(&entry.slot_id, id, mode) {
            Ok(slot) => slot,
            Err(err) => {
                if let Err(restore_err) = self.repo.save_booking(&*entry) {
                    error!(booking = %id, error = %restore_err, "failed to restore open booking");
                }
                return Err(err);
            }
        };
        *entry = updated;

        info!(
            booking = %id,
            slot = %slot.id,
            slot_status = %slot.status,
            status = %target,
            "booking closed"
        );
        Ok(entry.clone())
    }

    /// Bookings of a user, newest first, optionally filtered by status
    pub fn list_for_user(
        &self,
        user_id: UserId,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>> {
        self.user(user_id)?;
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.user_id == user_id)
            .filter(|b| status.map_or(true, |s| b.status == s))
            .map(|b| b.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    /// Counts by status
    pub fn stats(&self) -> BookingStats {
        let mut stats = BookingStats {
            conflicts: self.conflicts.load(Ordering::Relaxed),
            ..Default::default()
        };
        for booking in self.bookings.iter() {
            stats.total += 1;
            match booking.status {
                BookingStatus::Pending => stats.pending += 1,
                BookingStatus::Active => stats.active += 1,
                BookingStatus::Completed => {
                    stats.completed += 1;
                    stats.revenue += booking.locked_price();
                }
                BookingStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.revenue = (stats.revenue * 100.0).round() / 100.0;
        stats
    }
}
