// Parkline - Parking occupancy, pricing and booking core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Pricing engine
//!
//! Rates are recomputed per lot on an independent cadence, never per sensor
//! event:
//!
//! ```text
//! rate       = base_rate × (1 + occupancy_factor × occupancy_ratio) × tod_multiplier
//! final_rate = min(rate, hourly_ceiling)          (rounded to cents)
//! ```
//!
//! Each recompute produces a new immutable [`PricingSnapshot`] that replaces
//! the previous one. Bookings copy the snapshot they were quoted against, so
//! replacing it never affects an existing booking.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::coordinator::LotOccupancy;
use crate::error::{ParkError, Result};
use crate::model::{LotId, PricingSnapshot, TimeBand};
use crate::store::{Repository, StoreImage};

/// Pricing configuration
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Base hourly rate
    pub base_rate: f64,
    /// Weight of the occupancy ratio in the rate
    pub occupancy_factor: f64,
    /// Multiplier inside a peak window
    pub peak_multiplier: f64,
    /// Multiplier outside peak windows
    pub off_peak_multiplier: f64,
    /// Peak windows as `[start, end)` local hours
    pub peak_hours: Vec<(u32, u32)>,
    /// Maximum total charge per booking
    pub daily_cap: f64,
    /// Maximum hourly rate; `None` means the daily cap
    pub hourly_ceiling: Option<f64>,
    /// Offset from UTC used to evaluate the peak schedule
    pub utc_offset_secs: i32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_rate: 5.0,
            occupancy_factor: 0.5,
            peak_multiplier: 1.5,
            off_peak_multiplier: 0.75,
            peak_hours: vec![(7, 10), (16, 19)],
            daily_cap: 25.0,
            hourly_ceiling: None,
            utc_offset_secs: 0,
        }
    }
}

impl PricingConfig {
    /// Configuration with a custom base rate
    pub fn with_base_rate(base_rate: f64) -> Self {
        Self {
            base_rate,
            ..Default::default()
        }
    }

    /// Configuration with a custom daily cap
    pub fn with_daily_cap(daily_cap: f64) -> Self {
        Self {
            daily_cap,
            ..Default::default()
        }
    }

    /// Effective hourly ceiling
    pub fn ceiling(&self) -> f64 {
        self.hourly_ceiling.unwrap_or(self.daily_cap)
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("base_rate", self.base_rate),
            ("peak_multiplier", self.peak_multiplier),
            ("off_peak_multiplier", self.off_peak_multiplier),
            ("daily_cap", self.daily_cap),
            ("hourly_ceiling", self.ceiling()),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ParkError::Validation(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.occupancy_factor.is_finite() && self.occupancy_factor >= 0.0) {
            return Err(ParkError::Validation(format!(
                "occupancy_factor must be non-negative, got {}",
                self.occupancy_factor
            )));
        }
        for &(start, end) in &self.peak_hours {
            if start >= end || end > 24 {
                return Err(ParkError::Validation(format!(
                    "invalid peak window [{}, {})",
                    start, end
                )));
            }
        }
        if FixedOffset::east_opt(self.utc_offset_secs).is_none() {
            return Err(ParkError::Validation(format!(
                "utc offset out of range: {}s",
                self.utc_offset_secs
            )));
        }
        Ok(())
    }

    /// Band in effect at `now`
    pub fn band_at(&self, now: DateTime<Utc>) -> TimeBand {
        let hour = match FixedOffset::east_opt(self.utc_offset_secs) {
            Some(offset) => now.with_timezone(&offset).hour(),
            None => now.hour(),
        };
        if self
            .peak_hours
            .iter()
            .any(|&(start, end)| start <= hour && hour < end)
        {
            TimeBand::Peak
        } else {
            TimeBand::OffPeak
        }
    }

    fn multiplier(&self, band: TimeBand) -> f64 {
        match band {
            TimeBand::Peak => self.peak_multiplier,
            TimeBand::OffPeak => self.off_peak_multiplier,
        }
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Holds the current snapshot per lot
pub struct PricingEngine {
    config: PricingConfig,
    repo: Arc<dyn Repository>,
    current: RwLock<HashMap<LotId, Arc<PricingSnapshot>>>,
    next_id: Mutex<u64>,
}

impl std::fmt::Debug for PricingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingEngine")
            .field("config", &self.config)
            .field("lots", &self.current.read().len())
            .finish()
    }
}

impl PricingEngine {
    /// Create the engine, restoring persisted snapshots
    pub fn new(
        config: PricingConfig,
        repo: Arc<dyn Repository>,
        image: &StoreImage,
    ) -> Result<Self> {
        config.validate()?;
        let current: HashMap<LotId, Arc<PricingSnapshot>> = image
            .snapshots
            .values()
            .map(|s| (s.lot_id, Arc::new(s.clone())))
            .collect();
        let next_id = current.values().map(|s| s.id).max().unwrap_or(0) + 1;
        Ok(Self {
            config,
            repo,
            current: RwLock::new(current),
            next_id: Mutex::new(next_id),
        })
    }

    /// Get the pricing configuration
    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Compute a snapshot without installing it
    pub fn compute(
        &self,
        id: u64,
        lot_id: LotId,
        occupancy: &LotOccupancy,
        now: DateTime<Utc>,
    ) -> PricingSnapshot {
        let ratio = occupancy.ratio();
        let band = self.config.band_at(now);
        let multiplier = self.config.multiplier(band);
        let computed_rate =
            self.config.base_rate * (1.0 + self.config.occupancy_factor * ratio) * multiplier;
        let final_rate = round_cents(computed_rate.min(self.config.ceiling()));

        PricingSnapshot {
            id,
            lot_id,
            base_rate: self.config.base_rate,
            occupancy_ratio: ratio,
            occupancy_factor: self.config.occupancy_factor,
            band,
            time_of_day_multiplier: multiplier,
            daily_cap: self.config.daily_cap,
            computed_rate,
            final_rate,
            valid_from: now,
        }
    }

    /// Compute, persist and install a new snapshot for a lot
    ///
    /// Reads only the aggregate counts passed in; no slot is locked.
    pub fn recompute(
        &self,
        lot_id: LotId,
        occupancy: &LotOccupancy,
        now: DateTime<Utc>,
    ) -> Result<Arc<PricingSnapshot>> {
        let mut next_id = self.next_id.lock();
        let snapshot = Arc::new(self.compute(*next_id, lot_id, occupancy, now));
        self.repo.save_snapshot(&snapshot)?;
        *next_id += 1;
        self.current.write().insert(lot_id, Arc::clone(&snapshot));

        info!(
            lot = %lot_id,
            snapshot = snapshot.id,
            occupancy = snapshot.occupancy_ratio,
            peak = snapshot.is_peak(),
            rate = snapshot.final_rate,
            "price recomputed"
        );
        Ok(snapshot)
    }

    /// Latest snapshot for a lot
    pub fn current_snapshot(&self, lot_id: LotId) -> Result<Arc<PricingSnapshot>> {
        self.current
            .read()
            .get(&lot_id)
            .cloned()
            .ok_or_else(|| ParkError::not_found("pricing snapshot", lot_id))
    }

    /// Latest snapshot of every lot, in lot order
    pub fn snapshots(&self) -> Vec<Arc<PricingSnapshot>> {
        let mut all: Vec<_> = self.current.read().values().cloned().collect();
        all.sort_by_key(|s| s.lot_id);
        all
    }
}
