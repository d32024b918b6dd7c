// Parkline - Parking occupancy, pricing and booking core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Persistence abstraction
//!
//! The core never talks to a database directly. It reads a [`StoreImage`] once
//! at startup and pushes every durable change through a [`Repository`].
//! Two implementations ship with the crate:
//!
//! - [`MemoryRepository`]: process-local, for tests and ephemeral runs
//! - [`JsonFileRepository`]: a single JSON document rewritten atomically

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    BatchId, Booking, BookingId, GatewayId, Lot, LotId, PricingSnapshot, Slot, SlotId, User,
    UserId,
};

/// Batch ids kept per gateway in a persisted image
pub const PERSISTED_BATCH_IDS: usize = 1024;

/// Everything that must survive a coordinator restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreImage {
    #[serde(default)]
    pub lots: BTreeMap<LotId, Lot>,
    #[serde(default)]
    pub slots: BTreeMap<SlotId, Slot>,
    #[serde(default)]
    pub users: BTreeMap<UserId, User>,
    #[serde(default)]
    pub bookings: BTreeMap<BookingId, Booking>,
    /// Latest snapshot per lot
    #[serde(default)]
    pub snapshots: BTreeMap<LotId, PricingSnapshot>,
    /// Recently applied batch ids, oldest first
    #[serde(default)]
    pub applied_batches: BTreeMap<GatewayId, VecDeque<BatchId>>,
}

impl StoreImage {
    /// Whether no lot has been provisioned yet
    pub fn is_unprovisioned(&self) -> bool {
        self.lots.is_empty()
    }

    /// Insert slots, never replacing a newer revision with an older one
    fn upsert_slots(&mut self, slots: &[Slot]) {
        for slot in slots {
            match self.slots.get(&slot.id) {
                Some(existing) if existing.revision > slot.revision => {}
                _ => {
                    self.slots.insert(slot.id.clone(), slot.clone());
                }
            }
        }
    }

    fn record_batch(&mut self, gateway: &GatewayId, batch: &BatchId) {
        let ids = self.applied_batches.entry(gateway.clone()).or_default();
        if ids.contains(batch) {
            return;
        }
        ids.push_back(batch.clone());
        while ids.len() > PERSISTED_BATCH_IDS {
            ids.pop_front();
        }
    }
}

/// Durable record store used by the core
pub trait Repository: Send + Sync {
    /// Read the full persisted image
    fn load(&self) -> Result<StoreImage>;

    /// Persist a provisioned lot
    fn save_lot(&self, lot: &Lot) -> Result<()>;

    /// Persist a provisioned user
    fn save_user(&self, user: &User) -> Result<()>;

    /// Persist slot states
    fn save_slots(&self, slots: &[Slot]) -> Result<()>;

    /// Persist a booking (insert or replace)
    fn save_booking(&self, booking: &Booking) -> Result<()>;

    /// Persist the latest snapshot for its lot
    fn save_snapshot(&self, snapshot: &PricingSnapshot) -> Result<()>;

    /// Remember that a batch was fully applied
    fn record_batch(&self, gateway: &GatewayId, batch: &BatchId) -> Result<()>;
}

/// In-memory repository
#[derive(Debug, Default)]
pub struct MemoryRepository {
    image: Mutex<StoreImage>,
}

impl MemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository pre-loaded with an image
    pub fn with_image(image: StoreImage) -> Self {
        Self {
            image: Mutex::new(image),
        }
    }

    /// Copy of the current image
    pub fn image(&self) -> StoreImage {
        self.image.lock().clone()
    }
}

impl Repository for MemoryRepository {
    fn load(&self) -> Result<StoreImage> {
        Ok(self.image.lock().clone())
    }

    fn save_lot(&self, lot: &Lot) -> Result<()> {
        self.image.lock().lots.insert(lot.id, lot.clone());
        Ok(())
    }

    fn save_user(&self, user: &User) -> Result<()> {
        self.image.lock().users.insert(user.id, user.clone());
        Ok(())
    }

    fn save_slots(&self, slots: &[Slot]) -> Result<()> {
        self.image.lock().upsert_slots(slots);
        Ok(())
    }

    fn save_booking(&self, booking: &Booking) -> Result<()> {
        self.image
            .lock()
            .bookings
            .insert(booking.id, booking.clone());
        Ok(())
    }

    fn save_snapshot(&self, snapshot: &PricingSnapshot) -> Result<()> {
        self.image
            .lock()
            .snapshots
            .insert(snapshot.lot_id, snapshot.clone());
        Ok(())
    }

    fn record_batch(&self, gateway: &GatewayId, batch: &BatchId) -> Result<()> {
        self.image.lock().record_batch(gateway, batch);
        Ok(())
    }
}

/// Repository backed by one JSON document on disk
///
/// The whole image is rewritten on every save through a temporary file and a
/// rename, so a crash leaves either the old or the new document.
#[derive(Debug)]
pub struct JsonFileRepository {
    path: PathBuf,
    image: Mutex<StoreImage>,
}

impl JsonFileRepository {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let image = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            StoreImage::default()
        };
        tracing::debug!(path = %path.display(), lots = image.lots.len(), "opened json store");
        Ok(Self {
            path,
            image: Mutex::new(image),
        })
    }

    /// Location of the document
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, f: impl FnOnce(&mut StoreImage)) -> Result<()> {
        let mut image = self.image.lock();
        f(&mut image);
        self.write(&image)
    }

    fn write(&self, image: &StoreImage) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(image)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Repository for JsonFileRepository {
    fn load(&self) -> Result<StoreImage> {
        Ok(self.image.lock().clone())
    }

    fn save_lot(&self, lot: &Lot) -> Result<()> {
        self.mutate(|image| {
            image.lots.insert(lot.id, lot.clone());
        })
    }

    fn save_user(&self, user: &User) -> Result<()> {
        self.mutate(|image| {
            image.users.insert(user.id, user.clone());
        })
    }

    fn save_slots(&self, slots: &[Slot]) -> Result<()> {
        if slots.is_empty() {
            return Ok(());
        }
        self.mutate(|image| image.upsert_slots(slots))
    }

    fn save_booking(&self, booking: &Booking) -> Result<()> {
        self.mutate(|image| {
            image.bookings.insert(booking.id, booking.clone());
        })
    }

    fn save_snapshot(&self, snapshot: &PricingSnapshot) -> Result<()> {
        self.mutate(|image| {
            image.snapshots.insert(snapshot.lot_id, snapshot.clone());
        })
    }

    fn record_batch(&self, gateway: &GatewayId, batch: &BatchId) -> Result<()> {
        self.mutate(|image| image.record_batch(gateway, batch))
    }
}
