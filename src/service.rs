// Parkline - Parking occupancy, pricing and booking core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Service facade
//!
//! [`ParkingService`] wires the coordinator, the pricing engine and the
//! booking ledger over one repository and exposes the request/response
//! operations consumed by the API layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::booking::{BookingLedger, BookingRequest, BookingStats, LedgerConfig};
use crate::coordinator::{CloudCoordinator, CoordinatorConfig, CoordinatorStats, LotOccupancy};
use crate::error::Result;
use crate::model::{
    BatchAck, Booking, BookingId, BookingStatus, Lot, LotId, PricingSnapshot, Slot, SlotId,
    SlotStatus, SyncBatch, User, UserId,
};
use crate::pricing::{PricingConfig, PricingEngine};
use crate::store::Repository;

/// Configuration for every core component
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub coordinator: CoordinatorConfig,
    pub pricing: PricingConfig,
    pub ledger: LedgerConfig,
}

/// A lot together with its live counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotSummary {
    #[serde(flatten)]
    pub lot: Lot,
    #[serde(flatten)]
    pub occupancy: LotOccupancy,
    pub occupancy_percent: f64,
}

/// Aggregate occupancy, booking and sync counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub lots: usize,
    pub total_slots: usize,
    pub free_slots: usize,
    pub occupied_slots: usize,
    pub reserved_slots: usize,
    pub out_of_service_slots: usize,
    pub occupancy_percent: f64,
    pub bookings: BookingStats,
    pub sync: CoordinatorStats,
}

/// Entry point of the parking core
pub struct ParkingService {
    repo: Arc<dyn Repository>,
    coordinator: Arc<CloudCoordinator>,
    pricing: Arc<PricingEngine>,
    ledger: BookingLedger,
}

impl std::fmt::Debug for ParkingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkingService")
            .field("coordinator", &self.coordinator)
            .field("pricing", &self.pricing)
            .field("ledger", &self.ledger)
            .finish()
    }
}

impl ParkingService {
    /// Write lots, their slots and users into an empty store
    ///
    /// Returns `false` without writing anything if the store already holds
    /// lots.
    pub fn provision(repo: &dyn Repository, lots: &[Lot], users: &[User]) -> Result<bool> {
        if !repo.load()?.is_unprovisioned() {
            return Ok(false);
        }
        for lot in lots {
            let slots: Vec<Slot> = lot
                .slots
                .iter()
                .map(|id| Slot::new(id.clone(), lot.id))
                .collect();
            repo.save_slots(&slots)?;
            repo.save_lot(lot)?;
        }
        for user in users {
            repo.save_user(user)?;
        }
        info!(lots = lots.len(), users = users.len(), "store provisioned");
        Ok(true)
    }

    /// Load persisted state and build the core
    ///
    /// Lots without a persisted snapshot get one immediately.
    pub fn open(repo: Arc<dyn Repository>, config: ServiceConfig) -> Result<Self> {
        let image = repo.load()?;
        let coordinator = Arc::new(CloudCoordinator::new(
            config.coordinator,
            Arc::clone(&repo),
            &image,
        )?);
        let pricing = Arc::new(PricingEngine::new(
            config.pricing,
            Arc::clone(&repo),
            &image,
        )?);
        let ledger = BookingLedger::new(
            config.ledger,
            Arc::clone(&repo),
            Arc::clone(&coordinator),
            Arc::clone(&pricing),
            &image,
        )?;

        let service = Self {
            repo,
            coordinator,
            pricing,
            ledger,
        };
        let now = Utc::now();
        for lot in service.coordinator.lots() {
            if service.pricing.current_snapshot(lot.id).is_err() {
                let occupancy = service.coordinator.lot_occupancy(lot.id)?;
                service.pricing.recompute(lot.id, &occupancy, now)?;
            }
        }
        info!(
            lots = image.lots.len(),
            slots = image.slots.len(),
            bookings = image.bookings.len(),
            "parking service opened"
        );
        Ok(service)
    }

    /// Repository backing this service
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Authoritative slot state
    pub fn coordinator(&self) -> &Arc<CloudCoordinator> {
        &self.coordinator
    }

    /// Pricing engine
    pub fn pricing(&self) -> &Arc<PricingEngine> {
        &self.pricing
    }

    /// Booking ledger
    pub fn ledger(&self) -> &BookingLedger {
        &self.ledger
    }

    /// Recompute every lot's price from current counts
    pub fn recompute_prices(&self, now: DateTime<Utc>) -> Result<Vec<PricingSnapshot>> {
        let mut out = Vec::new();
        for lot in self.coordinator.lots() {
            let occupancy = self.coordinator.lot_occupancy(lot.id)?;
            out.push(self.pricing.recompute(lot.id, &occupancy, now)?.as_ref().clone());
        }
        Ok(out)
    }

    // =====================================================================
    // Reads
    // =====================================================================

    /// All lots with live counts, in id order
    pub fn list_lots(&self) -> Result<Vec<LotSummary>> {
        self.coordinator
            .lots()
            .map(|lot| self.summarize(lot))
            .collect()
    }

    /// One lot with live counts
    pub fn get_lot(&self, lot_id: LotId) -> Result<LotSummary> {
        let lot = self.coordinator.lot(lot_id)?;
        self.summarize(lot)
    }

    fn summarize(&self, lot: &Lot) -> Result<LotSummary> {
        let occupancy = self.coordinator.lot_occupancy(lot.id)?;
        Ok(LotSummary {
            lot: lot.clone(),
            occupancy,
            occupancy_percent: occupancy.percent(),
        })
    }

    /// Free slots, optionally restricted to one lot
    pub fn available_slots(&self, lot_id: Option<LotId>) -> Result<Vec<Slot>> {
        self.coordinator.slots_with_status(lot_id, SlotStatus::Free)
    }

    /// Current snapshot of every lot
    pub fn current_pricing(&self) -> Vec<PricingSnapshot> {
        self.pricing
            .snapshots()
            .into_iter()
            .map(|s| s.as_ref().clone())
            .collect()
    }

    /// Aggregate counts
    pub fn system_stats(&self) -> Result<SystemStats> {
        let mut total = LotOccupancy::default();
        let mut lots = 0;
        for lot in self.coordinator.lots() {
            let occ = self.coordinator.lot_occupancy(lot.id)?;
            lots += 1;
            total.total += occ.total;
            total.free += occ.free;
            total.occupied += occ.occupied;
            total.reserved += occ.reserved;
            total.out_of_service += occ.out_of_service;
        }
        Ok(SystemStats {
            lots,
            total_slots: total.total,
            free_slots: total.free,
            occupied_slots: total.occupied,
            reserved_slots: total.reserved,
            out_of_service_slots: total.out_of_service,
            occupancy_percent: total.percent(),
            bookings: self.ledger.stats(),
            sync: self.coordinator.stats(),
        })
    }

    /// Current state of one slot
    pub fn slot_state(&self, slot_id: &SlotId) -> Result<Slot> {
        self.coordinator.current_state(slot_id)
    }

    /// Registered users
    pub fn list_users(&self) -> Vec<User> {
        self.ledger.users()
    }

    // =====================================================================
    // Bookings
    // =====================================================================

    /// Create a booking at the lot's current price
    pub fn create_booking(
        &self,
        user_id: UserId,
        slot_id: impl Into<SlotId>,
        duration_hours: u32,
    ) -> Result<Booking> {
        let request = BookingRequest::new(user_id, slot_id, duration_hours);
        self.ledger.create(&request, Utc::now())
    }

    /// Look up a booking
    pub fn get_booking(&self, id: BookingId) -> Result<Booking> {
        self.ledger.get(id)
    }

    /// Pending → Active
    pub fn confirm_booking(&self, id: BookingId) -> Result<Booking> {
        self.ledger.confirm(id)
    }

    /// Active → Completed
    pub fn complete_booking(&self, id: BookingId) -> Result<Booking> {
        self.ledger.complete(id, Utc::now())
    }

    /// Pending/Active → Cancelled
    pub fn cancel_booking(&self, id: BookingId) -> Result<Booking> {
        self.ledger.cancel(id, Utc::now())
    }

    /// A user's bookings, newest first
    pub fn list_user_bookings(
        &self,
        user_id: UserId,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>> {
        self.ledger.list_for_user(user_id, status)
    }

    // =====================================================================
    // Sync and administration
    // =====================================================================

    /// Merge a gateway batch
    pub fn apply_batch(&self, batch: &SyncBatch) -> Result<BatchAck> {
        self.coordinator.apply_batch(batch)
    }

    /// Toggle a slot's out-of-service state
    pub fn set_out_of_service(&self, slot_id: &SlotId, out_of_service: bool) -> Result<Slot> {
        self.coordinator.set_out_of_service(slot_id, out_of_service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{BatchEntry, BatchId, GatewayId, SensorEvent};
    use crate::store::MemoryRepository;

    fn lots() -> Vec<Lot> {
        vec![
            Lot {
                id: LotId(1),
                name: "North".to_string(),
                location: "Campus".to_string(),
                gateway_id: GatewayId::from("gw-1"),
                slots: vec![SlotId::from("F1-01"), SlotId::from("F1-02")],
            },
            Lot {
                id: LotId(2),
                name: "South".to_string(),
                location: "Station".to_string(),
                gateway_id: GatewayId::from("gw-2"),
                slots: vec![SlotId::from("F2-01")],
            },
        ]
    }

    fn users() -> Vec<User> {
        vec![User {
            id: UserId(1),
            name: "ana".to_string(),
            email: "ana@example.com".to_string(),
            phone: Some("555-0100".to_string()),
        }]
    }

    fn service() -> ParkingService {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        assert!(ParkingService::provision(repo.as_ref(), &lots(), &users()).unwrap());
        ParkingService::open(repo, ServiceConfig::default()).unwrap()
    }

    #[test]
    fn test_provision_only_once() {
        let repo = MemoryRepository::new();
        assert!(ParkingService::provision(&repo, &lots(), &users()).unwrap());
        assert!(!ParkingService::provision(&repo, &lots(), &[]).unwrap());
        assert_eq!(repo.image().slots.len(), 3);
    }

    #[test]
    fn test_open_prices_every_lot() {
        let svc = service();
        let pricing = svc.current_pricing();
        assert_eq!(pricing.len(), 2);
        assert_eq!(pricing[0].lot_id, LotId(1));
    }

    #[test]
    fn test_list_lots_and_available_slots() {
        let svc = service();
        let lots = svc.list_lots().unwrap();
        assert_eq!(lots.len(), 2);
        assert_eq!(lots[0].occupancy.free, 2);

        svc.create_booking(UserId(1), "F1-01", 2).unwrap();
        assert_eq!(svc.available_slots(Some(LotId(1))).unwrap().len(), 1);
        assert_eq!(svc.available_slots(None).unwrap().len(), 2);
        assert_eq!(svc.get_lot(LotId(1)).unwrap().occupancy_percent, 50.0);
        assert_eq!(
            svc.get_lot(LotId(9)).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_system_stats() {
        let svc = service();
        svc.apply_batch(&SyncBatch {
            gateway_id: GatewayId::from("gw-2"),
            batch_id: BatchId::from("b1"),
            entries: vec![BatchEntry::Event(SensorEvent::new(
                "F2-01", true, 1, "gw-2",
            ))],
        })
        .unwrap();
        let b = svc.create_booking(UserId(1), "F1-02", 1).unwrap();
        svc.confirm_booking(b.id).unwrap();

        let stats = svc.system_stats().unwrap();
        assert_eq!(stats.lots, 2);
        assert_eq!(stats.total_slots, 3);
        assert_eq!(stats.occupied_slots, 1);
        assert_eq!(stats.reserved_slots, 1);
        assert_eq!(stats.bookings.active, 1);
        assert_eq!(stats.sync.batches_applied, 1);
    }

    #[test]
    fn test_serialized_lot_summary_is_flat() {
        let svc = service();
        let json = serde_json::to_value(svc.get_lot(LotId(2)).unwrap()).unwrap();
        assert_eq!(json["name"], "South");
        assert_eq!(json["total"], 1);
        assert_eq!(json["free"], 1);
    }
}
