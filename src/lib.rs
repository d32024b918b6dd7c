// Parkline - Parking occupancy, pricing and booking core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Parkline - Parking occupancy, pricing and booking core
//!
//! Tracks live occupancy of parking slots reported by edge gateways, prices
//! each lot from its occupancy and the time of day, and books slots against a
//! price that is locked at creation.
//!
//! ## Key Features
//!
//! - **Idempotent merge**: per-slot sequence numbers make batch delivery order
//!   and duplication irrelevant
//! - **Batch deduplication**: a batch whose acknowledgment was lost is
//!   acknowledged again, never re-merged
//! - **Exclusive claims**: one lock per slot, so exactly one concurrent booking
//!   wins a slot
//! - **Price locks**: bookings carry an immutable copy of the snapshot they
//!   were quoted against, capped at the daily maximum
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use parkline::{
//!     GatewayId, Lot, LotId, MemoryRepository, ParkingService, Repository, ServiceConfig,
//!     SlotId, User, UserId,
//! };
//!
//! let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
//! let lot = Lot {
//!     id: LotId(1),
//!     name: "North".into(),
//!     location: "Campus".into(),
//!     gateway_id: GatewayId::from("gw-1"),
//!     slots: vec![SlotId::from("F1-01")],
//! };
//! let user = User { id: UserId(1), name: "ana".into(), email: "ana@example.com".into(), phone: None };
//! ParkingService::provision(repo.as_ref(), &[lot], &[user]).unwrap();
//!
//! let service = ParkingService::open(repo, ServiceConfig::default()).unwrap();
//! let booking = service.create_booking(UserId(1), "F1-01", 2).unwrap();
//! assert!(booking.locked_price() <= 25.0);
//! assert!(service.create_booking(UserId(1), "F1-01", 1).is_err());
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Identifiers, slots, sensor events, sync batches, bookings
//! - [`coordinator`]: Authoritative slot state and batch merge
//! - [`pricing`]: Occupancy and time-of-day pricing
//! - [`booking`]: Reservation state machine
//! - [`store`]: Repository abstraction and implementations
//! - [`service`]: Facade exposing the API operations

// Modules
pub mod booking;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod pricing;
pub mod service;
pub mod store;

// Re-exports for convenient access
pub use booking::{BookingLedger, BookingRequest, BookingStats, LedgerConfig};
pub use coordinator::{
    merge_event, CloudCoordinator, CoordinatorConfig, CoordinatorStats, LotOccupancy,
    MergeOutcome, Release,
};
pub use error::{ErrorKind, ParkError, Result};
pub use model::{
    BatchAck, BatchEntry, BatchId, Booking, BookingId, BookingStatus, GapMarker, GatewayId, Lot,
    LotId, PriceLock, PricingSnapshot, SensorEvent, Slot, SlotId, SlotStatus, SyncBatch,
    TimeBand, User, UserId,
};
pub use pricing::{PricingConfig, PricingEngine};
pub use service::{LotSummary, ParkingService, ServiceConfig, SystemStats};
pub use store::{JsonFileRepository, MemoryRepository, Repository, StoreImage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
