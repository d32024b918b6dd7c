// Parkline Server - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for Parkline.
//!
//! Booking outcomes are counted as requests are served. Occupancy, pricing,
//! sync and gateway figures are gauges refreshed from the core's own
//! counters on every scrape and after each pricing pass.

use lazy_static::lazy_static;
use parkline::{CoordinatorStats, LotId, LotSummary, PricingSnapshot};
use parkline_gateway::GatewayStats;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge, GaugeVec,
    TextEncoder,
};
use tracing::warn;

lazy_static! {
    // ============================================================
    // Bookings
    // ============================================================

    /// Booking requests by outcome.
    pub static ref BOOKINGS_TOTAL: CounterVec = register_counter_vec!(
        "parkline_bookings_total",
        "Booking operations by outcome",
        &["outcome"]
    ).unwrap();

    // ============================================================
    // Lots (labeled by lot id)
    // ============================================================

    /// Occupancy ratio used by the pricing engine (0-1).
    pub static ref LOT_OCCUPANCY_RATIO: GaugeVec = register_gauge_vec!(
        "parkline_lot_occupancy_ratio",
        "Occupied and reserved share of in-service slots (0-1)",
        &["lot"]
    ).unwrap();

    /// Free slots per lot.
    pub static ref LOT_FREE_SLOTS: GaugeVec = register_gauge_vec!(
        "parkline_lot_free_slots",
        "Slots currently free",
        &["lot"]
    ).unwrap();

    /// Current hourly rate per lot.
    pub static ref LOT_RATE: GaugeVec = register_gauge_vec!(
        "parkline_lot_rate_per_hour",
        "Hourly rate of the lot's current pricing snapshot",
        &["lot"]
    ).unwrap();

    /// Whether the lot's current snapshot is in a peak window.
    pub static ref LOT_PEAK: GaugeVec = register_gauge_vec!(
        "parkline_lot_peak",
        "Current pricing snapshot computed in a peak window (1=peak, 0=off-peak)",
        &["lot"]
    ).unwrap();

    // ============================================================
    // Sync (coordinator side)
    // ============================================================

    /// Batches merged.
    pub static ref SYNC_BATCHES_APPLIED: Gauge = register_gauge!(
        "parkline_sync_batches_applied",
        "Sync batches merged by the coordinator"
    ).unwrap();

    /// Batches acknowledged again without merging.
    pub static ref SYNC_BATCHES_DUPLICATE: Gauge = register_gauge!(
        "parkline_sync_batches_duplicate",
        "Sync batches recognized as already applied"
    ).unwrap();

    /// Events absorbed as stale or repeated.
    pub static ref SYNC_STALE_EVENTS: Gauge = register_gauge!(
        "parkline_sync_stale_events",
        "Sensor events with a sequence not newer than the slot's"
    ).unwrap();

    /// Gap markers received from gateways.
    pub static ref SYNC_GAP_MARKERS: Gauge = register_gauge!(
        "parkline_sync_gap_markers",
        "Gap markers reporting events dropped by a full gateway buffer"
    ).unwrap();

    // ============================================================
    // Gateways (labeled by gateway id)
    // ============================================================

    /// Events waiting in the gateway, including the in-flight batch.
    pub static ref GATEWAY_BUFFERED: GaugeVec = register_gauge_vec!(
        "parkline_gateway_buffered_events",
        "Events buffered or in flight at the gateway",
        &["gateway"]
    ).unwrap();

    /// Failed delivery attempts.
    pub static ref GATEWAY_FAILURES: GaugeVec = register_gauge_vec!(
        "parkline_gateway_sync_failures",
        "Failed batch deliveries",
        &["gateway"]
    ).unwrap();

    /// Events dropped by the overflow policy.
    pub static ref GATEWAY_EVICTED: GaugeVec = register_gauge_vec!(
        "parkline_gateway_evicted_events",
        "Events evicted from a full gateway buffer",
        &["gateway"]
    ).unwrap();
}

/// Booking outcome label values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingOutcome {
    Created,
    Conflict,
    Rejected,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingOutcome::Created => "created",
            BookingOutcome::Conflict => "conflict",
            BookingOutcome::Rejected => "rejected",
            BookingOutcome::Confirmed => "confirmed",
            BookingOutcome::Completed => "completed",
            BookingOutcome::Cancelled => "cancelled",
        }
    }
}

/// Increment the booking counter.
pub fn record_booking(outcome: BookingOutcome) {
    BOOKINGS_TOTAL.with_label_values(&[outcome.as_str()]).inc();
}

/// Update occupancy gauges of one lot.
pub fn update_lot(summary: &LotSummary) {
    let lot = lot_label(summary.lot.id);
    LOT_OCCUPANCY_RATIO
        .with_label_values(&[&lot])
        .set(summary.occupancy.ratio());
    LOT_FREE_SLOTS
        .with_label_values(&[&lot])
        .set(summary.occupancy.free as f64);
}

/// Update pricing gauges from a snapshot.
pub fn update_pricing(snapshot: &PricingSnapshot) {
    let lot = lot_label(snapshot.lot_id);
    LOT_RATE.with_label_values(&[&lot]).set(snapshot.final_rate);
    LOT_PEAK
        .with_label_values(&[&lot])
        .set(if snapshot.is_peak() { 1.0 } else { 0.0 });
}

/// Update sync gauges from coordinator counters.
pub fn update_sync(stats: &CoordinatorStats) {
    SYNC_BATCHES_APPLIED.set(stats.batches_applied as f64);
    SYNC_BATCHES_DUPLICATE.set(stats.duplicate_batches as f64);
    SYNC_STALE_EVENTS.set(stats.stale_events as f64);
    SYNC_GAP_MARKERS.set(stats.gap_markers as f64);
}

/// Update gauges of one gateway.
pub fn update_gateway(stats: &GatewayStats) {
    let gateway = stats.gateway_id.as_str();
    GATEWAY_BUFFERED
        .with_label_values(&[gateway])
        .set((stats.buffered + stats.in_flight) as f64);
    GATEWAY_FAILURES
        .with_label_values(&[gateway])
        .set(stats.failures as f64);
    GATEWAY_EVICTED
        .with_label_values(&[gateway])
        .set(stats.evicted as f64);
}

fn lot_label(lot: LotId) -> String {
    lot.to_string()
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
