// Parkline Server - HTTP API, edge gateways and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Demo sensor simulator
//!
//! Every interval each slot's sensor flips with a fixed probability and
//! reports the change to its lot's gateway. Sequence numbers continue from
//! the coordinator's last applied value, so a restarted simulator is never
//! treated as stale.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parkline::{GatewayId, LotId, ParkingService, SensorEvent, SlotId};
use parkline_gateway::EdgeGateway;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct SimulatedSensor {
    slot_id: SlotId,
    lot_id: LotId,
    gateway_id: GatewayId,
    occupied: bool,
    sequence: u64,
}

/// Random occupancy source for every provisioned slot
#[derive(Debug)]
pub struct SensorSimulator {
    sensors: Vec<SimulatedSensor>,
    change_probability: f64,
    rng: StdRng,
}

impl SensorSimulator {
    /// Simulate every slot of every lot, resuming from current state
    pub fn new(service: &ParkingService, change_probability: f64, rng: StdRng) -> Self {
        let mut sensors = Vec::new();
        for lot in service.coordinator().lots() {
            for slot_id in &lot.slots {
                let (occupied, sequence) = service
                    .slot_state(slot_id)
                    .map(|s| (s.sensed_occupied, s.last_sequence))
                    .unwrap_or((false, 0));
                sensors.push(SimulatedSensor {
                    slot_id: slot_id.clone(),
                    lot_id: lot.id,
                    gateway_id: lot.gateway_id.clone(),
                    occupied,
                    sequence,
                });
            }
        }
        Self {
            sensors,
            change_probability: change_probability.clamp(0.0, 1.0),
            rng,
        }
    }

    /// Seeded simulator for reproducible runs
    pub fn seeded(service: &ParkingService, change_probability: f64, seed: u64) -> Self {
        Self::new(service, change_probability, StdRng::seed_from_u64(seed))
    }

    /// Number of simulated sensors
    pub fn sensors(&self) -> usize {
        self.sensors.len()
    }

    /// One round of readings; only changed slots produce an event
    pub fn tick(&mut self) -> Vec<(LotId, SensorEvent)> {
        let mut events = Vec::new();
        for sensor in &mut self.sensors {
            if !self.rng.gen_bool(self.change_probability) {
                continue;
            }
            sensor.occupied = !sensor.occupied;
            sensor.sequence += 1;
            events.push((
                sensor.lot_id,
                SensorEvent::new(
                    sensor.slot_id.clone(),
                    sensor.occupied,
                    sensor.sequence,
                    sensor.gateway_id.clone(),
                ),
            ));
        }
        events
    }

    /// Feed the gateways until `shutdown` turns true
    pub async fn run(
        mut self,
        gateways: BTreeMap<LotId, Arc<EdgeGateway>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            sensors = self.sensors(),
            interval_ms = interval.as_millis() as u64,
            probability = self.change_probability,
            "sensor simulator started"
        );
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            for (lot_id, event) in self.tick() {
                let Some(gateway) = gateways.get(&lot_id) else {
                    continue;
                };
                debug!(slot = %event.slot_id, occupied = event.occupied, "sensor change");
                if let Err(e) = gateway.ingest(event) {
                    warn!(lot = %lot_id, error = %e, "gateway refused sensor event");
                }
            }
        }
        info!("sensor simulator stopped");
    }
}
