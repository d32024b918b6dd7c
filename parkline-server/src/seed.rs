// Parkline Server - HTTP API, edge gateways and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! First-run fleet
//!
//! Lots are numbered from 1, each with its own gateway `gw-{lot}` and slots
//! named `F{lot}-{nn}`.

use parkline::{GatewayId, Lot, LotId, SlotId, User, UserId};

const LOT_NAMES: [(&str, &str); 5] = [
    ("North Garage", "Simcoe St N"),
    ("South Deck", "Founders Dr"),
    ("Library Lot", "Conlin Rd E"),
    ("Stadium Lot", "Britannia Ave"),
    ("Downtown Deck", "King St W"),
];

const USERS: [(&str, &str, &str); 5] = [
    ("Avery Lee", "avery.lee@example.com", "555-0101"),
    ("Jordan Patel", "jordan.patel@example.com", "555-0102"),
    ("Sam Moreau", "sam.moreau@example.com", "555-0103"),
    ("Riley Chen", "riley.chen@example.com", "555-0104"),
    ("Casey Novak", "casey.novak@example.com", "555-0105"),
];

/// Lots with their slots
pub fn lots(count: u32, slots_per_lot: u32) -> Vec<Lot> {
    (1..=count)
        .map(|n| {
            let (name, location) = LOT_NAMES[(n as usize - 1) % LOT_NAMES.len()];
            let name = if n as usize > LOT_NAMES.len() {
                format!("{} {}", name, n)
            } else {
                name.to_string()
            };
            Lot {
                id: LotId(n),
                name,
                location: location.to_string(),
                gateway_id: gateway_for(LotId(n)),
                slots: (1..=slots_per_lot)
                    .map(|s| SlotId(format!("F{}-{:02}", n, s)))
                    .collect(),
            }
        })
        .collect()
}

/// Demo users
pub fn users() -> Vec<User> {
    USERS
        .iter()
        .zip(1u64..)
        .map(|(&(name, email, phone), id)| User {
            id: UserId(id),
            name: name.to_string(),
            email: email.to_string(),
            phone: Some(phone.to_string()),
        })
        .collect()
}

/// Gateway responsible for a seeded lot
pub fn gateway_for(lot: LotId) -> GatewayId {
    GatewayId(format!("gw-{}", lot))
}
