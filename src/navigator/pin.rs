//! Pins — hubs as the navigator sees them.

use bitflags::bitflags;

use crate::hub::Hub;
use crate::intel::Entity;
use crate::netenv::Location;

bitflags! {
    /// Routing-relevant state of a pin. Updated only through the map, so
    /// matchers always evaluate a consistent snapshot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PinState: u32 {
        const REACHABLE = 1 << 0;
        const ACTIVE = 1 << 1;
        const TRUSTED = 1 << 2;
        const CONNECTIVITY_ISSUES = 1 << 3;
        const USAGE_AS_HOME_DISCOURAGED = 1 << 4;
        const USAGE_AS_DESTINATION_DISCOURAGED = 1 << 5;
        const OFFLINE = 1 << 6;
        const FAILING = 1 << 7;

        /// States a hub should have to be considered at all.
        const SUMMARY_REGARD = Self::REACHABLE.bits() | Self::ACTIVE.bits();
        /// States that disqualify a hub outright.
        const SUMMARY_DISREGARD = Self::OFFLINE.bits() | Self::FAILING.bits();
    }
}

impl PinState {
    /// All required bits present.
    pub fn has(self, required: PinState) -> bool {
        self.contains(required)
    }

    /// At least one of the given bits present.
    pub fn has_any_of(self, states: PinState) -> bool {
        self.intersects(states)
    }
}

/// A hub record in the navigator's map.
#[derive(Debug, Clone)]
pub struct Pin {
    pub hub: Hub,
    /// Network identity derived from the hub's v4 address, if any.
    pub entity_v4: Option<Entity>,
    /// Network identity derived from the hub's v6 address, if any.
    pub entity_v6: Option<Entity>,
    /// Owner identity confirmed out of band; empty means unverified.
    pub verified_owner: Option<String>,
    pub state: PinState,
    pub location_v4: Option<Location>,
    pub location_v6: Option<Location>,
}

impl Pin {
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            entity_v4: None,
            entity_v6: None,
            verified_owner: None,
            state: PinState::empty(),
            location_v4: None,
            location_v6: None,
        }
    }

    /// Shortest distance from this pin to any of the given locations, in
    /// kilometers. Pins without comparable location data sort last.
    pub fn proximity_to(&self, v4: Option<&Location>, v6: Option<&Location>) -> f64 {
        let mut best = f64::INFINITY;
        if let (Some(here), Some(there)) = (v4, self.location_v4.as_ref()) {
            best = best.min(here.distance_km(there));
        }
        if let (Some(here), Some(there)) = (v6, self.location_v6.as_ref()) {
            best = best.min(here.distance_km(there));
        }
        best
    }
}
