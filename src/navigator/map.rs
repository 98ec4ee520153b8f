//! The navigator map — every hub the fabric knows about, and the home hub.
//!
//! Structural changes take the exclusive lock; queries take shared access
//! and evaluate matchers against cloned pin snapshots, so a long filter
//! never blocks state updates and never observes a half-applied one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::hub::HubId;
use crate::intel::HubIntel;
use crate::netenv::Location;
use crate::ops::{GossipSource, HubAnnouncement};
use crate::terminal::Terminal;

use super::options::{HubType, Options};
use super::pin::{Pin, PinState};

/// Identifier of the built-in default routing profile.
pub const DEFAULT_ROUTING_PROFILE: &str = "default";

/// Map-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// No pins are loaded; the caller must bootstrap first.
    #[error("map is empty, bootstrap required")]
    EmptyMap,
    #[error("hub {0} is not in the map")]
    UnknownHub(String),
    #[error("no route to destination")]
    NoRoute,
}

/// The current home hub and the terminal that reaches it.
#[derive(Clone)]
pub struct HomeRef {
    pub hub_id: HubId,
    pub terminal: Arc<Terminal>,
}

#[derive(Default)]
struct MapInner {
    pins: HashMap<HubId, Pin>,
    home: Option<HomeRef>,
    intel: Option<Arc<HubIntel>>,
}

/// See the module docs.
#[derive(Default)]
pub struct Map {
    inner: RwLock<MapInner>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default options for operations on this map.
    pub fn default_options(&self) -> Options {
        Options {
            routing_profile: DEFAULT_ROUTING_PROFILE.to_string(),
            ..Options::default()
        }
    }

    pub fn set_intel(&self, intel: Arc<HubIntel>) {
        self.inner.write().expect("map lock poisoned").intel = Some(intel);
    }

    /// Insert or replace a pin.
    pub fn add_pin(&self, pin: Pin) {
        let mut inner = self.inner.write().expect("map lock poisoned");
        debug!(hub = %pin.hub.id, state = ?pin.state, "map: pin added");
        inner.pins.insert(pin.hub.id.clone(), pin);
    }

    /// Add and remove state bits on a pin. All readers see either the old
    /// or the new state, never a mix.
    pub fn update_pin_state(&self, hub_id: &HubId, add: PinState, remove: PinState) -> bool {
        let mut inner = self.inner.write().expect("map lock poisoned");
        match inner.pins.get_mut(hub_id) {
            Some(pin) => {
                pin.state.remove(remove);
                pin.state.insert(add);
                true
            }
            None => false,
        }
    }

    pub fn remove_pin(&self, hub_id: &HubId) -> bool {
        let mut inner = self.inner.write().expect("map lock poisoned");
        inner.pins.remove(hub_id).is_some()
    }

    /// Snapshot of a single pin.
    pub fn pin(&self, hub_id: &HubId) -> Option<Pin> {
        self.inner
            .read()
            .expect("map lock poisoned")
            .pins
            .get(hub_id)
            .cloned()
    }

    pub fn pin_count(&self) -> usize {
        self.inner.read().expect("map lock poisoned").pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pin_count() == 0
    }

    pub(super) fn snapshot(&self) -> (Vec<Pin>, Option<Arc<HubIntel>>, Option<HomeRef>) {
        let inner = self.inner.read().expect("map lock poisoned");
        (
            inner.pins.values().cloned().collect(),
            inner.intel.clone(),
            inner.home.clone(),
        )
    }

    /// Up to `max` matching pins, nearest first. Distance is the shortest
    /// great-circle distance between the given locations and the pin's; ties
    /// break on the stable hub id. Pins without comparable locations sort
    /// last, still in id order.
    pub fn find_nearest_hubs(
        &self,
        v4: Option<&Location>,
        v6: Option<&Location>,
        opts: &Options,
        hub_type: HubType,
        max: usize,
    ) -> Result<Vec<Pin>, MapError> {
        let (pins, intel, _) = self.snapshot();
        if pins.is_empty() {
            return Err(MapError::EmptyMap);
        }

        let matcher = opts.matcher(hub_type, intel.as_deref());
        let mut candidates: Vec<(f64, Pin)> = pins
            .into_iter()
            .filter(|pin| matcher(pin))
            .map(|pin| (pin.proximity_to(v4, v6), pin))
            .collect();

        candidates.sort_by(|(da, a), (db, b)| {
            da.partial_cmp(db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.hub.id.cmp(&b.hub.id))
        });
        candidates.truncate(max);

        Ok(candidates.into_iter().map(|(_, pin)| pin).collect())
    }

    /// Set the current home hub. Only call with a Live terminal. False when
    /// the hub is not in the map.
    pub fn set_home(&self, hub_id: &HubId, terminal: Arc<Terminal>) -> bool {
        if !terminal.is_live() {
            warn!(hub = %hub_id, "map: refusing non-live terminal as home");
            return false;
        }
        let mut inner = self.inner.write().expect("map lock poisoned");
        if !inner.pins.contains_key(hub_id) {
            return false;
        }
        info!(hub = %hub_id, "map: home hub set");
        inner.home = Some(HomeRef {
            hub_id: hub_id.clone(),
            terminal,
        });
        true
    }

    pub fn home(&self) -> Option<HomeRef> {
        self.inner.read().expect("map lock poisoned").home.clone()
    }

    pub fn clear_home(&self) {
        self.inner.write().expect("map lock poisoned").home = None;
    }

    /// Merge gossip announcements: unknown hubs become pins, known pins
    /// keep their local state (gossip never downgrades what we observed
    /// ourselves). Returns how many pins were added.
    pub fn absorb_announcements(&self, announcements: &[HubAnnouncement]) -> usize {
        let mut inner = self.inner.write().expect("map lock poisoned");
        let mut added = 0;
        for ann in announcements {
            let hub_id = HubId::new(ann.id.clone());
            if inner.pins.contains_key(&hub_id) {
                continue;
            }
            let mut hub = crate::hub::Hub::new(ann.id.clone());
            if !ann.name.is_empty() {
                hub.name = ann.name.clone();
            }
            let mut pin = Pin::new(hub);
            pin.state = ann.pin_state();
            pin.verified_owner = ann.verified_owner.clone();
            if let (Some(lat), Some(lon)) = (ann.latitude_v4, ann.longitude_v4) {
                pin.location_v4 = Some(Location::new(lat, lon));
            }
            if let (Some(lat), Some(lon)) = (ann.latitude_v6, ann.longitude_v6) {
                pin.location_v6 = Some(Location::new(lat, lon));
            }
            inner.pins.insert(hub_id, pin);
            added += 1;
        }
        if added > 0 {
            info!(added, "map: absorbed gossip announcements");
        }
        added
    }
}

/// A map can answer gossip queries directly: it announces every pin it
/// holds together with the states it believes.
impl GossipSource for Map {
    fn announced_hubs(&self) -> Vec<HubAnnouncement> {
        let (pins, _, _) = self.snapshot();
        pins.into_iter()
            .map(|pin| HubAnnouncement {
                id: pin.hub.id.0.clone(),
                name: pin.hub.name.clone(),
                latitude_v4: pin.location_v4.map(|l| l.latitude),
                longitude_v4: pin.location_v4.map(|l| l.longitude),
                latitude_v6: pin.location_v6.map(|l| l.latitude),
                longitude_v6: pin.location_v6.map(|l| l.longitude),
                states: pin.state.bits(),
                verified_owner: pin.verified_owner,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;

    fn pin_at(id: &str, lat: f64, lon: f64) -> Pin {
        let mut pin = Pin::new(Hub::new(id));
        pin.state = PinState::SUMMARY_REGARD;
        pin.location_v4 = Some(Location::new(lat, lon));
        pin
    }

    #[test]
    fn empty_map_error() {
        let map = Map::new();
        let err = map
            .find_nearest_hubs(None, None, &map.default_options(), HubType::Transit, 5)
            .unwrap_err();
        assert_eq!(err, MapError::EmptyMap);
    }

    #[test]
    fn nearest_ordering_and_truncation() {
        let map = Map::new();
        map.add_pin(pin_at("berlin", 52.52, 13.405));
        map.add_pin(pin_at("paris", 48.8566, 2.3522));
        map.add_pin(pin_at("tokyo", 35.68, 139.69));

        let amsterdam = Location::new(52.37, 4.89);
        let found = map
            .find_nearest_hubs(
                Some(&amsterdam),
                None,
                &map.default_options(),
                HubType::Transit,
                2,
            )
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|p| p.hub.id.as_str()).collect();
        // Paris and Berlin are both near; Tokyo is cut off.
        assert_eq!(found.len(), 2);
        assert!(!ids.contains(&"tokyo"));
    }

    #[test]
    fn ties_break_on_hub_id() {
        let map = Map::new();
        // Identical coordinates: ordering must be by id.
        map.add_pin(pin_at("zeta", 50.0, 8.0));
        map.add_pin(pin_at("alpha", 50.0, 8.0));

        let here = Location::new(50.0, 8.0);
        let found = map
            .find_nearest_hubs(
                Some(&here),
                None,
                &map.default_options(),
                HubType::Transit,
                10,
            )
            .unwrap();
        assert_eq!(found[0].hub.id.as_str(), "alpha");
        assert_eq!(found[1].hub.id.as_str(), "zeta");
    }

    #[test]
    fn pins_without_location_sort_last() {
        let map = Map::new();
        map.add_pin(pin_at("near", 50.0, 8.0));
        let mut bare = Pin::new(Hub::new("nowhere"));
        bare.state = PinState::SUMMARY_REGARD;
        map.add_pin(bare);

        let here = Location::new(50.0, 8.0);
        let found = map
            .find_nearest_hubs(
                Some(&here),
                None,
                &map.default_options(),
                HubType::Transit,
                10,
            )
            .unwrap();
        assert_eq!(found[0].hub.id.as_str(), "near");
        assert_eq!(found[1].hub.id.as_str(), "nowhere");
    }

    #[test]
    fn filtered_map_returns_empty_not_error() {
        let map = Map::new();
        let mut pin = pin_at("offline", 50.0, 8.0);
        pin.state = PinState::OFFLINE;
        map.add_pin(pin);

        let found = map
            .find_nearest_hubs(None, None, &map.default_options(), HubType::Transit, 5)
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn update_pin_state_is_monotonic_through_the_lock() {
        let map = Map::new();
        map.add_pin(pin_at("h", 0.0, 0.0));
        let id = HubId::from("h");

        assert!(map.update_pin_state(&id, PinState::TRUSTED, PinState::ACTIVE));
        let pin = map.pin(&id).unwrap();
        assert!(pin.state.contains(PinState::TRUSTED));
        assert!(!pin.state.contains(PinState::ACTIVE));
        assert!(pin.state.contains(PinState::REACHABLE));

        assert!(!map.update_pin_state(&HubId::from("missing"), PinState::TRUSTED, PinState::empty()));
    }

    #[test]
    fn absorb_announcements_adds_only_unknown_hubs() {
        let map = Map::new();
        map.add_pin(pin_at("known", 1.0, 1.0));

        let anns = vec![
            HubAnnouncement {
                id: "known".into(),
                name: "Known".into(),
                latitude_v4: None,
                longitude_v4: None,
                latitude_v6: None,
                longitude_v6: None,
                states: 0,
                verified_owner: None,
            },
            HubAnnouncement {
                id: "fresh".into(),
                name: "Fresh".into(),
                latitude_v4: Some(2.0),
                longitude_v4: Some(3.0),
                latitude_v6: None,
                longitude_v6: None,
                states: PinState::SUMMARY_REGARD.bits(),
                verified_owner: Some("Acme".into()),
            },
        ];
        assert_eq!(map.absorb_announcements(&anns), 1);
        assert_eq!(map.pin_count(), 2);

        let fresh = map.pin(&HubId::from("fresh")).unwrap();
        assert!(fresh.state.contains(PinState::REACHABLE));
        assert_eq!(fresh.verified_owner.as_deref(), Some("Acme"));
        // The known pin kept its local state.
        let known = map.pin(&HubId::from("known")).unwrap();
        assert!(known.state.contains(PinState::ACTIVE));
    }

    #[test]
    fn gossip_source_announces_every_pin() {
        let map = Map::new();
        map.add_pin(pin_at("a", 1.0, 2.0));
        map.add_pin(pin_at("b", 3.0, 4.0));

        let mut anns = map.announced_hubs();
        anns.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(anns.len(), 2);
        assert_eq!(anns[0].id, "a");
        assert_eq!(anns[0].latitude_v4, Some(1.0));
        assert_eq!(anns[0].pin_state(), PinState::SUMMARY_REGARD);
    }
}
