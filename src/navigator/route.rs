//! Route construction — from the home hub to a destination.
//!
//! Routes always start at the current home hub. The destination hub is the
//! best destination-matching pin near where the traffic wants to exit; the
//! routing profile decides how much indirection lies in between.

use tracing::debug;

use crate::netenv::Location;

use super::map::{Map, MapError, DEFAULT_ROUTING_PROFILE};
use super::options::{HubType, Options};
use super::pin::Pin;

/// Routing profile that always inserts a transit hop when one exists.
pub const ROUTING_PROFILE_PRIVACY: &str = "privacy";

/// An end-to-end path through the overlay, home hub first.
#[derive(Debug, Clone)]
pub struct Route {
    pub hops: Vec<Pin>,
}

impl Route {
    pub fn destination(&self) -> &Pin {
        self.hops.last().expect("route has at least one hop")
    }
}

impl Map {
    /// Build a route from the home hub towards a destination located at
    /// `dst_v4`/`dst_v6`.
    ///
    /// The default profile goes straight home → destination (one hop when
    /// they coincide). The privacy profile inserts a transit hop whenever a
    /// distinct one is available.
    pub fn find_route(
        &self,
        dst_v4: Option<&Location>,
        dst_v6: Option<&Location>,
        opts: &Options,
    ) -> Result<Route, MapError> {
        if self.is_empty() {
            return Err(MapError::EmptyMap);
        }
        let home = self.home().ok_or(MapError::NoRoute)?;
        let home_pin = self
            .pin(&home.hub_id)
            .ok_or_else(|| MapError::UnknownHub(home.hub_id.to_string()))?;

        let destination = self
            .find_nearest_hubs(dst_v4, dst_v6, opts, HubType::Destination, 1)?
            .into_iter()
            .next()
            .ok_or(MapError::NoRoute)?;

        let mut hops = vec![home_pin];
        if opts.routing_profile.as_str() == ROUTING_PROFILE_PRIVACY {
            let transit = self
                .find_nearest_hubs(dst_v4, dst_v6, opts, HubType::Transit, 3)?
                .into_iter()
                .find(|pin| {
                    pin.hub.id != hops[0].hub.id && pin.hub.id != destination.hub.id
                });
            if let Some(pin) = transit {
                hops.push(pin);
            }
        }
        let last = hops.last().expect("home hop present");
        if destination.hub.id != last.hub.id {
            hops.push(destination);
        }

        debug!(
            hops = hops.len(),
            destination = %hops.last().map(|p| p.hub.id.to_string()).unwrap_or_default(),
            profile = %opts.routing_profile,
            "navigator: route built"
        );
        Ok(Route { hops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubId};
    use crate::mailbox::Mailbox;
    use crate::navigator::PinState;
    use crate::terminal::{
        OutboundSink, Terminal, TerminalOpts, TerminalSpawn, TerminalState,
    };
    use crate::unit::Scheduler;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn usable_pin(id: &str, lat: f64, lon: f64) -> Pin {
        let mut pin = Pin::new(Hub::new(id));
        pin.state = PinState::SUMMARY_REGARD;
        pin.location_v4 = Some(Location::new(lat, lon));
        pin
    }

    fn live_terminal() -> Arc<Terminal> {
        let (terminal, _tx) = Terminal::spawn(TerminalSpawn {
            id: 1,
            crane_name: "route-test".into(),
            sink: OutboundSink::Shared(Arc::new(Mailbox::new(4))),
            scheduler: Scheduler::default(),
            parent_cancel: CancellationToken::new(),
            reaper: None,
            opts: TerminalOpts::default(),
            remote: false,
            idle_timeout: None,
            initial_state: TerminalState::Live,
        });
        terminal
    }

    fn map_with_home() -> Map {
        let map = Map::new();
        map.add_pin(usable_pin("home", 50.0, 8.0));
        map.add_pin(usable_pin("mid", 48.0, 6.0));
        map.add_pin(usable_pin("exit", 40.0, -3.0));
        assert!(map.set_home(&HubId::from("home"), live_terminal()));
        map
    }

    #[tokio::test]
    async fn default_route_is_home_then_destination() {
        let map = map_with_home();
        let madrid = Location::new(40.4, -3.7);
        let route = map
            .find_route(Some(&madrid), None, &map.default_options())
            .unwrap();

        let ids: Vec<&str> = route.hops.iter().map(|p| p.hub.id.as_str()).collect();
        assert_eq!(ids, vec!["home", "exit"]);
        assert_eq!(route.destination().hub.id, HubId::from("exit"));
    }

    #[tokio::test]
    async fn privacy_profile_inserts_a_transit_hop() {
        let map = map_with_home();
        let madrid = Location::new(40.4, -3.7);
        let opts = Options {
            routing_profile: ROUTING_PROFILE_PRIVACY.into(),
            ..map.default_options()
        };
        let route = map.find_route(Some(&madrid), None, &opts).unwrap();

        let ids: Vec<&str> = route.hops.iter().map(|p| p.hub.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "home");
        assert_eq!(ids[2], "exit");
        assert_ne!(ids[1], "home");
        assert_ne!(ids[1], "exit");
    }

    #[tokio::test]
    async fn route_without_home_fails() {
        let map = Map::new();
        map.add_pin(usable_pin("somewhere", 0.0, 0.0));
        let err = map
            .find_route(None, None, &map.default_options())
            .unwrap_err();
        assert_eq!(err, MapError::NoRoute);
    }

    #[tokio::test]
    async fn trusted_destination_requirement_shapes_the_route() {
        let map = map_with_home();
        // Only "mid" is trusted.
        map.update_pin_state(&HubId::from("mid"), PinState::TRUSTED, PinState::empty());

        let madrid = Location::new(40.4, -3.7);
        let opts = Options {
            require_trusted_destination_hubs: true,
            ..map.default_options()
        };
        let route = map.find_route(Some(&madrid), None, &opts).unwrap();
        assert_eq!(route.destination().hub.id, HubId::from("mid"));
    }

    #[tokio::test]
    async fn empty_map_route_reports_empty_map() {
        let map = Map::new();
        let err = map
            .find_route(None, None, &map.default_options())
            .unwrap_err();
        assert_eq!(err, MapError::EmptyMap);
    }
}
