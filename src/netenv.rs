//! Network environment collaborator — device locations and firewall
//! exceptions.
//!
//! The fabric never probes the network itself; it asks an implementation of
//! [`NetEnv`] for the device's best-effort internet locations and for
//! temporary firewall exceptions while dialing a hub. Production wires this
//! to the host integration layer; tests use fixed stubs.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// An approximate geographic position, optionally tied to the IP it was
/// derived from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub ip: Option<IpAddr>,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            ip: None,
            latitude,
            longitude,
        }
    }

    pub fn with_ip(latitude: f64, longitude: f64, ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in kilometers (haversine).
    pub fn distance_km(&self, other: &Location) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// The device's best v4 and v6 internet locations.
#[derive(Debug, Clone, Default)]
pub struct DeviceLocations {
    pub v4: Option<Location>,
    pub v6: Option<Location>,
}

impl DeviceLocations {
    pub fn best_v4(&self) -> Option<&Location> {
        self.v4.as_ref()
    }

    pub fn best_v6(&self) -> Option<&Location> {
        self.v6.as_ref()
    }

    /// The IP to use when building the device's own entity for entry-policy
    /// probes. Prefers v4.
    pub fn best_ip(&self) -> Option<IpAddr> {
        self.v4
            .as_ref()
            .and_then(|l| l.ip)
            .or_else(|| self.v6.as_ref().and_then(|l| l.ip))
    }
}

/// Host network integration consumed by the captain.
pub trait NetEnv: Send + Sync {
    /// Best-effort v4/v6 device location, or `None` when the device cannot
    /// be located at all.
    fn internet_location(&self) -> Option<DeviceLocations>;

    /// Replace the current firewall exceptions with the given addresses.
    /// Passing `(None, None)` clears them.
    fn set_exceptions(&self, ipv4: Option<IpAddr>, ipv6: Option<IpAddr>);
}

/// Scoped firewall exception: set on construction, cleared on drop, so the
/// exception cannot outlive the dial attempt on any exit path.
pub struct ExceptionGuard<'a> {
    env: &'a dyn NetEnv,
}

impl<'a> ExceptionGuard<'a> {
    pub fn set(env: &'a dyn NetEnv, ipv4: Option<IpAddr>, ipv6: Option<IpAddr>) -> Self {
        env.set_exceptions(ipv4, ipv6);
        Self { env }
    }
}

impl Drop for ExceptionGuard<'_> {
    fn drop(&mut self) {
        self.env.set_exceptions(None, None);
    }
}
