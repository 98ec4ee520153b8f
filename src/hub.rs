//! Hub identity — the relay nodes the fabric connects.
//!
//! A [`Hub`] is the static description of a relay node as the rest of the
//! crate consumes it: identity, dial addresses, and the entry/exit policies
//! it advertises. Liveness and routing state live on the navigator's
//! [`Pin`](crate::navigator::Pin), not here.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::intel::Policy;

/// Stable identifier of a hub across the overlay network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HubId(pub String);

impl HubId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HubId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A relay node as seen by cranes and the navigator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hub {
    pub id: HubId,
    /// Human-readable name, for logs only.
    pub name: String,
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    /// Who may open an entry tunnel through this hub.
    #[serde(default)]
    pub entry_policy: Policy,
    /// Where traffic may leave the network through this hub.
    #[serde(default)]
    pub exit_policy: Policy,
}

impl Hub {
    pub fn new(id: impl Into<String>) -> Self {
        let id = HubId::new(id);
        Self {
            name: id.0.clone(),
            id,
            ..Self::default()
        }
    }
}

impl fmt::Display for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

impl Default for HubId {
    fn default() -> Self {
        Self(String::new())
    }
}
