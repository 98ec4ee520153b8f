//! The navigator — the routing brain of the fabric.
//!
//! A [`Map`] of [`Pin`]s describes every known hub; [`Options`] compile
//! into policy matchers over them; `optimize` turns the map into lane
//! suggestions the captain acts on.

mod map;
mod optimize;
mod options;
mod pin;
mod route;

pub use map::{HomeRef, Map, MapError, DEFAULT_ROUTING_PROFILE};
pub use optimize::{OptimizationResult, SuggestedConnection};
pub use options::{HubType, Options, PinMatcher};
pub use pin::{Pin, PinState};
pub use route::{Route, ROUTING_PROFILE_PRIVACY};
