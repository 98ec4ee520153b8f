//! Fairway — the core relay fabric of a privacy-preserving overlay network.
//!
//! A mesh of cooperating relay nodes (hubs) carries user traffic through
//! multi-hop tunnels. This crate implements the fabric between them:
//!
//! 1. **Cranes** — duplex logical pipes between two hubs, multiplexing many
//!    independent flows over one connection with framing, batching and
//!    strict priority for control traffic.
//! 2. **Terminals** — the per-flow endpoints inside a crane: typed
//!    messages, lifecycle states, idle reaping and structured flow errors,
//!    all admission-controlled by a shared unit scheduler.
//! 3. **The navigator** — a policy-scored map of known hubs producing home
//!    hub candidates, lane suggestions and routes.
//!
//! The **captain** orchestrates the three: it picks a home hub, bootstraps
//! the map over gossip, and periodically re-optimises the lane topology.
//!
//! Sockets, TLS, authorisation cryptography and the module lifecycle
//! harness stay outside; they reach the fabric through the collaborator
//! traits in [`captain`], [`access`] and [`netenv`].

pub mod access;
pub mod captain;
pub mod codec;
pub mod crane;
pub mod docks;
pub mod error;
pub mod hub;
pub mod intel;
pub mod mailbox;
pub mod metrics;
pub mod msg;
pub mod navigator;
pub mod netenv;
pub mod ops;
pub mod payload;
pub mod terminal;
pub mod unit;

pub use crane::{Crane, CraneOpts, CraneTransport};
pub use error::{FlowError, FlowErrorKind};
pub use hub::{Hub, HubId};
pub use msg::{Msg, MsgKind};
pub use navigator::Map;
pub use terminal::{Terminal, TerminalOpts, TerminalState};
pub use unit::{Scheduler, SchedulerConfig, Unit};
