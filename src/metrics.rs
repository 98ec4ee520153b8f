//! Metric name constants.
//!
//! All metric names live here so call sites cannot typo them and renames
//! stay centralized. Registration and exporters are the host's concern;
//! the fabric only records through the `metrics` facade.

/// Frames read off crane transports (counter).
pub const CRANE_FRAMES_IN: &str = "fairway_crane_frames_in_total";
/// Frames written to crane transports (counter).
pub const CRANE_FRAMES_OUT: &str = "fairway_crane_frames_out_total";
/// Payload bytes read off crane transports (counter).
pub const CRANE_BYTES_IN: &str = "fairway_crane_bytes_in_total";
/// Payload bytes written to crane transports (counter).
pub const CRANE_BYTES_OUT: &str = "fairway_crane_bytes_out_total";

/// Terminals currently registered across all cranes, controller included
/// (gauge).
pub const TERMINALS_ACTIVE: &str = "fairway_terminals_active";

/// Issued-but-unfinished scheduler units (gauge, sampled by the sweeper).
pub const UNITS_IN_FLIGHT: &str = "fairway_units_in_flight";

/// Lanes established by optimisation passes (counter).
pub const LANES_ESTABLISHED: &str = "fairway_lanes_established_total";
/// Cranes marked for retirement by optimisation passes (counter).
pub const CRANES_RETIRED: &str = "fairway_cranes_retired_total";
