//! Tracing targets.
//!
//! The crate logs through `tracing` and never installs a subscriber. Use these
//! targets in filter directives, e.g.
//! `RUST_LOG=horizon_lattice_graphql_ws::connection=debug`.

/// Target names for log filtering.
pub mod targets {
    /// Crate-wide target.
    pub const CLIENT: &str = "horizon_lattice_graphql_ws";
    /// Connection establishment, locks, retries.
    pub const CONNECTION: &str = "horizon_lattice_graphql_ws::connection";
    /// Per-subscription routing and lifecycle.
    pub const SUBSCRIPTION: &str = "horizon_lattice_graphql_ws::subscription";
    /// Frames in and out of the socket.
    pub const TRANSPORT: &str = "horizon_lattice_graphql_ws::transport";
}
