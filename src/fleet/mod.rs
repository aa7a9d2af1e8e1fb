//! Worker fleet management.
//!
//! - [`FleetState`]: known instances and in-flight launch accounting
//! - [`FleetSupervisor`]: reconciliation loop, launcher pool, retirement
//! - [`CloudProvider`]: list/deploy/destroy calls, implemented for Exoscale by
//!   [`ExoscaleProvider`]
//!
//! The fleet grows only through launch authorization, which counts in-flight
//! launches alongside known instances, and shrinks only when a worker retires
//! its own instance.

pub mod exoscale;
pub mod provider;
pub mod state;
pub mod supervisor;

pub use exoscale::ExoscaleProvider;
pub use provider::{CloudProvider, Instance, InstanceRetirer};
pub use state::{FleetState, InstanceRecord};
pub use supervisor::{FleetSnapshot, FleetSupervisor};
