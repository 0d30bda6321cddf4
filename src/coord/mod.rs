//! Coordinator side of the cluster
//!
//! A coordinator owns the work and result channels. At most one pool uses
//! it at a time, enforced by an advisory lock.

pub mod coordinator;
pub mod registry;

pub use coordinator::{Coordinator, CoordinatorLease};
pub use registry::{default_coordinator, make_coordinator, make_coordinator_in, CoordinatorRegistry};
