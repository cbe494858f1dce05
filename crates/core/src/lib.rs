//! Lease-based coordination for agent processes sharing one checkout.
//!
//! Agents take advisory, TTL-bounded leases on file paths through a
//! [`coordinator::LockCoordinator`] backed by a SQLite store, and the
//! [`supervisor::ProcessSupervisor`] keeps those leases in step with a
//! supervised process's edits automatically.

pub mod config;
pub mod coordinator;
pub mod identity;
pub mod observer;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use coordinator::{AcquireOutcome, LockCoordinator};
pub use store::LeaseDb;
pub use supervisor::{ProcessSupervisor, SupervisorOptions};
