// SQLite persistence: lease rows, agent registry, event log.

pub mod agents;
pub mod db;
pub mod events;
pub mod leases;

pub use db::LeaseDb;
