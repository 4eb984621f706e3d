//! Foreman: work coordination and zombie supervision for coding-agent fleets.

pub mod api;
pub mod assignments;
pub mod backlog;
pub mod claims;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod runs;
pub mod store;
pub mod zombie;
