//! daqgrid-state — framework identity persistence.
//!
//! The scheduler core persists exactly one key: the framework identity
//! assigned by the outer resource manager on the first successful
//! subscription. The identity is read on every subscribe so a restarted
//! scheduler can claim its previous registration within the failover
//! timeout.
//!
//! Backed by [redb](https://docs.rs/redb) with on-disk and in-memory
//! backends (the latter for testing).

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::IdentityStore;
