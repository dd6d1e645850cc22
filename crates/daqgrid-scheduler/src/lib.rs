//! daqgrid-scheduler — the control loop of the scheduler core.
//!
//! Connects the pieces:
//!
//! - [`OfferMatcher`] — per-cycle allocation of descriptors to offers
//! - [`Controller`] — subscribe loop, event dispatch, reconnect backoff,
//!   the revive throttle, and the inbound message router
//! - [`assemble`] — wires task manager, command servant, environment
//!   manager, matcher and controller into one runnable core
//!
//! # Event flow
//!
//! ```text
//! Connector ──▶ Controller ──▶ OfferMatcher ──▶ ACCEPT / DECLINE
//!                  │  ▲
//!     UPDATE ──────┘  └── REVIVE (token-bucket throttled)
//!        │
//!        ├─▶ TaskManager ──▶ TaskEvent ──▶ EnvironmentManager
//!        └─▶ MessageRouter ──▶ CommandServant / EnvironmentManager
//! ```

pub mod backoff;
pub mod controller;
pub mod error;
pub mod matcher;
pub mod metrics;
pub mod router;
pub mod runtime;

pub use backoff::Backoff;
pub use controller::{run_revive_loop, Controller, SchedulerEvent};
pub use error::{SchedulerError, SchedulerResult};
pub use matcher::{DeploymentMap, MatchSettings, OfferMatcher};
pub use metrics::SchedulerMetrics;
pub use runtime::{assemble, Core};
