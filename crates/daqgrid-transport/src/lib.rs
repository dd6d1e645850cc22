//! daqgrid-transport — typed transport to the outer resource manager.
//!
//! The wire protocol itself is externally defined; this crate is the thin
//! bidirectional façade the scheduler core programs against:
//!
//! - Outbound [`Call`]s: subscribe, accept with launches, decline, revive,
//!   kill, executor message
//! - Inbound [`Event`]s: subscribed, offers, update, failure, message
//! - A three-way error split so the controller can tell a clean
//!   disconnect from a transport failure from a protocol violation
//! - A [`Connector`] seam yielding one [`ManagerConnection`] per
//!   subscription attempt
//!
//! The [`loopback`] module provides a simulated cluster speaking this
//! interface, used by the daemon's loopback mode and the integration
//! tests.

pub mod call;
pub mod client;
pub mod error;
pub mod loopback;

pub use call::{Call, Event, FrameworkInfo, LaunchInfo};
pub use client::{pair, CallSender, Connector, ManagerConnection, RemoteEnd};
pub use error::{TransportError, TransportResult};
pub use loopback::{AgentSpec, LoopbackCluster, LoopbackConnector};
