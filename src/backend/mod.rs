//! Downstream servers and their in-flight state
//!
//! - [`slot`]: the fixed-capacity correlation table with ABA-safe release
//! - [`health`]: the probe-driven availability state machine
//! - [`server`]: the backend itself with socket fan-out and forwarding

pub mod health;
pub mod server;
pub mod slot;

pub use health::{Availability, HealthCheckConfig, HealthState, Transition};
pub use server::{Backend, BackendConfig, BackendStats, DEFAULT_MAX_IN_FLIGHT, DEFAULT_UDP_TIMEOUT};
pub use slot::{Claimed, Release, SlotPayload, SlotTable, UNUSED_INDICATOR};
