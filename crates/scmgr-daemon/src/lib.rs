//! scmgr-daemon - stateful side of the security component manager.
//!
//! - [`registry`]: per-process component table, quarantine, state machine
//! - [`grant`]: temporary permission grants and revokes
//! - [`timer`]: keyed delayed-task queue, clocks and the timer driver
//! - [`consent`]: first-use consent gate and its persisted records
//! - [`service`]: semantics of the IPC calls
//! - [`metrics`]: Prometheus metrics
//! - [`standalone`]: in-process oracles for running without OS services
//!
//! Construction is explicit: the binary (or a host process) builds one
//! [`ComponentRegistry`](registry::ComponentRegistry), wraps it in an
//! [`ScService`](service::ScService), and drives its timers with a
//! [`TimerDriver`](timer::TimerDriver).

pub mod consent;
pub mod grant;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod standalone;
pub mod timer;

pub use registry::{Caller, ComponentRegistry, RegistryDeps};
pub use service::{AppState, ClickReply, ScService};
