// SPDX-License-Identifier: MIT

//! The Dockhand orchestration engine.
//!
//! One independent processing flow per container: an instruction worker
//! draining the durable queue, an assistant session it dispatches into, a
//! health monitor probing it, and a log attachment feeding the store. The
//! [`LifecycleCoordinator`] is the only component that touches all of
//! them; everything else communicates through the [`EventBus`] and the
//! runtime/queue adapters.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod accountant;
pub mod bus;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod health;
pub mod session;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use accountant::UsageAccountant;
pub use bus::{EventBus, Subscription};
pub use collector::{CollectorStats, LogCollector};
pub use config::{
    CollectorConfig, ConfigError, EngineConfig, HealthConfig, SessionConfig, SharedConfig,
    WorkerConfig,
};
pub use coordinator::{LifecycleCoordinator, Orchestrator};
pub use health::HealthMonitor;
pub use session::{DispatchError, DispatchOutcome, SessionManager};
pub use worker::WorkerPool;
