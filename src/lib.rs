//! Warmgate - a readiness front door for slow-starting web backends
//!
//! This library provides an HTTP front door that:
//! - Serves a live progress page while the backend boots and migrates
//! - Runs the backend's one-time initialization task exactly once
//! - Classifies backend logs into coarse startup phases
//! - Declares readiness only after consecutive successful health probes
//! - Proxies traffic to the backend once ready, rewriting HTML for embedding
//! - Supports both local processes and Docker containers as backends

pub mod backend;
pub mod classifier;
pub mod config;
pub mod docker;
pub mod error;
pub mod forwarded;
pub mod frontdoor;
pub mod health;
pub mod init;
pub mod marker;
pub mod monitor;
pub mod pages;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod rewrite;
pub mod state;
pub mod status_source;
pub mod tasks;

pub use backend::{AnyBackend, Backend, CommandOutput};
pub use config::Config;
pub use frontdoor::FrontDoor;
pub use health::{HealthProbe, ReadinessProbe};
pub use init::{InitError, InitOutcome, InitRunner};
pub use monitor::ReadinessMonitor;
pub use proxy::ForwardingProxy;
pub use state::{SharedState, Snapshot, Status};
