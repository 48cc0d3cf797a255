//! AIPerf: a distributed benchmark driver for LLM inference endpoints.
//!
//! A system controller orchestrates a fleet of cooperating services
//! (timing manager, dataset manager, workers, record processors, records
//! manager, telemetry manager) connected by a ZeroMQ message fabric. The
//! timing manager issues credits on a schedule, workers turn credits into
//! timed HTTP requests, record processors turn raw request records into
//! per-record metrics, and the records manager aggregates everything into
//! a statistical report.

pub mod clock;
pub mod comms;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod endpoints;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod models;
pub mod records;
pub mod service;
pub mod telemetry;
pub mod timing;
pub mod workers;

use serde::{Deserialize, Serialize};

pub use config::{ServiceConfig, UserConfig};
pub use controller::{LaunchMode, RunOutcome, SystemController, exit_code};
pub use error::{AiperfError, ErrorDetails, Result};

/// On-disk run description handed to spawned service processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub service: ServiceConfig,
    pub user: UserConfig,
}
