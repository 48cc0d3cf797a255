//! Worker health reporting models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::credit::CreditPhase;

/// Per-phase task counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerPhaseTaskStats {
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl WorkerPhaseTaskStats {
    pub fn total_finished(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Process-level stats sampled from the OS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessHealth {
    pub pid: u32,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// CPU usage percentage since the previous sample.
    pub cpu_percent: f32,
    pub uptime_secs: u64,
}

/// Periodic worker health snapshot for progress display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub process: ProcessHealth,
    #[serde(default)]
    pub phase_stats: BTreeMap<CreditPhase, WorkerPhaseTaskStats>,
}
