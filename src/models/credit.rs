//! Credit phase configuration and bookkeeping.
//!
//! A credit is one token of work authorization: a dropped credit means "send
//! one request now", a returned credit means "that request completed". The
//! timing manager is the sole owner of `CreditPhaseStats`.

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::{AiperfError, Result};

pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditPhase {
    Warmup,
    Profiling,
}

impl std::fmt::Display for CreditPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warmup => write!(f, "warmup"),
            Self::Profiling => write!(f, "profiling"),
        }
    }
}

/// Configuration for one credit phase. Exactly one of
/// `total_expected_requests` / `expected_duration_sec` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPhaseConfig {
    #[serde(rename = "type")]
    pub phase: CreditPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_expected_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_sec: Option<f64>,
}

impl CreditPhaseConfig {
    pub fn count_based(phase: CreditPhase, total: u64) -> Self {
        Self {
            phase,
            total_expected_requests: Some(total),
            expected_duration_sec: None,
        }
    }

    pub fn time_based(phase: CreditPhase, duration_sec: f64) -> Self {
        Self {
            phase,
            total_expected_requests: None,
            expected_duration_sec: Some(duration_sec),
        }
    }

    pub fn is_time_based(&self) -> bool {
        self.expected_duration_sec.is_some()
    }

    pub fn is_count_based(&self) -> bool {
        self.total_expected_requests.is_some()
    }

    /// Valid iff exactly one bound is set.
    pub fn validate(&self) -> Result<()> {
        match (self.total_expected_requests, self.expected_duration_sec) {
            (Some(n), None) if n >= 1 => Ok(()),
            (None, Some(d)) if d > 0.0 => Ok(()),
            (Some(_), Some(_)) => Err(AiperfError::Config(format!(
                "{} phase sets both a request count and a duration",
                self.phase
            ))),
            _ => Err(AiperfError::Config(format!(
                "{} phase must set exactly one of total_expected_requests or expected_duration_sec",
                self.phase
            ))),
        }
    }
}

/// Runtime stats for one phase, mutated only by the timing manager.
///
/// `start_ns`, `sent_end_ns` and `end_ns` are wall-clock nanoseconds; phase
/// durations are configured in seconds of real time, so the wall clock is
/// used consistently for the sending window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPhaseStats {
    #[serde(flatten)]
    pub config: CreditPhaseConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_end_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ns: Option<u64>,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub was_cancelled: bool,
}

impl CreditPhaseStats {
    pub fn from_config(config: CreditPhaseConfig) -> Self {
        Self {
            config,
            start_ns: None,
            sent_end_ns: None,
            end_ns: None,
            sent: 0,
            completed: 0,
            was_cancelled: false,
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.sent - self.completed
    }

    pub fn is_started(&self) -> bool {
        self.start_ns.is_some()
    }

    pub fn is_sending_complete(&self) -> bool {
        self.sent_end_ns.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.is_sending_complete() && self.end_ns.is_some() && self.in_flight() == 0
    }

    /// Whether more credits should be sent right now.
    pub fn should_send(&self) -> bool {
        if let Some(duration_sec) = self.config.expected_duration_sec {
            let elapsed = clock::wall_now_ns().saturating_sub(self.start_ns.unwrap_or(0));
            elapsed as f64 <= duration_sec * NANOS_PER_SECOND as f64
        } else if let Some(total) = self.config.total_expected_requests {
            self.sent < total
        } else {
            false
        }
    }

    /// Progress through the phase, 0-100, or `None` when unknowable.
    pub fn progress_percent(&self) -> Option<f64> {
        let start_ns = self.start_ns?;
        if self.is_complete() {
            return Some(100.0);
        }
        if let Some(duration_sec) = self.config.expected_duration_sec {
            let elapsed = clock::wall_now_ns().saturating_sub(start_ns) as f64;
            Some((elapsed / (duration_sec * NANOS_PER_SECOND as f64)) * 100.0)
        } else {
            self.config
                .total_expected_requests
                .map(|total| (self.completed as f64 / total as f64) * 100.0)
        }
    }
}

/// Record-processing counters tracked per worker and globally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub processed: u64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_expected_requests: Option<u64>,
}

impl ProcessingStats {
    pub fn total_records(&self) -> u64 {
        self.processed + self.errors
    }

    pub fn is_complete(&self) -> bool {
        Some(self.total_records()) == self.total_expected_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_bound_is_required() {
        assert!(
            CreditPhaseConfig::count_based(CreditPhase::Profiling, 10)
                .validate()
                .is_ok()
        );
        assert!(
            CreditPhaseConfig::time_based(CreditPhase::Profiling, 5.0)
                .validate()
                .is_ok()
        );

        let both = CreditPhaseConfig {
            phase: CreditPhase::Profiling,
            total_expected_requests: Some(10),
            expected_duration_sec: Some(5.0),
        };
        assert!(both.validate().is_err());

        let neither = CreditPhaseConfig {
            phase: CreditPhase::Warmup,
            total_expected_requests: None,
            expected_duration_sec: None,
        };
        assert!(neither.validate().is_err());
    }

    #[test]
    fn count_based_should_send_stops_at_total() {
        let mut stats =
            CreditPhaseStats::from_config(CreditPhaseConfig::count_based(CreditPhase::Profiling, 2));
        stats.start_ns = Some(clock::wall_now_ns());
        assert!(stats.should_send());
        stats.sent = 2;
        assert!(!stats.should_send());
    }

    #[test]
    fn time_based_should_send_stops_after_duration() {
        let mut stats = CreditPhaseStats::from_config(CreditPhaseConfig::time_based(
            CreditPhase::Profiling,
            1.0,
        ));
        stats.start_ns = Some(clock::wall_now_ns() - 2 * NANOS_PER_SECOND);
        assert!(!stats.should_send());

        stats.start_ns = Some(clock::wall_now_ns());
        assert!(stats.should_send());
    }

    #[test]
    fn in_flight_and_completion() {
        let mut stats =
            CreditPhaseStats::from_config(CreditPhaseConfig::count_based(CreditPhase::Warmup, 4));
        stats.sent = 4;
        stats.completed = 1;
        assert_eq!(stats.in_flight(), 3);
        assert!(!stats.is_complete());

        stats.completed = 4;
        stats.sent_end_ns = Some(1);
        stats.end_ns = Some(2);
        assert!(stats.is_complete());
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn outstanding_credits_block_completion() {
        // A cancelled phase can have end_ns stamped at the grace deadline
        // while credits are still unreturned; it must not read as complete.
        let mut stats =
            CreditPhaseStats::from_config(CreditPhaseConfig::count_based(CreditPhase::Profiling, 4));
        stats.start_ns = Some(clock::wall_now_ns());
        stats.sent = 4;
        stats.completed = 2;
        stats.sent_end_ns = Some(1);
        stats.end_ns = Some(2);
        stats.was_cancelled = true;

        assert_eq!(stats.in_flight(), 2);
        assert!(!stats.is_complete());
        assert_eq!(stats.progress_percent(), Some(50.0));

        stats.completed = 4;
        assert!(stats.is_complete());
        assert_eq!(stats.progress_percent(), Some(100.0));
    }

    #[test]
    fn count_based_progress_tracks_completed() {
        let mut stats =
            CreditPhaseStats::from_config(CreditPhaseConfig::count_based(CreditPhase::Profiling, 4));
        assert_eq!(stats.progress_percent(), None);
        stats.start_ns = Some(clock::wall_now_ns());
        stats.completed = 1;
        assert_eq!(stats.progress_percent(), Some(25.0));
    }
}
