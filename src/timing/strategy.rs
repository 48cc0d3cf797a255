//! Credit issuing strategies.
//!
//! A strategy answers one question: when is the next credit due, and for
//! which conversation. Phase bounds (count or duration) live in
//! `CreditPhaseStats::should_send`, not here.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::{LoadGeneratorConfig, RequestRateMode};
use crate::error::{AiperfError, Result};
use crate::models::credit::NANOS_PER_SECOND;
use crate::models::dataset::Conversation;

/// The schedule for one credit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCredit {
    pub conversation_id: Option<String>,
    /// Wall-clock instant the request is due; `None` means send ASAP.
    pub credit_drop_ns: Option<u64>,
}

pub trait CreditStrategy: Send {
    /// The next credit's schedule, or `None` when the strategy itself is
    /// exhausted (fixed schedules only).
    fn next(&mut self, phase_start_ns: u64) -> Option<ScheduledCredit>;
}

/// Build the strategy for one phase.
pub fn build_strategy(
    config: &LoadGeneratorConfig,
    conversations: &[Conversation],
) -> Result<Box<dyn CreditStrategy>> {
    match config {
        LoadGeneratorConfig::FixedSchedule => {
            let schedule = FixedScheduleStrategy::from_conversations(conversations)?;
            Ok(Box::new(schedule))
        }
        LoadGeneratorConfig::RequestRate { mode, rate, seed } => match mode {
            RequestRateMode::Constant => {
                let rate = rate.ok_or_else(|| {
                    AiperfError::Config("constant rate mode requires a rate".into())
                })?;
                Ok(Box::new(ConstantRateStrategy::new(rate)))
            }
            RequestRateMode::Poisson => {
                let rate = rate.ok_or_else(|| {
                    AiperfError::Config("poisson rate mode requires a rate".into())
                })?;
                Ok(Box::new(PoissonRateStrategy::new(rate, seed.unwrap_or(0))))
            }
            RequestRateMode::ConcurrencyBurst => Ok(Box::new(ConcurrencyBurstStrategy)),
        },
    }
}

/// Replays dataset-provided `(timestamp, conversation)` tuples.
pub struct FixedScheduleStrategy {
    /// Millisecond offsets from phase start, sorted, paired with session
    /// ids.
    entries: Vec<(u64, String)>,
    index: usize,
}

impl FixedScheduleStrategy {
    pub fn from_conversations(conversations: &[Conversation]) -> Result<Self> {
        let mut entries = Vec::new();
        for conversation in conversations {
            for turn in &conversation.turns {
                if let Some(timestamp) = turn.timestamp {
                    entries.push((timestamp, conversation.session_id.clone()));
                }
            }
        }
        if entries.is_empty() {
            return Err(AiperfError::Config(
                "fixed schedule requires turns with timestamps".to_string(),
            ));
        }
        entries.sort();
        Ok(Self { entries, index: 0 })
    }
}

impl CreditStrategy for FixedScheduleStrategy {
    fn next(&mut self, phase_start_ns: u64) -> Option<ScheduledCredit> {
        let (offset_ms, session_id) = self.entries.get(self.index)?;
        self.index += 1;
        Some(ScheduledCredit {
            conversation_id: Some(session_id.clone()),
            credit_drop_ns: Some(phase_start_ns + offset_ms * 1_000_000),
        })
    }
}

/// Fixed rate: each instant is the previous plus `1/rate`.
pub struct ConstantRateStrategy {
    interval_ns: u64,
    next_offset_ns: u64,
}

impl ConstantRateStrategy {
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            interval_ns: (NANOS_PER_SECOND as f64 / rate_per_sec) as u64,
            next_offset_ns: 0,
        }
    }
}

impl CreditStrategy for ConstantRateStrategy {
    fn next(&mut self, phase_start_ns: u64) -> Option<ScheduledCredit> {
        let due = phase_start_ns + self.next_offset_ns;
        self.next_offset_ns += self.interval_ns;
        Some(ScheduledCredit {
            conversation_id: None,
            credit_drop_ns: Some(due),
        })
    }
}

/// Poisson arrivals: exponential inter-arrival gaps from a seeded RNG, so
/// runs are reproducible.
pub struct PoissonRateStrategy {
    mean_interval_ns: f64,
    rng: SmallRng,
    next_offset_ns: f64,
}

impl PoissonRateStrategy {
    pub fn new(rate_per_sec: f64, seed: u64) -> Self {
        Self {
            mean_interval_ns: NANOS_PER_SECOND as f64 / rate_per_sec,
            rng: SmallRng::seed_from_u64(seed),
            next_offset_ns: 0.0,
        }
    }
}

impl CreditStrategy for PoissonRateStrategy {
    fn next(&mut self, phase_start_ns: u64) -> Option<ScheduledCredit> {
        let due = phase_start_ns + self.next_offset_ns as u64;
        let uniform: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        self.next_offset_ns += -self.mean_interval_ns * uniform.ln();
        Some(ScheduledCredit {
            conversation_id: None,
            credit_drop_ns: Some(due),
        })
    }
}

/// No schedule at all: send as fast as concurrency admission allows.
pub struct ConcurrencyBurstStrategy;

impl CreditStrategy for ConcurrencyBurstStrategy {
    fn next(&mut self, _phase_start_ns: u64) -> Option<ScheduledCredit> {
        Some(ScheduledCredit {
            conversation_id: None,
            credit_drop_ns: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dataset::Turn;

    #[test]
    fn constant_rate_spaces_instants_evenly() {
        let mut strategy = ConstantRateStrategy::new(10.0);
        let start = 1_000_000_000;
        let first = strategy.next(start).unwrap();
        let second = strategy.next(start).unwrap();
        let third = strategy.next(start).unwrap();
        assert_eq!(first.credit_drop_ns, Some(start));
        assert_eq!(second.credit_drop_ns, Some(start + 100_000_000));
        assert_eq!(third.credit_drop_ns, Some(start + 200_000_000));
    }

    #[test]
    fn poisson_is_reproducible_for_a_seed() {
        let collect = |seed| {
            let mut strategy = PoissonRateStrategy::new(100.0, seed);
            (0..5)
                .map(|_| strategy.next(0).unwrap().credit_drop_ns.unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(collect(42), collect(42));
        assert_ne!(collect(42), collect(43));

        // Instants are non-decreasing.
        let instants = collect(42);
        assert!(instants.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn burst_has_no_scheduled_instant() {
        let mut strategy = ConcurrencyBurstStrategy;
        let credit = strategy.next(123).unwrap();
        assert_eq!(credit.credit_drop_ns, None);
    }

    #[test]
    fn fixed_schedule_replays_sorted_timestamps() {
        let conversations = vec![
            Conversation {
                session_id: "b".into(),
                turns: vec![Turn {
                    timestamp: Some(200),
                    ..Default::default()
                }],
            },
            Conversation {
                session_id: "a".into(),
                turns: vec![Turn {
                    timestamp: Some(100),
                    ..Default::default()
                }],
            },
        ];
        let mut strategy = FixedScheduleStrategy::from_conversations(&conversations).unwrap();
        let first = strategy.next(0).unwrap();
        assert_eq!(first.conversation_id, Some("a".into()));
        assert_eq!(first.credit_drop_ns, Some(100_000_000));
        let second = strategy.next(0).unwrap();
        assert_eq!(second.conversation_id, Some("b".into()));
        assert!(strategy.next(0).is_none());
    }

    #[test]
    fn fixed_schedule_without_timestamps_is_invalid() {
        let conversations = vec![Conversation {
            session_id: "a".into(),
            turns: vec![Turn::default()],
        }];
        assert!(FixedScheduleStrategy::from_conversations(&conversations).is_err());
    }
}
