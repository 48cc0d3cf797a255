//! Per-record metric computation.
//!
//! Metrics form a DAG: a metric may declare `required_metrics` by tag, and
//! the registry evaluates in topological order, passing already-computed
//! values to later stages. `NoMetricValue` is the expected skip signal for
//! records that lack a metric's inputs; any other error is surfaced to the
//! error summary.

pub mod types;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{AiperfError, ErrorDetails, Result};
use crate::models::metric::{MetricRecord, MetricValue};
use crate::models::record::ParsedResponseRecord;

/// Behavior flags consulted by summary exporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricFlags(u32);

impl MetricFlags {
    pub const NONE: Self = Self(0);
    /// Excluded from console summaries.
    pub const NO_CONSOLE: Self = Self(1 << 0);
    /// Only meaningful for streaming token-producing endpoints.
    pub const STREAMING_TOKENS_ONLY: Self = Self(1 << 1);
    /// Meaningful only when the model emits reasoning content.
    pub const SUPPORTS_REASONING: Self = Self(1 << 2);
    pub const EXPERIMENTAL: Self = Self(1 << 3);
    /// Plumbing values never shown to users.
    pub const INTERNAL: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MetricFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Values computed so far for the current record.
#[derive(Default)]
pub struct MetricValues(HashMap<String, MetricValue>);

impl MetricValues {
    pub fn insert(&mut self, tag: &str, value: MetricValue) {
        self.0.insert(tag.to_string(), value);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains_key(tag)
    }

    /// Fetch a required scalar; absence raises `NoMetricValue`.
    pub fn scalar(&self, tag: &str) -> Result<f64> {
        self.0
            .get(tag)
            .and_then(MetricValue::as_scalar)
            .ok_or_else(|| AiperfError::NoMetricValue(format!("required metric {tag} missing")))
    }

    pub fn into_record(self) -> MetricRecord {
        self.0
    }
}

/// One per-record metric.
pub trait RecordMetric: Send + Sync {
    fn tag(&self) -> &'static str;
    fn header(&self) -> &'static str;
    fn unit(&self) -> &'static str;

    fn flags(&self) -> MetricFlags {
        MetricFlags::NONE
    }

    /// Tags this metric needs computed first.
    fn required_metrics(&self) -> &'static [&'static str] {
        &[]
    }

    fn compute(&self, record: &ParsedResponseRecord, prior: &MetricValues) -> Result<MetricValue>;
}

/// All registered metrics, held in topological order.
pub struct MetricRegistry {
    metrics: Vec<Arc<dyn RecordMetric>>,
}

impl MetricRegistry {
    /// The canonical metric set.
    pub fn standard() -> Self {
        Self::from_metrics(types::standard_metrics())
    }

    pub fn from_metrics(metrics: Vec<Arc<dyn RecordMetric>>) -> Self {
        Self {
            metrics: topological_order(metrics),
        }
    }

    pub fn metrics(&self) -> &[Arc<dyn RecordMetric>] {
        &self.metrics
    }

    /// Header and unit for a tag, for summarization.
    pub fn display_info(&self, tag: &str) -> Option<(&'static str, &'static str)> {
        self.metrics
            .iter()
            .find(|m| m.tag() == tag)
            .map(|m| (m.header(), m.unit()))
    }

    /// Evaluate every metric whose required inputs are present.
    /// `NoMetricValue` skips silently; other failures are reported.
    pub fn compute_all(&self, record: &ParsedResponseRecord) -> (MetricRecord, Vec<ErrorDetails>) {
        let mut values = MetricValues::default();
        let mut errors = Vec::new();

        for metric in &self.metrics {
            if !metric
                .required_metrics()
                .iter()
                .all(|tag| values.contains(tag))
            {
                continue;
            }
            match metric.compute(record, &values) {
                Ok(value) => values.insert(metric.tag(), value),
                Err(e) if e.is_no_metric_value() => {}
                Err(e) => errors.push(ErrorDetails::from(&e)),
            }
        }
        (values.into_record(), errors)
    }
}

/// Kahn's algorithm over the `required_metrics` edges. Metrics with
/// unsatisfiable requirements are dropped (they could never run).
fn topological_order(metrics: Vec<Arc<dyn RecordMetric>>) -> Vec<Arc<dyn RecordMetric>> {
    let index_by_tag: HashMap<&str, usize> = metrics
        .iter()
        .enumerate()
        .map(|(i, m)| (m.tag(), i))
        .collect();

    let mut in_degree = vec![0usize; metrics.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); metrics.len()];
    for (i, metric) in metrics.iter().enumerate() {
        for required in metric.required_metrics() {
            match index_by_tag.get(required) {
                Some(&dep) => {
                    dependents[dep].push(i);
                    in_degree[i] += 1;
                }
                None => {
                    tracing::warn!(
                        metric = metric.tag(),
                        required,
                        "metric requires an unregistered tag; it will never run"
                    );
                    in_degree[i] = usize::MAX;
                }
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..metrics.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(metrics.len());
    while let Some(i) = queue.pop_front() {
        ordered.push(metrics[i].clone());
        for &dependent in &dependents[i] {
            if in_degree[dependent] == usize::MAX {
                continue;
            }
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        tag: &'static str,
        requires: &'static [&'static str],
    }

    impl RecordMetric for Fixed {
        fn tag(&self) -> &'static str {
            self.tag
        }
        fn header(&self) -> &'static str {
            "fixed"
        }
        fn unit(&self) -> &'static str {
            "ns"
        }
        fn required_metrics(&self) -> &'static [&'static str] {
            self.requires
        }
        fn compute(&self, _: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
            Ok(MetricValue::Scalar(1.0))
        }
    }

    #[test]
    fn dependencies_order_before_dependents() {
        let registry = MetricRegistry::from_metrics(vec![
            Arc::new(Fixed {
                tag: "c",
                requires: &["b"],
            }),
            Arc::new(Fixed {
                tag: "a",
                requires: &[],
            }),
            Arc::new(Fixed {
                tag: "b",
                requires: &["a"],
            }),
        ]);
        let order: Vec<&str> = registry.metrics().iter().map(|m| m.tag()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn unsatisfiable_requirements_drop_the_metric() {
        let registry = MetricRegistry::from_metrics(vec![
            Arc::new(Fixed {
                tag: "orphan",
                requires: &["missing"],
            }),
            Arc::new(Fixed {
                tag: "a",
                requires: &[],
            }),
        ]);
        let order: Vec<&str> = registry.metrics().iter().map(|m| m.tag()).collect();
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn flags_compose() {
        let flags = MetricFlags::NO_CONSOLE | MetricFlags::INTERNAL;
        assert!(flags.contains(MetricFlags::NO_CONSOLE));
        assert!(flags.contains(MetricFlags::INTERNAL));
        assert!(!flags.contains(MetricFlags::EXPERIMENTAL));
    }
}
