//! Metric values, per-record metadata, and summarized results.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorDetails, ErrorDetailsCount};
use crate::models::credit::CreditPhase;

/// A computed metric value for one record: a scalar or a scalar list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Series(Vec<f64>),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Series(_) => None,
        }
    }

    /// All values carried, one for a scalar, each element for a series.
    pub fn values(&self) -> &[f64] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::Series(vs) => vs,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        Self::Scalar(v as f64)
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(vs: Vec<f64>) -> Self {
        Self::Series(vs)
    }
}

/// Flat map of metric tag to computed value for one record.
pub type MetricRecord = HashMap<String, MetricValue>;

/// Metadata accompanying each batch of per-record metric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_correlation_id: Option<String>,
    /// Wall clock of the request start.
    pub request_start_ns: u64,
    /// Wall clock of the request end (or of the error).
    pub request_end_ns: u64,
    pub worker_id: String,
    pub record_processor_id: String,
    pub benchmark_phase: CreditPhase,
    #[serde(default)]
    pub was_cancelled: bool,
}

/// Statistical summary of one metric across the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub tag: String,
    pub header: String,
    pub unit: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
    pub count: u64,
    pub p1: f64,
    pub p5: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl MetricResult {
    /// Summarize a non-empty value set. Returns `None` for an empty slice.
    pub fn from_values(
        tag: impl Into<String>,
        header: impl Into<String>,
        unit: impl Into<String>,
        values: &[f64],
    ) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = sorted.len() as u64;
        let sum: f64 = sorted.iter().sum();
        let avg = sum / count as f64;
        let variance = sorted.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / count as f64;

        Some(Self {
            tag: tag.into(),
            header: header.into(),
            unit: unit.into(),
            avg,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            std: variance.sqrt(),
            count,
            p1: percentile(&sorted, 1.0),
            p5: percentile(&sorted, 5.0),
            p10: percentile(&sorted, 10.0),
            p25: percentile(&sorted, 25.0),
            p50: percentile(&sorted, 50.0),
            p75: percentile(&sorted, 75.0),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        })
    }
}

/// Linear-interpolation percentile over an already-sorted slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let weight = rank - lo as f64;
    sorted[lo] * (1.0 - weight) + sorted[hi] * weight
}

/// Final results envelope for a profiling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileResults {
    pub records: Vec<MetricResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_expected: Option<u64>,
    pub completed: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    #[serde(default)]
    pub was_cancelled: bool,
    #[serde(default)]
    pub error_summary: Vec<ErrorDetailsCount>,
}

impl ProfileResults {
    pub fn get(&self, tag: &str) -> Option<&MetricResult> {
        self.records.iter().find(|r| r.tag == tag)
    }
}

/// Result of a summarization pass: the profile results plus any errors hit
/// inside the results processors themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecordsOutput {
    pub results: ProfileResults,
    #[serde(default)]
    pub errors: Vec<ErrorDetails>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_linearly() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert_eq!(percentile(&values, 50.0), 2.5);
        assert_eq!(percentile(&values, 25.0), 1.75);
    }

    #[test]
    fn summary_over_known_values() {
        let result = MetricResult::from_values("lat", "Latency", "ns", &[10.0, 20.0, 30.0, 40.0])
            .expect("non-empty");
        assert_eq!(result.count, 4);
        assert_eq!(result.avg, 25.0);
        assert_eq!(result.min, 10.0);
        assert_eq!(result.max, 40.0);
        assert_eq!(result.p50, 25.0);
        let expected_std = ((225.0f64 + 25.0 + 25.0 + 225.0) / 4.0).sqrt();
        assert!((result.std - expected_std).abs() < 1e-9);
    }

    #[test]
    fn empty_values_produce_no_summary() {
        assert!(MetricResult::from_values("t", "h", "u", &[]).is_none());
    }

    #[test]
    fn metric_value_untagged_round_trip() {
        let scalar = MetricValue::Scalar(3.5);
        let series = MetricValue::Series(vec![1.0, 2.0]);
        let s = serde_json::to_string(&scalar).unwrap();
        let v = serde_json::to_string(&series).unwrap();
        assert_eq!(s, "3.5");
        assert_eq!(v, "[1.0,2.0]");
        assert_eq!(serde_json::from_str::<MetricValue>(&s).unwrap(), scalar);
        assert_eq!(serde_json::from_str::<MetricValue>(&v).unwrap(), series);
    }
}
