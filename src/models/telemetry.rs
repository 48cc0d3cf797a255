//! GPU telemetry records and hierarchical time-series storage.
//!
//! Storage is keyed `dcgm_url -> gpu_uuid -> snapshots`; the UUID is the
//! primary GPU identity, the index is display ordering only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AiperfError, Result};
use crate::models::metric::MetricResult;

/// GPU metrics collected at a single instant. All optional: DCGM exporters
/// expose different field sets, and invalid values are filtered to `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    /// Current power draw in W.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_power_usage: Option<f64>,
    /// Cumulative energy consumption in MJ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_consumption: Option<f64>,
    /// GPU utilization percentage (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_utilization: Option<f64>,
    /// Framebuffer memory used in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_used: Option<f64>,
    /// Framebuffer memory free in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_free: Option<f64>,
    /// Total framebuffer memory in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_total: Option<f64>,
    /// SM clock frequency in MHz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sm_clock_frequency: Option<f64>,
    /// Memory clock frequency in MHz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_clock_frequency: Option<f64>,
    /// GPU temperature in C.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_temperature: Option<f64>,
    /// Memory temperature in C.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_temperature: Option<f64>,
    /// Memory copy utilization percentage (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_copy_utilization: Option<f64>,
    /// Value of the last XID error encountered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid_errors: Option<f64>,
    /// Throttling duration due to power constraints in us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_violation: Option<f64>,
    /// Throttling duration due to thermal constraints in us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thermal_violation: Option<f64>,
    /// Power management limit in W.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_management_limit: Option<f64>,
}

/// Metric names with display headers and units, in report order.
pub const TELEMETRY_METRIC_FIELDS: &[(&str, &str, &str)] = &[
    ("gpu_power_usage", "GPU Power Usage", "W"),
    ("energy_consumption", "Energy Consumption", "MJ"),
    ("gpu_utilization", "GPU Utilization", "%"),
    ("gpu_memory_used", "GPU Memory Used", "GB"),
    ("gpu_memory_free", "GPU Memory Free", "GB"),
    ("gpu_memory_total", "GPU Memory Total", "GB"),
    ("sm_clock_frequency", "SM Clock Frequency", "MHz"),
    ("memory_clock_frequency", "Memory Clock Frequency", "MHz"),
    ("gpu_temperature", "GPU Temperature", "C"),
    ("memory_temperature", "Memory Temperature", "C"),
    ("memory_copy_utilization", "Memory Copy Utilization", "%"),
    ("xid_errors", "XID Errors", "count"),
    ("power_violation", "Power Violation", "us"),
    ("thermal_violation", "Thermal Violation", "us"),
    ("power_management_limit", "Power Management Limit", "W"),
];

impl TelemetryMetrics {
    /// Metric values by field name, `None`s omitted.
    pub fn named_values(&self) -> BTreeMap<String, f64> {
        let pairs = [
            ("gpu_power_usage", self.gpu_power_usage),
            ("energy_consumption", self.energy_consumption),
            ("gpu_utilization", self.gpu_utilization),
            ("gpu_memory_used", self.gpu_memory_used),
            ("gpu_memory_free", self.gpu_memory_free),
            ("gpu_memory_total", self.gpu_memory_total),
            ("sm_clock_frequency", self.sm_clock_frequency),
            ("memory_clock_frequency", self.memory_clock_frequency),
            ("gpu_temperature", self.gpu_temperature),
            ("memory_temperature", self.memory_temperature),
            ("memory_copy_utilization", self.memory_copy_utilization),
            ("xid_errors", self.xid_errors),
            ("power_violation", self.power_violation),
            ("thermal_violation", self.thermal_violation),
            ("power_management_limit", self.power_management_limit),
        ];
        pairs
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
            .collect()
    }
}

/// One GPU snapshot at one instant, from one DCGM endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Wall-clock collection timestamp.
    pub timestamp_ns: u64,
    pub dcgm_url: String,
    /// Display ordering only; `gpu_uuid` is the identity.
    pub gpu_index: u32,
    pub gpu_uuid: String,
    pub gpu_model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_bus_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub telemetry_data: TelemetryMetrics,
}

/// Static per-GPU metadata, stored once and referenced by all snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuMetadata {
    pub gpu_index: u32,
    pub gpu_uuid: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_bus_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// All metric values for one GPU at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuTelemetrySnapshot {
    pub timestamp_ns: u64,
    pub metrics: BTreeMap<String, f64>,
}

/// Metadata plus chronological snapshots for one GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuTelemetryData {
    pub metadata: GpuMetadata,
    pub snapshots: Vec<GpuTelemetrySnapshot>,
}

impl GpuTelemetryData {
    /// `(value, timestamp_ns)` pairs for one metric across all snapshots.
    pub fn get_metric_values(&self, metric_name: &str) -> Vec<(f64, u64)> {
        self.snapshots
            .iter()
            .filter_map(|s| s.metrics.get(metric_name).map(|v| (*v, s.timestamp_ns)))
            .collect()
    }

    pub fn to_metric_result(
        &self,
        metric_name: &str,
        tag: &str,
        header: &str,
        unit: &str,
    ) -> Result<MetricResult> {
        let points = self.get_metric_values(metric_name);
        let values: Vec<f64> = points.iter().map(|(v, _)| *v).collect();
        MetricResult::from_values(tag, header, unit, &values).ok_or_else(|| {
            AiperfError::NoMetricValue(format!(
                "no telemetry data available for metric '{metric_name}'"
            ))
        })
    }
}

/// `dcgm_url -> gpu_uuid -> time series`, owned by one results processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryHierarchy {
    pub dcgm_endpoints: BTreeMap<String, BTreeMap<String, GpuTelemetryData>>,
}

impl TelemetryHierarchy {
    /// Insert one record. Metadata insertion is idempotent over
    /// `(dcgm_url, gpu_uuid)`; every call appends one snapshot.
    pub fn add_record(&mut self, record: &TelemetryRecord) {
        let gpu_data = self
            .dcgm_endpoints
            .entry(record.dcgm_url.clone())
            .or_default()
            .entry(record.gpu_uuid.clone())
            .or_insert_with(|| GpuTelemetryData {
                metadata: GpuMetadata {
                    gpu_index: record.gpu_index,
                    gpu_uuid: record.gpu_uuid.clone(),
                    model_name: record.gpu_model_name.clone(),
                    pci_bus_id: record.pci_bus_id.clone(),
                    device: record.device.clone(),
                    hostname: record.hostname.clone(),
                },
                snapshots: Vec::new(),
            });

        gpu_data.snapshots.push(GpuTelemetrySnapshot {
            timestamp_ns: record.timestamp_ns,
            metrics: record.telemetry_data.named_values(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, uuid: &str, ts: u64, power: f64) -> TelemetryRecord {
        TelemetryRecord {
            timestamp_ns: ts,
            dcgm_url: url.to_string(),
            gpu_index: 0,
            gpu_uuid: uuid.to_string(),
            gpu_model_name: "NVIDIA H100".to_string(),
            pci_bus_id: None,
            device: None,
            hostname: None,
            telemetry_data: TelemetryMetrics {
                gpu_power_usage: Some(power),
                ..Default::default()
            },
        }
    }

    #[test]
    fn add_record_is_idempotent_over_metadata() {
        let mut hierarchy = TelemetryHierarchy::default();
        hierarchy.add_record(&record("http://n1:9401/metrics", "GPU-abc", 1, 100.0));
        hierarchy.add_record(&record("http://n1:9401/metrics", "GPU-abc", 2, 110.0));

        let endpoints = &hierarchy.dcgm_endpoints;
        assert_eq!(endpoints.len(), 1);
        let gpus = &endpoints["http://n1:9401/metrics"];
        assert_eq!(gpus.len(), 1);
        let data = &gpus["GPU-abc"];
        assert_eq!(data.metadata.model_name, "NVIDIA H100");
        assert_eq!(data.snapshots.len(), 2);
    }

    #[test]
    fn metric_values_pair_with_timestamps() {
        let mut hierarchy = TelemetryHierarchy::default();
        hierarchy.add_record(&record("u", "g", 10, 100.0));
        hierarchy.add_record(&record("u", "g", 20, 120.0));
        let data = &hierarchy.dcgm_endpoints["u"]["g"];
        assert_eq!(
            data.get_metric_values("gpu_power_usage"),
            vec![(100.0, 10), (120.0, 20)]
        );
        assert!(data.get_metric_values("gpu_temperature").is_empty());
    }

    #[test]
    fn missing_metric_yields_no_metric_value() {
        let mut hierarchy = TelemetryHierarchy::default();
        hierarchy.add_record(&record("u", "g", 10, 100.0));
        let data = &hierarchy.dcgm_endpoints["u"]["g"];
        let err = data
            .to_metric_result("gpu_temperature", "t", "h", "C")
            .unwrap_err();
        assert!(err.is_no_metric_value());
    }
}
