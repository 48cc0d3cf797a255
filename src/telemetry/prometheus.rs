//! DCGM Prometheus text-format parsing.
//!
//! Input is `text/plain; version=0.0.4` exposition. Labels `gpu`, `UUID`,
//! `pci_bus_id`, `device`, `modelName`, and `Hostname` are case-sensitive.
//! Recognized gauges map onto `TelemetryMetrics` fields with fixed scaling:
//! energy mJ -> MJ, framebuffer MiB -> GB, everything else unchanged.

use std::collections::BTreeMap;

use crate::models::telemetry::{TelemetryMetrics, TelemetryRecord};

const MJ_TO_MEGAJOULES: f64 = 1e-9;
const MIB_TO_GB: f64 = 1.048576e-3;

/// `(metric_name, scale)` to a setter on `TelemetryMetrics`.
fn apply_metric(metrics: &mut TelemetryMetrics, name: &str, value: f64) -> bool {
    let slot = match name {
        "DCGM_FI_DEV_POWER_USAGE" => &mut metrics.gpu_power_usage,
        "DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION" => {
            metrics.energy_consumption = sanitize(value * MJ_TO_MEGAJOULES);
            return true;
        }
        "DCGM_FI_DEV_GPU_UTIL" => &mut metrics.gpu_utilization,
        "DCGM_FI_DEV_FB_USED" => {
            metrics.gpu_memory_used = sanitize(value * MIB_TO_GB);
            return true;
        }
        "DCGM_FI_DEV_FB_FREE" => {
            metrics.gpu_memory_free = sanitize(value * MIB_TO_GB);
            return true;
        }
        "DCGM_FI_DEV_FB_TOTAL" => {
            metrics.gpu_memory_total = sanitize(value * MIB_TO_GB);
            return true;
        }
        "DCGM_FI_DEV_SM_CLOCK" => &mut metrics.sm_clock_frequency,
        "DCGM_FI_DEV_MEM_CLOCK" => &mut metrics.memory_clock_frequency,
        "DCGM_FI_DEV_GPU_TEMP" => &mut metrics.gpu_temperature,
        "DCGM_FI_DEV_MEMORY_TEMP" => &mut metrics.memory_temperature,
        "DCGM_FI_DEV_MEM_COPY_UTIL" => &mut metrics.memory_copy_utilization,
        "DCGM_FI_DEV_XID_ERRORS" => &mut metrics.xid_errors,
        "DCGM_FI_DEV_POWER_VIOLATION" => &mut metrics.power_violation,
        "DCGM_FI_DEV_THERMAL_VIOLATION" => &mut metrics.thermal_violation,
        "DCGM_FI_DEV_POWER_MGMT_LIMIT" => &mut metrics.power_management_limit,
        _ => return false,
    };
    *slot = sanitize(value);
    true
}

/// NaN and infinities are dropped rather than stored.
fn sanitize(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Parse one exposition document into per-GPU records, keyed by GPU UUID.
pub fn parse_exposition(text: &str, dcgm_url: &str, timestamp_ns: u64) -> Vec<TelemetryRecord> {
    let mut by_uuid: BTreeMap<String, TelemetryRecord> = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, labels, value)) = split_sample(line) else {
            continue;
        };
        let Some(value) = value.parse::<f64>().ok() else {
            continue;
        };

        let Some(uuid) = labels.get("UUID") else {
            continue;
        };
        // Rows with a non-numeric gpu index are rejected outright.
        let Some(gpu_index) = labels.get("gpu").and_then(|g| g.parse::<u32>().ok()) else {
            continue;
        };

        let record = by_uuid
            .entry(uuid.clone())
            .or_insert_with(|| TelemetryRecord {
                timestamp_ns,
                dcgm_url: dcgm_url.to_string(),
                gpu_index,
                gpu_uuid: uuid.clone(),
                gpu_model_name: labels.get("modelName").cloned().unwrap_or_default(),
                pci_bus_id: labels.get("pci_bus_id").cloned(),
                device: labels.get("device").cloned(),
                hostname: labels.get("Hostname").cloned(),
                telemetry_data: TelemetryMetrics::default(),
            });
        apply_metric(&mut record.telemetry_data, name, value);
    }

    by_uuid.into_values().collect()
}

/// Split `name{labels} value` into its parts.
fn split_sample(line: &str) -> Option<(&str, BTreeMap<String, String>, &str)> {
    let brace_open = line.find('{')?;
    let brace_close = line.rfind('}')?;
    if brace_close < brace_open {
        return None;
    }
    let name = &line[..brace_open];
    let labels = parse_labels(&line[brace_open + 1..brace_close]);
    let value = line[brace_close + 1..].trim();
    if value.is_empty() {
        return None;
    }
    Some((name, labels, value.split_whitespace().next()?))
}

/// Parse `key="value",key="value"` with quote awareness.
fn parse_labels(text: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = &rest[eq + 1..];

        let Some(quote_start) = rest.find('"') else { break };
        let mut value = String::new();
        let mut chars = rest[quote_start + 1..].char_indices();
        let mut consumed = quote_start + 1;
        let mut escaped = false;
        for (offset, c) in &mut chars {
            consumed = quote_start + 1 + offset + c.len_utf8();
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                break;
            } else {
                value.push(c);
            }
        }
        labels.insert(key, value);
        rest = &rest[consumed..];
    }
    labels
}
