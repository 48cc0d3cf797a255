//! Service registry: who exists, what state they're in, and whether their
//! heartbeats are still arriving.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::messages::{HeartbeatMessage, RegistrationMessage, ServiceState, ServiceType, StatusMessage};

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRegistration {
    pub service_id: String,
    pub service_type: ServiceType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: ServiceState,
    /// Heartbeats stopped arriving past the threshold.
    pub stale: bool,
}

/// Lives inside the controller. Fed from registration, heartbeat, and
/// status subscriptions.
pub struct ServiceRegistry {
    entries: DashMap<String, ServiceRegistration>,
    stale_threshold: chrono::Duration,
}

impl ServiceRegistry {
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            stale_threshold: chrono::Duration::from_std(stale_threshold)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn observe_registration(&self, message: &RegistrationMessage) {
        let now = Utc::now();
        self.entries
            .entry(message.service_id.clone())
            .and_modify(|entry| {
                entry.state = message.state;
                entry.last_seen = now;
                entry.stale = false;
            })
            .or_insert_with(|| ServiceRegistration {
                service_id: message.service_id.clone(),
                service_type: message.service_type,
                first_seen: now,
                last_seen: now,
                state: message.state,
                stale: false,
            });
    }

    /// Heartbeats upsert: a service whose registration message was lost on
    /// a still-settling channel is picked up by its first heartbeat.
    pub fn observe_heartbeat(&self, message: &HeartbeatMessage) {
        let now = Utc::now();
        self.entries
            .entry(message.service_id.clone())
            .and_modify(|entry| {
                entry.last_seen = now;
                entry.state = message.state;
                entry.stale = false;
            })
            .or_insert_with(|| ServiceRegistration {
                service_id: message.service_id.clone(),
                service_type: message.service_type,
                first_seen: now,
                last_seen: now,
                state: message.state,
                stale: false,
            });
    }

    pub fn observe_status(&self, message: &StatusMessage) {
        if let Some(mut entry) = self.entries.get_mut(&message.service_id) {
            entry.last_seen = Utc::now();
            entry.state = message.state;
        }
    }

    /// Mark services whose heartbeats are overdue. Returns the ids newly
    /// marked stale.
    pub fn sweep_stale(&self) -> Vec<String> {
        let now = Utc::now();
        let mut newly_stale = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if !entry.stale
                && entry.state == ServiceState::Running
                && now - entry.last_seen > self.stale_threshold
            {
                entry.stale = true;
                newly_stale.push(entry.service_id.clone());
            }
        }
        newly_stale
    }

    pub fn services(&self) -> Vec<ServiceRegistration> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    pub fn running_counts(&self) -> HashMap<ServiceType, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.iter() {
            if entry.state == ServiceState::Running {
                *counts.entry(entry.service_type).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Whether every expected `(service_type, count)` has registered and
    /// reached RUNNING.
    pub fn all_running(&self, expected: &HashMap<ServiceType, usize>) -> bool {
        let counts = self.running_counts();
        expected
            .iter()
            .all(|(ty, want)| counts.get(ty).copied().unwrap_or(0) >= *want)
    }

    /// Missing `(service_type, shortfall)` pairs, for timeout diagnostics.
    pub fn missing(&self, expected: &HashMap<ServiceType, usize>) -> Vec<String> {
        let counts = self.running_counts();
        expected
            .iter()
            .filter_map(|(ty, want)| {
                let have = counts.get(ty).copied().unwrap_or(0);
                (have < *want).then(|| format!("{ty} ({have}/{want})"))
            })
            .collect()
    }

    /// Whether every registered service has reported STOPPED.
    pub fn all_stopped(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.state == ServiceState::Stopped)
    }
}
