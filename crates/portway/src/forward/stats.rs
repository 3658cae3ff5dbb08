//! StatsCollector - per-rule traffic counters and aggregate views.
//!
//! Relays update counters with atomic increments. Each rule also owns a
//! gate: writers hold it shared around their increments, snapshots hold it
//! exclusively, so a snapshot never sees half of a multi-counter update.

use super::types::{Rule, RuleId, RuleState};
use super::ForwardError;
use crate::metrics;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live counters for one rule
#[derive(Debug)]
pub struct RuleCounters {
    /// Metric label for this rule
    label: String,
    gate: RwLock<()>,
    active: AtomicU64,
    total_connections: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RuleCounters {
    fn new(rule_id: RuleId) -> Self {
        Self {
            label: rule_id.to_string(),
            gate: RwLock::new(()),
            active: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Record a new Connection. The guard records its end when dropped,
    /// including when the owning task is aborted.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        {
            let _gate = self.gate.read();
            self.active.fetch_add(1, Ordering::Relaxed);
            self.total_connections.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_connection_opened(&self.label);
        ConnectionGuard {
            counters: Arc::clone(self),
        }
    }

    fn connection_closed(&self) {
        {
            let _gate = self.gate.read();
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
        metrics::record_connection_closed(&self.label);
    }

    /// Bytes relayed from the inbound client to the target
    pub fn add_bytes_in(&self, n: u64) {
        {
            let _gate = self.gate.read();
            self.bytes_in.fetch_add(n, Ordering::Relaxed);
        }
        metrics::record_bytes(&self.label, "in", n);
    }

    /// Bytes relayed from the target back to the client
    pub fn add_bytes_out(&self, n: u64) {
        {
            let _gate = self.gate.read();
            self.bytes_out.fetch_add(n, Ordering::Relaxed);
        }
        metrics::record_bytes(&self.label, "out", n);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let _gate = self.gate.read();
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(message.into());
        metrics::record_error(&self.label);
    }

    /// Consistent point-in-time copy of all counters
    pub fn snapshot(&self) -> RuleStatsSnapshot {
        let _gate = self.gate.write();
        RuleStatsSnapshot {
            active_connections: self.active.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_bytes_in: self.bytes_in.load(Ordering::Relaxed),
            total_bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Zero the cumulative counters. Active connections are live state and
    /// are left untouched.
    pub fn reset(&self) -> RuleStatsSnapshot {
        let _gate = self.gate.write();
        self.total_connections.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self.last_error.lock() = None;
        RuleStatsSnapshot {
            active_connections: self.active.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

/// Marks one active Connection; decrements `activeConnections` on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    counters: Arc<RuleCounters>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counters.connection_closed();
    }
}

/// Snapshot of one rule's statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

/// Rule counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleCounts {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
}

impl RuleCounts {
    /// Count rules by state. Transitional states only count toward `total`.
    pub fn tally<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Self {
        let mut counts = Self::default();
        for rule in rules {
            counts.total += 1;
            match rule.state {
                RuleState::Running => counts.running += 1,
                RuleState::Stopped => counts.stopped += 1,
                RuleState::Error => counts.error += 1,
                RuleState::Starting | RuleState::Stopping => {}
            }
        }
        counts
    }
}

/// Counters summed over every rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsTotals {
    pub active_connections: u64,
    pub total_connections: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub errors: u64,
}

impl StatsTotals {
    fn add(&mut self, snapshot: &RuleStatsSnapshot) {
        self.active_connections += snapshot.active_connections;
        self.total_connections += snapshot.total_connections;
        self.total_bytes_in += snapshot.total_bytes_in;
        self.total_bytes_out += snapshot.total_bytes_out;
        self.errors += snapshot.errors;
    }
}

/// One rule's entry in the aggregate view
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatsEntry {
    pub id: RuleId,
    pub name: String,
    pub state: RuleState,
    pub stats: RuleStatsSnapshot,
}

/// Global plus per-rule statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub rules: RuleCounts,
    pub totals: StatsTotals,
    pub per_rule: Vec<RuleStatsEntry>,
}

/// Registry of per-rule counters
pub struct StatsCollector {
    rules: RwLock<HashMap<RuleId, Arc<RuleCounters>>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Counters for a rule, created on first use
    pub fn register(&self, id: RuleId) -> Arc<RuleCounters> {
        if let Some(counters) = self.rules.read().get(&id) {
            return Arc::clone(counters);
        }
        Arc::clone(
            self.rules
                .write()
                .entry(id)
                .or_insert_with(|| Arc::new(RuleCounters::new(id))),
        )
    }

    pub fn counters(&self, id: RuleId) -> Option<Arc<RuleCounters>> {
        self.rules.read().get(&id).cloned()
    }

    pub fn snapshot(&self, id: RuleId) -> Result<RuleStatsSnapshot, ForwardError> {
        self.counters(id)
            .map(|c| c.snapshot())
            .ok_or(ForwardError::NotFound(id))
    }

    pub fn reset(&self, id: RuleId) -> Result<RuleStatsSnapshot, ForwardError> {
        self.counters(id)
            .map(|c| c.reset())
            .ok_or(ForwardError::NotFound(id))
    }

    pub fn record_error(&self, id: RuleId, message: impl Into<String>) {
        self.register(id).record_error(message);
    }

    /// Drop a rule's counters (rule deletion)
    pub fn remove(&self, id: RuleId) {
        if self.rules.write().remove(&id).is_some() {
            metrics::remove_rule(&id.to_string());
        }
    }

    /// Build the aggregate view over the given rules
    pub fn aggregate(&self, rules: &[Rule]) -> AggregateStats {
        let mut totals = StatsTotals::default();
        let per_rule = rules
            .iter()
            .map(|rule| {
                let stats = self
                    .counters(rule.id)
                    .map(|c| c.snapshot())
                    .unwrap_or_default();
                totals.add(&stats);
                RuleStatsEntry {
                    id: rule.id,
                    name: rule.name.clone(),
                    state: rule.state,
                    stats,
                }
            })
            .collect();

        AggregateStats {
            rules: RuleCounts::tally(rules),
            totals,
            per_rule,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
