//! Supervisor - the forwarding engine facade.
//!
//! Sequences RuleStore mutations, ForwardManager binds and StatsCollector
//! reads so each operation is atomic with respect to rule state. Lifecycle
//! operations on one rule are serialized by a per-rule async mutex;
//! different rules proceed concurrently.

use super::listener::ListenerFailure;
use super::manager::ForwardManager;
use super::stats::{AggregateStats, RuleStatsSnapshot, StatsCollector};
use super::store::RuleStore;
use super::types::{ListFilter, Rule, RuleConfig, RuleId, RuleState, RuleUpdate};
use super::ForwardError;
use crate::config::EngineSettings;
use crate::metrics;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub struct Supervisor {
    store: Arc<RuleStore>,
    stats: Arc<StatsCollector>,
    manager: ForwardManager,
    /// Per-rule lifecycle locks, held only for rules in the store
    locks: Mutex<HashMap<RuleId, Arc<AsyncMutex<()>>>>,
}

impl Supervisor {
    /// Build the engine and start watching for listener failures.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        store: Arc<RuleStore>,
        stats: Arc<StatsCollector>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            manager: ForwardManager::new(settings, Arc::clone(&stats), failures_tx),
            store,
            stats,
            locks: Mutex::new(HashMap::new()),
        });
        tokio::spawn(watch_failures(Arc::downgrade(&supervisor), failures_rx));
        supervisor
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn manager(&self) -> &ForwardManager {
        &self.manager
    }

    /// Serialize lifecycle work on one rule.
    ///
    /// Fails with `NotFound` without leaving a lock entry behind, also when
    /// the rule was deleted while this call waited for the lock.
    async fn lock_rule(&self, id: RuleId) -> Result<OwnedMutexGuard<()>, ForwardError> {
        self.store.get(id)?;
        let lock = Arc::clone(self.locks.lock().entry(id).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;

        if let Err(e) = self.store.get(id) {
            let mut locks = self.locks.lock();
            if locks.get(&id).is_some_and(|held| Arc::ptr_eq(held, &lock)) {
                locks.remove(&id);
            }
            return Err(e);
        }
        Ok(guard)
    }

    fn transition(
        &self,
        id: RuleId,
        to: RuleState,
        bound_port: Option<u16>,
    ) -> Result<Rule, ForwardError> {
        let rule = self.store.transition(id, to, bound_port)?;
        metrics::record_transition(to);
        Ok(rule)
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    pub fn create(&self, config: RuleConfig) -> Result<Rule, ForwardError> {
        let rule = self.store.create(config)?;
        self.stats.register(rule.id);
        info!(
            rule_id = rule.id,
            "Created rule '{}' {} -> {}",
            rule.name,
            rule.listen_tuple()?,
            rule.target()
        );
        Ok(rule)
    }

    pub fn get(&self, id: RuleId) -> Result<Rule, ForwardError> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &ListFilter) -> Vec<Rule> {
        self.store.list(filter)
    }

    /// Update a rule's configuration. Only allowed while Stopped or Error.
    pub async fn update(&self, id: RuleId, update: &RuleUpdate) -> Result<Rule, ForwardError> {
        let _guard = self.lock_rule(id).await?;
        let rule = self.store.update(id, update)?;
        info!(rule_id = id, "Updated rule '{}'", rule.name);
        Ok(rule)
    }

    /// Delete a rule and its statistics. Only allowed while Stopped or Error.
    pub async fn delete(&self, id: RuleId) -> Result<Rule, ForwardError> {
        let _guard = self.lock_rule(id).await?;
        let rule = self.store.delete(id)?;

        // A failed listener may still be registered
        self.manager.unbind(id).await;
        self.stats.remove(id);
        self.locks.lock().remove(&id);

        info!(rule_id = id, "Deleted rule '{}'", rule.name);
        Ok(rule)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start a Stopped rule.
    ///
    /// A no-op on a rule that is already Running or Starting. A bind
    /// failure moves the rule to Error and is returned to the caller.
    pub async fn start(&self, id: RuleId) -> Result<Rule, ForwardError> {
        let _guard = self.lock_rule(id).await?;

        let rule = self.store.get(id)?;
        match rule.state {
            RuleState::Running | RuleState::Starting => {
                debug!(rule_id = id, "Start requested for {} rule, ignoring", rule.state);
                return Ok(rule);
            }
            RuleState::Error | RuleState::Stopping => {
                return Err(ForwardError::InvalidState {
                    id,
                    state: rule.state,
                    operation: "start",
                });
            }
            RuleState::Stopped => {}
        }

        self.store.ensure_exclusive(id)?;
        let rule = self.transition(id, RuleState::Starting, None)?;

        match self.manager.bind(&rule).await {
            Ok(listener) => {
                let rule =
                    self.transition(id, RuleState::Running, Some(listener.local_addr().port()))?;
                info!(rule_id = id, "Rule '{}' is running", rule.name);
                Ok(rule)
            }
            Err(e) => {
                warn!(rule_id = id, "Failed to bind rule '{}': {}", rule.name, e);
                self.stats.record_error(id, e.to_string());
                self.transition(id, RuleState::Error, None)?;
                Err(e)
            }
        }
    }

    /// Stop a Running rule, draining its connections.
    ///
    /// A no-op on a Stopped rule. An Error rule is moved back to Stopped.
    pub async fn stop(&self, id: RuleId) -> Result<Rule, ForwardError> {
        let _guard = self.lock_rule(id).await?;

        let rule = self.store.get(id)?;
        match rule.state {
            RuleState::Stopped => Ok(rule),
            RuleState::Error => {
                self.manager.unbind(id).await;
                let rule = self.transition(id, RuleState::Stopped, None)?;
                info!(rule_id = id, "Cleared error on rule '{}'", rule.name);
                Ok(rule)
            }
            RuleState::Running => {
                self.transition(id, RuleState::Stopping, None)?;
                self.manager.unbind(id).await;
                let rule = self.transition(id, RuleState::Stopped, None)?;
                info!(rule_id = id, "Rule '{}' stopped", rule.name);
                Ok(rule)
            }
            RuleState::Starting | RuleState::Stopping => Err(ForwardError::InvalidState {
                id,
                state: rule.state,
                operation: "stop",
            }),
        }
    }

    /// Handle a listener that died while Running
    pub(crate) async fn handle_listener_failure(&self, failure: ListenerFailure) {
        let id = failure.rule_id;
        let Ok(_guard) = self.lock_rule(id).await else {
            debug!(rule_id = id, "Ignoring failure for a deleted rule");
            return;
        };

        // The failure may belong to a listener that was already replaced
        let current = self
            .manager
            .get(id)
            .is_some_and(|listener| listener.id() == failure.listener_id);
        if !current {
            debug!(rule_id = id, "Ignoring failure from a stale listener");
            return;
        }

        self.manager.unbind(id).await;
        match self.transition(id, RuleState::Error, None) {
            Ok(rule) => warn!(
                rule_id = id,
                "Rule '{}' moved to error: {}", rule.name, failure.reason
            ),
            Err(e) => debug!(rule_id = id, "Listener failure not applied: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Consistent snapshot of one rule's counters
    pub fn get_stats(&self, id: RuleId) -> Result<RuleStatsSnapshot, ForwardError> {
        self.store.get(id)?;
        self.stats.snapshot(id)
    }

    /// Zero a rule's cumulative counters
    pub fn reset_stats(&self, id: RuleId) -> Result<RuleStatsSnapshot, ForwardError> {
        self.store.get(id)?;
        let snapshot = self.stats.reset(id)?;
        info!(rule_id = id, "Reset statistics");
        Ok(snapshot)
    }

    pub fn aggregate_stats(&self) -> AggregateStats {
        let rules = self.store.list(&ListFilter::default());
        self.stats.aggregate(&rules)
    }

    /// Stop every rule that holds a listener
    pub async fn shutdown(&self) {
        let active: Vec<RuleId> = self
            .store
            .list(&ListFilter::default())
            .into_iter()
            .filter(|rule| !rule.state.is_idle() || self.manager.is_bound(rule.id))
            .map(|rule| rule.id)
            .collect();

        info!("Stopping {} rule(s)", active.len());
        for (id, result) in active
            .iter()
            .zip(join_all(active.iter().map(|&id| self.stop(id))).await)
        {
            if let Err(e) = result {
                warn!(rule_id = id, "Failed to stop rule during shutdown: {}", e);
            }
        }
        self.manager.shutdown_all().await;
    }
}

async fn watch_failures(
    supervisor: Weak<Supervisor>,
    mut failures: mpsc::UnboundedReceiver<ListenerFailure>,
) {
    while let Some(failure) = failures.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.handle_listener_failure(failure).await;
    }
}
