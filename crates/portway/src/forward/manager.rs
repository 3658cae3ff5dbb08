//! ForwardManager - lifecycle management for rule listeners.
//!
//! This module owns the mapping from rule id to its bound [`Listener`] and
//! guarantees at most one listener per rule.

use super::listener::{DrainReport, Listener, ListenerFailure};
use super::stats::StatsCollector;
use super::types::{Rule, RuleId};
use super::ForwardError;
use crate::config::EngineSettings;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Manages the listeners of running rules
pub struct ForwardManager {
    /// Bound listeners by rule id
    listeners: Mutex<HashMap<RuleId, Arc<Listener>>>,
    settings: EngineSettings,
    stats: Arc<StatsCollector>,
    /// Listener loop tasks report runtime failures here
    failures: mpsc::UnboundedSender<ListenerFailure>,
}

impl ForwardManager {
    pub fn new(
        settings: EngineSettings,
        stats: Arc<StatsCollector>,
        failures: mpsc::UnboundedSender<ListenerFailure>,
    ) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            settings,
            stats,
            failures,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[cfg(test)]
    pub(crate) fn failure_sender(&self) -> mpsc::UnboundedSender<ListenerFailure> {
        self.failures.clone()
    }

    /// Bind a listener for `rule`.
    ///
    /// Returns the existing listener if the rule is already bound. Fails
    /// with `DuplicateBinding` if another bound listener holds an
    /// overlapping tuple, and `BindError` if the OS refuses the bind.
    pub async fn bind(&self, rule: &Rule) -> Result<Arc<Listener>, ForwardError> {
        let tuple = rule.listen_tuple()?;
        {
            let listeners = self.listeners.lock();
            if let Some(existing) = listeners.get(&rule.id) {
                debug!(rule_id = rule.id, "Rule already bound, reusing listener");
                return Ok(Arc::clone(existing));
            }
            if let Some(holder) = listeners
                .values()
                .find(|l| l.tuple().overlaps(&tuple))
            {
                return Err(ForwardError::DuplicateBinding {
                    tuple: tuple.to_string(),
                    holder: holder.rule_id(),
                });
            }
        }

        let listener = Listener::bind(
            rule,
            self.settings,
            self.stats.register(rule.id),
            self.failures.clone(),
        )
        .await?;

        let raced = {
            let mut listeners = self.listeners.lock();
            match listeners.entry(rule.id) {
                Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&listener));
                    None
                }
            }
        };

        // Lost a race with a concurrent bind for the same rule
        if let Some(existing) = raced {
            listener.shutdown().await;
            return Ok(existing);
        }

        info!(rule_id = rule.id, "Bound listener on {}", listener.local_addr());
        Ok(listener)
    }

    /// Unbind the rule's listener, draining its relays.
    ///
    /// Returns `None` if the rule was not bound. A drain that had to
    /// force-close connections is logged, not returned as an error.
    pub async fn unbind(&self, id: RuleId) -> Option<DrainReport> {
        let listener = self.listeners.lock().remove(&id)?;
        let report = listener.shutdown().await;

        if report.forced > 0 {
            let e = ForwardError::DrainTimeout {
                id,
                forced: report.forced,
            };
            warn!(rule_id = id, "{}", e);
        }
        info!(
            rule_id = id,
            drained = report.drained,
            forced = report.forced,
            "Unbound listener on {}",
            listener.local_addr()
        );
        Some(report)
    }

    pub fn get(&self, id: RuleId) -> Option<Arc<Listener>> {
        self.listeners.lock().get(&id).cloned()
    }

    pub fn is_bound(&self, id: RuleId) -> bool {
        self.listeners.lock().contains_key(&id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Unbind every listener
    pub async fn shutdown_all(&self) -> Vec<(RuleId, DrainReport)> {
        let ids: Vec<RuleId> = self.listeners.lock().keys().copied().collect();
        let reports = join_all(ids.iter().map(|&id| self.unbind(id))).await;
        ids.into_iter()
            .zip(reports)
            .filter_map(|(id, report)| report.map(|r| (id, r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::forward::types::RuleConfig;
    use chrono::Utc;

    fn manager() -> ForwardManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        ForwardManager::new(
            EngineSettings::default(),
            Arc::new(StatsCollector::new()),
            tx,
        )
    }

    fn rule(id: RuleId, listen: &str) -> Rule {
        let config = RuleConfig::new(
            format!("rule-{id}"),
            Protocol::Tcp,
            listen.parse().unwrap(),
            "127.0.0.1",
            80,
        );
        Rule::from_config(id, config, Utc::now())
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let manager = manager();
        let rule = rule(1, "127.0.0.1:0");

        let first = manager.bind(&rule).await.unwrap();
        let second = manager.bind(&rule).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.listener_count(), 1);

        manager.unbind(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_unbind_is_idempotent() {
        let manager = manager();
        manager.bind(&rule(1, "127.0.0.1:0")).await.unwrap();

        assert!(manager.unbind(1).await.is_some());
        assert!(manager.unbind(1).await.is_none());
        assert!(!manager.is_bound(1));
    }

    #[tokio::test]
    async fn test_overlapping_tuple_is_rejected() {
        let port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let manager = manager();
        manager
            .bind(&rule(1, &format!("127.0.0.1:{port}")))
            .await
            .unwrap();

        let err = manager
            .bind(&rule(2, &format!("0.0.0.0:{port}")))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            ForwardError::DuplicateBinding {
                tuple: format!("tcp://0.0.0.0:{port}"),
                holder: 1,
            }
        );

        manager.shutdown_all().await;
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_os_is_final_arbiter() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let manager = manager();
        let err = manager
            .bind(&rule(1, &format!("127.0.0.1:{port}")))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "bind_error");
        assert!(!manager.is_bound(1));
    }
}
