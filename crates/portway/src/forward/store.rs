//! RuleStore - authoritative in-memory registry of forwarding rules.
//!
//! Every mutation happens under a single write lock, so readers only ever
//! observe whole rules. The store is also the only writer of `Rule::state`:
//! callers request edges through [`RuleStore::transition`] and the store
//! rejects anything the state machine does not allow.

use super::stats::RuleCounts;
use super::types::{
    ForwardError, ListFilter, ListenTuple, Rule, RuleConfig, RuleId, RuleState, RuleUpdate,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory rule registry keyed by id
pub struct RuleStore {
    rules: RwLock<BTreeMap<RuleId, Rule>>,
    /// Next id to hand out; ids are never reused
    next_id: AtomicU64,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a rule in state Stopped
    pub fn create(&self, config: RuleConfig) -> Result<Rule, ForwardError> {
        let config = config.normalize()?;
        let tuple = config.listen_tuple()?;

        let mut rules = self.rules.write();
        Self::check_exclusive(&rules, &tuple, None)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rule = Rule::from_config(id, config, Utc::now());
        rules.insert(id, rule.clone());
        Ok(rule)
    }

    pub fn get(&self, id: RuleId) -> Result<Rule, ForwardError> {
        self.rules
            .read()
            .get(&id)
            .cloned()
            .ok_or(ForwardError::NotFound(id))
    }

    /// Rules matching `filter`, ordered by id
    pub fn list(&self, filter: &ListFilter) -> Vec<Rule> {
        self.rules
            .read()
            .values()
            .filter(|rule| filter.matches(rule))
            .cloned()
            .collect()
    }

    /// Apply a partial update. Only Stopped or Error rules can be edited.
    pub fn update(&self, id: RuleId, update: &RuleUpdate) -> Result<Rule, ForwardError> {
        let mut rules = self.rules.write();
        let current = rules.get(&id).ok_or(ForwardError::NotFound(id))?;
        if !current.state.is_idle() {
            return Err(ForwardError::InvalidState {
                id,
                state: current.state,
                operation: "update",
            });
        }

        let config = update.apply_to(&current.config()).normalize()?;
        let tuple = config.listen_tuple()?;
        Self::check_exclusive(&rules, &tuple, Some(id))?;

        let rule = rules.get_mut(&id).ok_or(ForwardError::NotFound(id))?;
        rule.apply_config(config, Utc::now());
        Ok(rule.clone())
    }

    /// Remove a rule. Only Stopped or Error rules can be deleted.
    pub fn delete(&self, id: RuleId) -> Result<Rule, ForwardError> {
        let mut rules = self.rules.write();
        let current = rules.get(&id).ok_or(ForwardError::NotFound(id))?;
        if !current.state.is_idle() {
            return Err(ForwardError::InvalidState {
                id,
                state: current.state,
                operation: "delete",
            });
        }
        rules.remove(&id).ok_or(ForwardError::NotFound(id))
    }

    /// Move a rule along one edge of the state machine.
    ///
    /// `bound_port` is recorded when entering Running and cleared on every
    /// other transition.
    pub fn transition(
        &self,
        id: RuleId,
        to: RuleState,
        bound_port: Option<u16>,
    ) -> Result<Rule, ForwardError> {
        let mut rules = self.rules.write();
        let rule = rules.get_mut(&id).ok_or(ForwardError::NotFound(id))?;
        if !rule.state.can_transition_to(to) {
            return Err(ForwardError::InvalidState {
                id,
                state: rule.state,
                operation: transition_verb(to),
            });
        }
        rule.state = to;
        rule.bound_port = if to == RuleState::Running {
            bound_port
        } else {
            None
        };
        rule.updated_at = Utc::now();
        Ok(rule.clone())
    }

    /// Check that no other rule claims an overlapping listen tuple
    pub fn ensure_exclusive(&self, id: RuleId) -> Result<(), ForwardError> {
        let rules = self.rules.read();
        let rule = rules.get(&id).ok_or(ForwardError::NotFound(id))?;
        let tuple = rule.listen_tuple()?;
        Self::check_exclusive(&rules, &tuple, Some(id))
    }

    pub fn count_by_state(&self) -> RuleCounts {
        RuleCounts::tally(self.rules.read().values())
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    fn check_exclusive(
        rules: &BTreeMap<RuleId, Rule>,
        tuple: &ListenTuple,
        except: Option<RuleId>,
    ) -> Result<(), ForwardError> {
        for rule in rules.values() {
            if Some(rule.id) == except {
                continue;
            }
            if let Ok(other) = rule.listen_tuple() {
                if other.overlaps(tuple) {
                    return Err(ForwardError::DuplicateBinding {
                        tuple: tuple.to_string(),
                        holder: rule.id,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

fn transition_verb(to: RuleState) -> &'static str {
    match to {
        RuleState::Starting => "start",
        RuleState::Running => "mark running",
        RuleState::Stopping => "stop",
        RuleState::Stopped => "mark stopped",
        RuleState::Error => "mark failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn config(name: &str, listen_port: u16) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            protocol: Protocol::Tcp,
            listen_address: "0.0.0.0".to_string(),
            listen_port,
            target_address: "127.0.0.1".to_string(),
            target_port: 8080,
            remark: String::new(),
        }
    }

    #[test]
    fn test_create_then_get_returns_equal_rule() {
        let store = RuleStore::new();
        let created = store.create(config("web", 9000)).unwrap();
        assert_eq!(created.state, RuleState::Stopped);
        assert_eq!(store.get(created.id).unwrap(), created);
    }

    #[test]
    fn test_create_rejects_duplicate_binding() {
        let store = RuleStore::new();
        let first = store.create(config("a", 9000)).unwrap();

        let mut clash = config("b", 9000);
        clash.listen_address = "127.0.0.1".to_string();
        match store.create(clash) {
            Err(ForwardError::DuplicateBinding { holder, .. }) => assert_eq!(holder, first.id),
            other => panic!("expected DuplicateBinding, got {other:?}"),
        }

        // Same port on the other protocol is a different tuple
        let mut udp = config("c", 9000);
        udp.protocol = Protocol::Udp;
        assert!(store.create(udp).is_ok());
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let store = RuleStore::new();
        let mut bad = config("bad", 9000);
        bad.listen_address = "nope".to_string();
        assert!(matches!(
            store.create(bad),
            Err(ForwardError::InvalidConfig(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let store = RuleStore::new();
        let first = store.create(config("a", 9000)).unwrap();
        store.delete(first.id).unwrap();
        let second = store.create(config("a", 9000)).unwrap();
        assert!(second.id > first.id);
        assert_eq!(store.get(first.id), Err(ForwardError::NotFound(first.id)));
    }

    #[test]
    fn test_update_only_when_idle() {
        let store = RuleStore::new();
        let rule = store.create(config("a", 9000)).unwrap();
        let update = RuleUpdate {
            name: Some("renamed".to_string()),
            ..Default::default()
        };

        let updated = store.update(rule.id, &update).unwrap();
        assert_eq!(updated.name, "renamed");
        assert!(updated.updated_at >= rule.updated_at);

        store.transition(rule.id, RuleState::Starting, None).unwrap();
        assert!(matches!(
            store.update(rule.id, &update),
            Err(ForwardError::InvalidState {
                state: RuleState::Starting,
                ..
            })
        ));

        // Error is editable and stays Error
        store.transition(rule.id, RuleState::Error, None).unwrap();
        let updated = store.update(rule.id, &update).unwrap();
        assert_eq!(updated.state, RuleState::Error);
    }

    #[test]
    fn test_update_checks_exclusivity_against_others_only() {
        let store = RuleStore::new();
        let a = store.create(config("a", 9000)).unwrap();
        store.create(config("b", 9001)).unwrap();

        // Re-saving its own tuple is fine
        let same = RuleUpdate {
            listen_port: Some(9000),
            ..Default::default()
        };
        assert!(store.update(a.id, &same).is_ok());

        let clash = RuleUpdate {
            listen_port: Some(9001),
            ..Default::default()
        };
        assert!(matches!(
            store.update(a.id, &clash),
            Err(ForwardError::DuplicateBinding { .. })
        ));
    }

    #[test]
    fn test_delete_requires_idle_state() {
        let store = RuleStore::new();
        let rule = store.create(config("a", 9000)).unwrap();
        store.transition(rule.id, RuleState::Starting, None).unwrap();
        store.transition(rule.id, RuleState::Running, Some(9000)).unwrap();

        assert!(matches!(
            store.delete(rule.id),
            Err(ForwardError::InvalidState {
                operation: "delete",
                ..
            })
        ));

        store.transition(rule.id, RuleState::Stopping, None).unwrap();
        store.transition(rule.id, RuleState::Stopped, None).unwrap();
        store.delete(rule.id).unwrap();
        assert_eq!(store.get(rule.id), Err(ForwardError::NotFound(rule.id)));
    }

    #[test]
    fn test_transition_rejects_illegal_edges() {
        let store = RuleStore::new();
        let rule = store.create(config("a", 9000)).unwrap();
        assert!(matches!(
            store.transition(rule.id, RuleState::Running, Some(9000)),
            Err(ForwardError::InvalidState { .. })
        ));
        assert_eq!(store.get(rule.id).unwrap().state, RuleState::Stopped);
    }

    #[test]
    fn test_transition_tracks_bound_port() {
        let store = RuleStore::new();
        let rule = store.create(config("a", 0)).unwrap();
        store.transition(rule.id, RuleState::Starting, None).unwrap();
        let running = store.transition(rule.id, RuleState::Running, Some(41234)).unwrap();
        assert_eq!(running.bound_port, Some(41234));
        let stopping = store.transition(rule.id, RuleState::Stopping, Some(1)).unwrap();
        assert_eq!(stopping.bound_port, None);
    }

    #[test]
    fn test_list_filters_and_orders_by_id() {
        let store = RuleStore::new();
        let a = store.create(config("alpha", 9000)).unwrap();
        let b = store.create(config("beta", 9001)).unwrap();
        let c = store.create(config("alphabet", 9002)).unwrap();
        store.transition(b.id, RuleState::Starting, None).unwrap();

        let all = store.list(&ListFilter::default());
        let ids: Vec<RuleId> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);

        let alpha = store.list(&ListFilter {
            keyword: Some("ALPHA".to_string()),
            ..Default::default()
        });
        assert_eq!(alpha.len(), 2);

        let starting = store.list(&ListFilter {
            state: Some(RuleState::Starting),
            ..Default::default()
        });
        assert_eq!(starting.len(), 1);
        assert_eq!(starting[0].id, b.id);
    }

    #[test]
    fn test_count_by_state() {
        let store = RuleStore::new();
        let a = store.create(config("a", 9000)).unwrap();
        let b = store.create(config("b", 9001)).unwrap();
        store.create(config("c", 9002)).unwrap();

        store.transition(a.id, RuleState::Starting, None).unwrap();
        store.transition(a.id, RuleState::Running, Some(9000)).unwrap();
        store.transition(b.id, RuleState::Starting, None).unwrap();
        store.transition(b.id, RuleState::Error, None).unwrap();

        let counts = store.count_by_state();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.stopped, 1);
        assert_eq!(counts.error, 1);
    }

    #[test]
    fn test_concurrent_creates_allocate_unique_ids() {
        let store = std::sync::Arc::new(RuleStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.create(config("r", 10_000 + i)).unwrap().id)
            })
            .collect();
        let mut ids: Vec<RuleId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }
}
