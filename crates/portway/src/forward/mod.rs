//! The forwarding engine.
//!
//! This module provides:
//! - `Supervisor`: the engine facade used by the admin API
//! - `RuleStore`: in-memory registry of forwarding rules
//! - `ForwardManager`: at most one bound `Listener` per running rule
//! - `StatsCollector`: per-rule traffic counters
//!
//! ## Module Structure
//!
//! - `types`: Rule, its configuration, state machine and errors
//! - `store`: RuleStore
//! - `relay`: TCP byte copying and UDP sessions
//! - `listener`: accept/receive loops and drain
//! - `manager`: ForwardManager
//! - `stats`: StatsCollector and snapshots
//! - `supervisor`: Supervisor

mod listener;
mod manager;
mod relay;
mod stats;
mod store;
mod supervisor;
mod types;


pub use listener::{DrainReport, Listener, ListenerFailure};
pub use manager::ForwardManager;
pub use stats::{
    AggregateStats, RuleCounts, RuleStatsEntry, RuleStatsSnapshot, StatsCollector, StatsTotals,
};
pub use store::RuleStore;
pub use supervisor::Supervisor;
pub use types::{
    ForwardError, ListFilter, ListenTuple, Rule, RuleConfig, RuleId, RuleState, RuleUpdate,
    MAX_NAME_LEN,
};
