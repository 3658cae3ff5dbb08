//! Type definitions for forwarding rules.
//!
//! This module contains the rule entity, its configuration payloads, the rule
//! state machine, listen tuples, list filters and the engine error taxonomy.

use crate::config::Protocol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Rule identifier. Allocated by the store, never reused.
pub type RuleId = u64;

/// Maximum length of a rule name, in characters
pub const MAX_NAME_LEN: usize = 100;

// ============================================================================
// Rule State Machine
// ============================================================================

/// Lifecycle state of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Stopped => "stopped",
            RuleState::Starting => "starting",
            RuleState::Running => "running",
            RuleState::Stopping => "stopping",
            RuleState::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.to_lowercase().as_str() {
            "stopped" => Ok(RuleState::Stopped),
            "starting" => Ok(RuleState::Starting),
            "running" => Ok(RuleState::Running),
            "stopping" => Ok(RuleState::Stopping),
            "error" => Ok(RuleState::Error),
            _ => Err(format!("Unknown rule state: {value}")),
        }
    }

    /// Whether `self -> next` is an edge of the rule state machine.
    pub fn can_transition_to(self, next: RuleState) -> bool {
        use RuleState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Error, Stopped)
        )
    }

    /// Rules in these states may be edited or deleted.
    pub fn is_idle(self) -> bool {
        matches!(self, RuleState::Stopped | RuleState::Error)
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Rule Configuration
// ============================================================================

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

/// Caller-supplied rule configuration (create payload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    #[serde(default)]
    pub remark: String,
}

impl RuleConfig {
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        listen: SocketAddr,
        target_address: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            protocol,
            listen_address: listen.ip().to_string(),
            listen_port: listen.port(),
            target_address: target_address.into(),
            target_port,
            remark: String::new(),
        }
    }

    /// Validate and canonicalize the configuration.
    ///
    /// Trims the name and target, and rewrites the listen address in its
    /// canonical textual form so listen tuples compare reliably.
    pub fn normalize(mut self) -> Result<Self, ForwardError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(ForwardError::InvalidConfig("name must not be empty".into()));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(ForwardError::InvalidConfig(format!(
                "name must be at most {MAX_NAME_LEN} characters"
            )));
        }

        let listen_ip: IpAddr = self.listen_address.trim().parse().map_err(|_| {
            ForwardError::InvalidConfig(format!(
                "listenAddress '{}' is not an IP address",
                self.listen_address
            ))
        })?;
        self.listen_address = listen_ip.to_string();

        self.target_address = self.target_address.trim().to_string();
        if !is_valid_target_host(&self.target_address) {
            return Err(ForwardError::InvalidConfig(format!(
                "targetAddress '{}' is not a valid IP address or hostname",
                self.target_address
            )));
        }
        if self.target_port == 0 {
            return Err(ForwardError::InvalidConfig(
                "targetPort must be between 1 and 65535".into(),
            ));
        }

        if let Ok(target_ip) = self.target_address.parse::<IpAddr>() {
            if target_ip == listen_ip && self.target_port == self.listen_port {
                return Err(ForwardError::InvalidConfig(
                    "target endpoint must differ from the listen endpoint".into(),
                ));
            }
        }

        Ok(self)
    }

    pub fn listen_tuple(&self) -> Result<ListenTuple, ForwardError> {
        let address = self.listen_address.parse().map_err(|_| {
            ForwardError::InvalidConfig(format!(
                "listenAddress '{}' is not an IP address",
                self.listen_address
            ))
        })?;
        Ok(ListenTuple {
            address,
            port: self.listen_port,
            protocol: self.protocol,
        })
    }
}

/// Hostname (RFC 1123 labels) or IP literal
fn is_valid_target_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Partial update payload. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

impl RuleUpdate {
    /// Overlay this update on an existing configuration
    pub fn apply_to(&self, base: &RuleConfig) -> RuleConfig {
        RuleConfig {
            name: self.name.clone().unwrap_or_else(|| base.name.clone()),
            protocol: self.protocol.unwrap_or(base.protocol),
            listen_address: self
                .listen_address
                .clone()
                .unwrap_or_else(|| base.listen_address.clone()),
            listen_port: self.listen_port.unwrap_or(base.listen_port),
            target_address: self
                .target_address
                .clone()
                .unwrap_or_else(|| base.target_address.clone()),
            target_port: self.target_port.unwrap_or(base.target_port),
            remark: self.remark.clone().unwrap_or_else(|| base.remark.clone()),
        }
    }
}

// ============================================================================
// Rule Entity
// ============================================================================

/// Point-in-time view of a forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub protocol: Protocol,
    pub listen_address: String,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub remark: String,
    pub state: RuleState,
    /// Port actually bound while the rule is Running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub(crate) fn from_config(id: RuleId, config: RuleConfig, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: config.name,
            protocol: config.protocol,
            listen_address: config.listen_address,
            listen_port: config.listen_port,
            target_address: config.target_address,
            target_port: config.target_port,
            remark: config.remark,
            state: RuleState::Stopped,
            bound_port: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn apply_config(&mut self, config: RuleConfig, now: DateTime<Utc>) {
        self.name = config.name;
        self.protocol = config.protocol;
        self.listen_address = config.listen_address;
        self.listen_port = config.listen_port;
        self.target_address = config.target_address;
        self.target_port = config.target_port;
        self.remark = config.remark;
        self.updated_at = now;
    }

    pub fn config(&self) -> RuleConfig {
        RuleConfig {
            name: self.name.clone(),
            protocol: self.protocol,
            listen_address: self.listen_address.clone(),
            listen_port: self.listen_port,
            target_address: self.target_address.clone(),
            target_port: self.target_port,
            remark: self.remark.clone(),
        }
    }

    pub fn listen_tuple(&self) -> Result<ListenTuple, ForwardError> {
        self.config().listen_tuple()
    }

    /// `host:port` of the relay destination
    pub fn target(&self) -> String {
        match self.target_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.target_port),
            _ => format!("{}:{}", self.target_address, self.target_port),
        }
    }
}

// ============================================================================
// Listen Tuples
// ============================================================================

/// The `(address, port, protocol)` triple a rule listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenTuple {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl ListenTuple {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Whether two tuples compete for the same OS binding.
    ///
    /// Port 0 asks the OS for an ephemeral port and never conflicts. An
    /// unspecified address overlaps every address of the same family.
    pub fn overlaps(&self, other: &ListenTuple) -> bool {
        if self.protocol != other.protocol || self.port == 0 || self.port != other.port {
            return false;
        }
        if self.address == other.address {
            return true;
        }
        let same_family = self.address.is_ipv4() == other.address.is_ipv4();
        same_family && (self.address.is_unspecified() || other.address.is_unspecified())
    }
}

impl fmt::Display for ListenTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.socket_addr())
    }
}

// ============================================================================
// List Filter
// ============================================================================

/// Filter for listing rules. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub state: Option<RuleState>,
    pub protocol: Option<Protocol>,
    /// Case-insensitive substring of name or remark
    pub keyword: Option<String>,
}

impl ListFilter {
    pub fn matches(&self, rule: &Rule) -> bool {
        if self.state.is_some_and(|s| s != rule.state) {
            return false;
        }
        if self.protocol.is_some_and(|p| p != rule.protocol) {
            return false;
        }
        match self.keyword.as_deref().map(str::trim) {
            Some(keyword) if !keyword.is_empty() => {
                let keyword = keyword.to_lowercase();
                rule.name.to_lowercase().contains(&keyword)
                    || rule.remark.to_lowercase().contains(&keyword)
            }
            _ => true,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error types for the forwarding engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    #[error("Rule {0} not found")]
    NotFound(RuleId),
    #[error("Invalid rule configuration: {0}")]
    InvalidConfig(String),
    #[error("Listen tuple {tuple} is already claimed by rule {holder}")]
    DuplicateBinding { tuple: String, holder: RuleId },
    #[error("Cannot {operation} rule {id} while it is {state}")]
    InvalidState {
        id: RuleId,
        state: RuleState,
        operation: &'static str,
    },
    #[error("Failed to bind {addr}: {reason}")]
    BindError { addr: String, reason: String },
    #[error("Failed to dial {target}: {reason}")]
    DialError { target: String, reason: String },
    #[error("Drain of rule {id} exceeded the grace period, force-closed {forced} connection(s)")]
    DrainTimeout { id: RuleId, forced: usize },
}

impl ForwardError {
    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::NotFound(_) => "not_found",
            ForwardError::InvalidConfig(_) => "invalid_config",
            ForwardError::DuplicateBinding { .. } => "duplicate_binding",
            ForwardError::InvalidState { .. } => "invalid_state",
            ForwardError::BindError { .. } => "bind_error",
            ForwardError::DialError { .. } => "dial_error",
            ForwardError::DrainTimeout { .. } => "drain_timeout",
        }
    }

    /// HTTP status the admin API reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ForwardError::NotFound(_) => 404,
            ForwardError::InvalidConfig(_) => 400,
            ForwardError::DuplicateBinding { .. } | ForwardError::InvalidState { .. } => 409,
            ForwardError::DialError { .. } => 502,
            ForwardError::BindError { .. } | ForwardError::DrainTimeout { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_config(listen_port: u16) -> RuleConfig {
        RuleConfig {
            name: "web".to_string(),
            protocol: Protocol::Tcp,
            listen_address: "0.0.0.0".to_string(),
            listen_port,
            target_address: "127.0.0.1".to_string(),
            target_port: 8080,
            remark: String::new(),
        }
    }

    #[test]
    fn test_state_machine_edges() {
        use RuleState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Error));
        assert!(Running.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Error));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Error.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Error.can_transition_to(Starting));
        assert!(!Error.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_state_parse_and_display() {
        assert_eq!(RuleState::parse("Running"), Ok(RuleState::Running));
        assert!(RuleState::parse("paused").is_err());
        assert_eq!(RuleState::Stopping.to_string(), "stopping");
        assert!(RuleState::Error.is_idle());
        assert!(!RuleState::Starting.is_idle());
    }

    #[test]
    fn test_config_defaults_from_json() {
        let json = r#"{"name": "db", "listenPort": 9000, "targetAddress": "db.internal", "targetPort": 5432}"#;
        let config: RuleConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.remark, "");
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        let json = r#"{"name": "db", "listenPort": 9000, "targetAddress": "x", "targetPort": 1, "targets": []}"#;
        assert!(serde_json::from_str::<RuleConfig>(json).is_err());
    }

    #[test]
    fn test_normalize_trims_and_canonicalizes() {
        let mut config = tcp_config(9000);
        config.name = "  web  ".to_string();
        config.listen_address = "::0".to_string();
        let config = config.normalize().unwrap();
        assert_eq!(config.name, "web");
        assert_eq!(config.listen_address, "::");
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        let mut empty_name = tcp_config(9000);
        empty_name.name = "   ".to_string();
        assert!(matches!(
            empty_name.normalize(),
            Err(ForwardError::InvalidConfig(_))
        ));

        let mut long_name = tcp_config(9000);
        long_name.name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(long_name.normalize().is_err());

        let mut bad_listen = tcp_config(9000);
        bad_listen.listen_address = "localhost".to_string();
        assert!(bad_listen.normalize().is_err());

        let mut bad_target = tcp_config(9000);
        bad_target.target_address = "bad host!".to_string();
        assert!(bad_target.normalize().is_err());

        let mut zero_target_port = tcp_config(9000);
        zero_target_port.target_port = 0;
        assert!(zero_target_port.normalize().is_err());

        let mut self_loop = tcp_config(8080);
        self_loop.listen_address = "127.0.0.1".to_string();
        assert!(self_loop.normalize().is_err());
    }

    #[test]
    fn test_hostname_targets_are_accepted() {
        let mut config = tcp_config(9000);
        config.target_address = "backend-1.svc.cluster.local".to_string();
        assert!(config.normalize().is_ok());
    }

    #[test]
    fn test_update_overlays_fields() {
        let base = tcp_config(9000);
        let update = RuleUpdate {
            name: Some("renamed".to_string()),
            target_port: Some(9090),
            ..Default::default()
        };
        let merged = update.apply_to(&base);
        assert_eq!(merged.name, "renamed");
        assert_eq!(merged.target_port, 9090);
        assert_eq!(merged.listen_port, 9000);
        assert_eq!(merged.target_address, base.target_address);
    }

    #[test]
    fn test_listen_tuple_overlap() {
        let tuple = |addr: &str, port: u16, protocol: Protocol| ListenTuple {
            address: addr.parse().unwrap(),
            port,
            protocol,
        };

        let any = tuple("0.0.0.0", 9000, Protocol::Tcp);
        let local = tuple("127.0.0.1", 9000, Protocol::Tcp);
        let other_local = tuple("127.0.0.2", 9000, Protocol::Tcp);

        assert!(any.overlaps(&local));
        assert!(local.overlaps(&any));
        assert!(local.overlaps(&local));
        assert!(!local.overlaps(&other_local));
        assert!(!any.overlaps(&tuple("0.0.0.0", 9000, Protocol::Udp)));
        assert!(!any.overlaps(&tuple("0.0.0.0", 9001, Protocol::Tcp)));
        assert!(!any.overlaps(&tuple("::", 9000, Protocol::Tcp)));
        assert!(!tuple("0.0.0.0", 0, Protocol::Tcp).overlaps(&tuple("0.0.0.0", 0, Protocol::Tcp)));
    }

    #[test]
    fn test_rule_serializes_camel_case() {
        let rule = Rule::from_config(7, tcp_config(9000), Utc::now());
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["listenPort"], 9000);
        assert_eq!(json["targetAddress"], "127.0.0.1");
        assert_eq!(json["state"], "stopped");
        assert!(json.get("boundPort").is_none());
    }

    #[test]
    fn test_rule_target_formats_ipv6() {
        let mut config = tcp_config(9000);
        config.target_address = "::1".to_string();
        let rule = Rule::from_config(1, config, Utc::now());
        assert_eq!(rule.target(), "[::1]:8080");
    }

    #[test]
    fn test_list_filter_matches() {
        let mut rule = Rule::from_config(1, tcp_config(9000), Utc::now());
        rule.remark = "Primary Web".to_string();

        assert!(ListFilter::default().matches(&rule));
        assert!(ListFilter {
            keyword: Some("primary".to_string()),
            ..Default::default()
        }
        .matches(&rule));
        assert!(!ListFilter {
            state: Some(RuleState::Running),
            ..Default::default()
        }
        .matches(&rule));
        assert!(!ListFilter {
            protocol: Some(Protocol::Udp),
            ..Default::default()
        }
        .matches(&rule));
    }

    #[test]
    fn test_error_kinds_and_status() {
        assert_eq!(ForwardError::NotFound(1).status_code(), 404);
        assert_eq!(ForwardError::NotFound(1).kind(), "not_found");
        let dup = ForwardError::DuplicateBinding {
            tuple: "tcp://0.0.0.0:9000".into(),
            holder: 3,
        };
        assert_eq!(dup.status_code(), 409);
        assert_eq!(dup.to_string(), "Listen tuple tcp://0.0.0.0:9000 is already claimed by rule 3");
        let state = ForwardError::InvalidState {
            id: 2,
            state: RuleState::Running,
            operation: "delete",
        };
        assert_eq!(state.to_string(), "Cannot delete rule 2 while it is running");
        assert_eq!(
            ForwardError::BindError {
                addr: "0.0.0.0:80".into(),
                reason: "denied".into()
            }
            .status_code(),
            500
        );
    }
}
