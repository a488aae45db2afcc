//! Cloud descriptors and routing declarations.
//!
//! Descriptors mirror what the cloud API reports for a listener or rule.
//! Declarations are what the cluster's routing resources ask for.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest rule priority the load balancer accepts.
pub const MAX_RULE_PRIORITY: u32 = 50_000;

/// Listener protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "HTTP"),
            Protocol::Https => write!(f, "HTTPS"),
        }
    }
}

// =============================================================================
// Cloud descriptors
// =============================================================================

/// A listener as the cloud describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerDescriptor {
    /// Assigned by the cloud on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_arn: Option<String>,
    /// Target group of the listener's default forward action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_target_group_arn: Option<String>,
}

/// A single rule match condition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "kebab-case")]
pub enum RuleCondition {
    HostHeader(String),
    PathPattern(String),
}

impl RuleCondition {
    /// Builds the condition set for an optional host and path.
    pub fn for_route(host: Option<&str>, path: Option<&str>) -> Vec<RuleCondition> {
        let mut conditions = Vec::with_capacity(2);
        if let Some(host) = host {
            conditions.push(RuleCondition::HostHeader(host.to_string()));
        }
        if let Some(path) = path {
            conditions.push(RuleCondition::PathPattern(path.to_string()));
        }
        conditions
    }

    /// Compares two condition sets ignoring order.
    pub fn same_set(a: &[RuleCondition], b: &[RuleCondition]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut a = a.to_vec();
        let mut b = b.to_vec();
        a.sort();
        b.sort();
        a == b
    }
}

impl fmt::Display for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCondition::HostHeader(host) => write!(f, "host={}", host),
            RuleCondition::PathPattern(path) => write!(f, "path={}", path),
        }
    }
}

/// A listener rule as the cloud describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    pub priority: u32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group_arn: Option<String>,
    /// The catch-all rule owned by the listener's default action.
    #[serde(default)]
    pub is_default: bool,
}

// =============================================================================
// Routing declarations
// =============================================================================

/// A service port traffic is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceBackend {
    pub service_name: String,
    pub service_port: u16,
}

impl ServiceBackend {
    pub fn new(service_name: impl Into<String>, service_port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            service_port,
        }
    }
}

impl fmt::Display for ServiceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_name, self.service_port)
    }
}

/// A declared listener port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerPort {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl ListenerPort {
    pub fn http(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Http,
        }
    }

    pub fn https(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Https,
        }
    }
}

/// One path of a host rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    #[serde(default)]
    pub path: Option<String>,
    pub backend: ServiceBackend,
}

/// Routing declaration for one virtual host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRule {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub paths: Vec<PathRule>,
    /// Listener ports this host binds to; empty binds to all of them.
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl HostRule {
    pub fn binds_to(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&port)
    }
}

/// The complete routing declaration for one load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declarations {
    pub ports: Vec<ListenerPort>,
    #[serde(default)]
    pub certificate_arn: Option<String>,
    #[serde(default)]
    pub default_backend: Option<ServiceBackend>,
    #[serde(default)]
    pub rules: Vec<HostRule>,
}

// =============================================================================
// Target groups
// =============================================================================

/// A resolved target group serving one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub arn: String,
    pub backend: ServiceBackend,
}

/// Target groups resolved for the current cycle, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetGroups(Vec<TargetGroup>);

impl TargetGroups {
    pub fn new(groups: Vec<TargetGroup>) -> Self {
        Self(groups)
    }

    /// Finds the target group serving a backend.
    pub fn lookup(&self, backend: &ServiceBackend) -> Option<&TargetGroup> {
        self.0.iter().find(|tg| &tg.backend == backend)
    }

    pub fn first(&self) -> Option<&TargetGroup> {
        self.0.first()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetGroup> {
        self.0.iter()
    }
}

impl From<Vec<TargetGroup>> for TargetGroups {
    fn from(groups: Vec<TargetGroup>) -> Self {
        Self(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_set_ignores_order() {
        let a = RuleCondition::for_route(Some("a.com"), Some("/api"));
        let b = vec![
            RuleCondition::PathPattern("/api".to_string()),
            RuleCondition::HostHeader("a.com".to_string()),
        ];
        assert!(RuleCondition::same_set(&a, &b));
        assert!(!RuleCondition::same_set(&a, &b[..1]));
    }

    #[test]
    fn test_host_rule_binds_to_all_ports_when_unset() {
        let rule = HostRule {
            host: Some("a.com".to_string()),
            paths: vec![],
            ports: vec![],
        };
        assert!(rule.binds_to(80));
        assert!(rule.binds_to(443));

        let rule = HostRule {
            ports: vec![443],
            ..rule
        };
        assert!(!rule.binds_to(80));
        assert!(rule.binds_to(443));
    }

    #[test]
    fn test_declarations_from_json() {
        let json = r#"{
            "ports": [{"port": 80}, {"port": 443, "protocol": "HTTPS"}],
            "certificate_arn": "arn:cert",
            "rules": [
                {"host": "a.com", "paths": [{"path": "/", "backend": {"service_name": "web", "service_port": 8080}}]}
            ]
        }"#;

        let decl: Declarations = serde_json::from_str(json).unwrap();
        assert_eq!(decl.ports, vec![ListenerPort::http(80), ListenerPort::https(443)]);
        assert_eq!(decl.rules[0].paths[0].backend, ServiceBackend::new("web", 8080));
        assert!(decl.default_backend.is_none());
    }

    #[test]
    fn test_target_group_lookup() {
        let groups = TargetGroups::new(vec![
            TargetGroup {
                arn: "tg-web".to_string(),
                backend: ServiceBackend::new("web", 80),
            },
            TargetGroup {
                arn: "tg-api".to_string(),
                backend: ServiceBackend::new("api", 80),
            },
        ]);

        assert_eq!(
            groups.lookup(&ServiceBackend::new("api", 80)).map(|tg| tg.arn.as_str()),
            Some("tg-api")
        );
        assert!(groups.lookup(&ServiceBackend::new("api", 81)).is_none());
        assert_eq!(groups.first().map(|tg| tg.arn.as_str()), Some("tg-web"));
    }
}
