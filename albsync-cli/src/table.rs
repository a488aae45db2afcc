//! Table output for load balancer state.

use albsync_engine::cloud::LoadBalancerState;
use albsync_engine::RuleCondition;
use tabled::Tabled;

#[derive(Debug, Tabled)]
pub struct RuleRow {
    #[tabled(rename = "PORT")]
    pub port: u16,
    #[tabled(rename = "PROTOCOL")]
    pub protocol: String,
    #[tabled(rename = "PRIORITY")]
    pub priority: String,
    #[tabled(rename = "CONDITIONS")]
    pub conditions: String,
    #[tabled(rename = "TARGET GROUP")]
    pub target_group: String,
}

/// One row per rule, default rules first within each listener.
pub fn rows(state: &LoadBalancerState) -> Vec<RuleRow> {
    let mut rows = Vec::new();
    for listener in &state.listeners {
        let mut rules: Vec<_> = listener.rules.iter().collect();
        rules.sort_by_key(|r| (!r.is_default, r.priority));

        for rule in rules {
            rows.push(RuleRow {
                port: listener.listener.port,
                protocol: listener.listener.protocol.to_string(),
                priority: if rule.is_default {
                    "default".to_string()
                } else {
                    rule.priority.to_string()
                },
                conditions: format_conditions(&rule.conditions),
                target_group: rule.target_group_arn.clone().unwrap_or_else(|| "-".to_string()),
            });
        }
    }
    rows
}

fn format_conditions(conditions: &[RuleCondition]) -> String {
    if conditions.is_empty() {
        return "*".to_string();
    }
    conditions
        .iter()
        .map(RuleCondition::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
