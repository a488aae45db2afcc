//! Turns routing declarations into listeners and rules.
//!
//! Assembly re-attaches new desired state to the listeners and rules of the
//! previous cycle wherever their identity matches, so that their current
//! state carries over and the cloud resources are updated in place instead
//! of being recreated.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::{AssemblyError, Result};
use crate::listener::{Listener, Listeners};
use crate::model::{Declarations, HostRule, Protocol, RuleCondition, MAX_RULE_PRIORITY};
use crate::rule::{Rule, Rules};

/// Assembles the rules of one host into a listener's rule collection.
///
/// `rules` holds the listener's rules so far: ones already claimed this
/// cycle (desired set) and ones left over from the previous cycle (desired
/// stripped). Each path claims a leftover rule with the same host/path, or
/// becomes a new rule. Priorities continue from `priority`, one per path.
///
/// Returns the updated collection, claimed rules first in declaration order,
/// and the last priority handed out. Leftover rules that do not exist in the
/// cloud either are dropped.
pub fn assemble_rules(
    rules: Rules,
    host_rule: &HostRule,
    mut priority: u32,
) -> std::result::Result<(Rules, u32), AssemblyError> {
    let host = host_rule.host.as_deref();
    if host.is_some_and(str::is_empty) {
        return Err(AssemblyError::EmptyHost);
    }
    if host_rule.paths.is_empty() {
        return Err(AssemblyError::NoPaths {
            host: host_rule.host.clone(),
        });
    }

    let (mut claimed, mut leftover): (Vec<Rule>, Vec<Rule>) =
        rules.into_iter().partition(|r| r.desired.is_some());

    for path_rule in &host_rule.paths {
        let path = path_rule.path.as_deref();
        if path_rule.backend.service_name.is_empty() {
            return Err(AssemblyError::EmptyServiceName {
                path: path_rule.path.clone(),
            });
        }
        if let Some(path) = path.filter(|p| !p.starts_with('/')) {
            return Err(AssemblyError::InvalidPath(path.to_string()));
        }
        if host.is_none() && path.is_none() {
            return Err(AssemblyError::NoConditions {
                backend: path_rule.backend.to_string(),
            });
        }

        priority = priority
            .checked_add(1)
            .filter(|p| *p <= MAX_RULE_PRIORITY)
            .ok_or(AssemblyError::PriorityExhausted(priority.saturating_add(1)))?;

        let conditions = RuleCondition::for_route(host, path);
        if claimed.iter().any(|r| r.has_conditions(&conditions)) {
            return Err(AssemblyError::DuplicateCondition {
                host: host_rule.host.clone(),
                path: path_rule.path.clone(),
            });
        }

        let fresh = Rule::new_desired(priority, host, path, path_rule.backend.clone());
        match leftover.iter().position(|r| r.has_conditions(&conditions)) {
            Some(pos) => {
                let mut existing = leftover.remove(pos);
                debug!(priority, conditions = ?conditions, "Reusing existing rule");
                existing.desired = fresh.desired;
                existing.backend = fresh.backend;
                claimed.push(existing);
            }
            None => claimed.push(fresh),
        }
    }

    claimed.extend(leftover.into_iter().filter(|r| r.current.is_some()));
    Ok((claimed.into(), priority))
}

/// Assembles one listener per declared port from the declarations and the
/// listeners of the previous cycle.
///
/// A previous listener whose cloud port matches a declared port is reused,
/// keeping its current state and rules; rules no longer declared end up
/// with no desired state and are deleted on reconcile.
pub fn build_from_declarations(
    declarations: &Declarations,
    previous: Listeners,
) -> Result<Listeners> {
    let mut seen = HashSet::new();
    for port in &declarations.ports {
        if !seen.insert(port.port) {
            return Err(AssemblyError::DuplicatePort(port.port).into());
        }
        if port.protocol == Protocol::Https && declarations.certificate_arn.is_none() {
            return Err(AssemblyError::MissingCertificate(port.port).into());
        }
    }

    let mut previous = previous.into_inner();
    let mut output = Listeners::new();

    for port in &declarations.ports {
        let fresh = Listener::new_desired(
            port,
            declarations.certificate_arn.as_deref(),
            declarations.default_backend.clone(),
        );

        let mut listener = match previous
            .iter()
            .position(|l| l.current_port() == Some(port.port))
        {
            Some(pos) => {
                let mut existing = previous.remove(pos);
                debug!(port = port.port, "Reusing existing listener");
                existing.desired = fresh.desired;
                existing.default_backend = fresh.default_backend;
                existing.rules.strip_desired_state();
                existing.rules.retain(|r| r.current.is_some());
                existing
            }
            None => fresh,
        };

        let mut rules = std::mem::take(&mut listener.rules);
        let mut priority = 0;
        for host_rule in declarations.rules.iter().filter(|r| r.binds_to(port.port)) {
            (rules, priority) = assemble_rules(rules, host_rule, priority)?;
        }
        listener.rules = rules;
        output.push(listener);
    }

    for orphan in previous.iter().filter_map(Listener::current_port) {
        warn!(
            port = orphan,
            "Listener no longer declared, dropping it from tracking without deleting it"
        );
    }

    Ok(output)
}
