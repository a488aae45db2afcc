//! In-memory load balancer API.
//!
//! Behaves like the cloud for the operations the engine uses: ARNs are
//! assigned on creation, every listener owns a default rule, and deleting
//! a listener removes its rules. Failures can be injected per operation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{CloudError, ElbApi, Operation};
use crate::model::{ListenerDescriptor, Protocol, RuleDescriptor, MAX_RULE_PRIORITY};

/// A listener and its rules as stored by the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerState {
    pub listener: ListenerDescriptor,
    #[serde(default)]
    pub rules: Vec<RuleDescriptor>,
}

/// Everything the cloud knows about one load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerState {
    pub arn: String,
    #[serde(default)]
    pub listeners: Vec<ListenerState>,
}

#[derive(Default)]
struct Inner {
    load_balancers: Vec<LoadBalancerState>,
    /// Successful calls left per operation before it starts failing.
    failures: HashMap<Operation, usize>,
    calls: Vec<Operation>,
}

impl Inner {
    fn call(&mut self, operation: Operation) -> Result<(), CloudError> {
        self.calls.push(operation);
        if let Some(remaining) = self.failures.get_mut(&operation) {
            if *remaining == 0 {
                return Err(CloudError::Api {
                    operation,
                    message: "injected failure".to_string(),
                });
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn load_balancer_mut(&mut self, arn: &str) -> Result<&mut LoadBalancerState, CloudError> {
        self.load_balancers
            .iter_mut()
            .find(|lb| lb.arn == arn)
            .ok_or_else(|| CloudError::NotFound(format!("load balancer {}", arn)))
    }

    fn listener_mut(&mut self, arn: &str) -> Result<&mut ListenerState, CloudError> {
        self.load_balancers
            .iter_mut()
            .flat_map(|lb| lb.listeners.iter_mut())
            .find(|l| l.listener.arn.as_deref() == Some(arn))
            .ok_or_else(|| CloudError::NotFound(format!("listener {}", arn)))
    }

    fn rule_listener_mut(&mut self, rule_arn: &str) -> Result<&mut ListenerState, CloudError> {
        self.load_balancers
            .iter_mut()
            .flat_map(|lb| lb.listeners.iter_mut())
            .find(|l| l.rules.iter().any(|r| r.arn.as_deref() == Some(rule_arn)))
            .ok_or_else(|| CloudError::NotFound(format!("rule {}", rule_arn)))
    }

    fn rule_mut(&mut self, arn: &str) -> Result<&mut RuleDescriptor, CloudError> {
        self.load_balancers
            .iter_mut()
            .flat_map(|lb| lb.listeners.iter_mut())
            .flat_map(|l| l.rules.iter_mut())
            .find(|r| r.arn.as_deref() == Some(arn))
            .ok_or_else(|| CloudError::NotFound(format!("rule {}", arn)))
    }
}

fn validate_listener(
    operation: Operation,
    listener: &ListenerDescriptor,
) -> Result<(), CloudError> {
    if listener.protocol == Protocol::Https && listener.certificate_arn.is_none() {
        return Err(CloudError::Api {
            operation,
            message: format!("HTTPS listener on port {} needs a certificate", listener.port),
        });
    }
    if listener.default_target_group_arn.is_none() {
        return Err(CloudError::Api {
            operation,
            message: format!("listener on port {} needs a default action", listener.port),
        });
    }
    Ok(())
}

fn validate_rule(operation: Operation, rule: &RuleDescriptor) -> Result<(), CloudError> {
    if rule.priority == 0 || rule.priority > MAX_RULE_PRIORITY {
        return Err(CloudError::Api {
            operation,
            message: format!("priority {} out of range", rule.priority),
        });
    }
    if rule.conditions.is_empty() {
        return Err(CloudError::Api {
            operation,
            message: "rule needs at least one condition".to_string(),
        });
    }
    if rule.target_group_arn.is_none() {
        return Err(CloudError::Api {
            operation,
            message: "rule needs a forward action".to_string(),
        });
    }
    Ok(())
}

/// Priorities are unique among the non-default rules of a listener.
fn ensure_priority_free(
    listener: &ListenerState,
    priority: u32,
    rule_arn: Option<&str>,
) -> Result<(), CloudError> {
    let taken = listener.rules.iter().any(|r| {
        !r.is_default && r.priority == priority && r.arn.as_deref() != rule_arn
    });
    if taken {
        return Err(CloudError::Conflict(format!(
            "priority {} already in use",
            priority
        )));
    }
    Ok(())
}

/// In-memory [`ElbApi`] implementation.
#[derive(Default)]
pub struct MemoryElb {
    inner: Mutex<Inner>,
}

impl MemoryElb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the API with an existing load balancer.
    pub fn from_state(state: LoadBalancerState) -> Self {
        let elb = Self::new();
        elb.lock().load_balancers.push(state);
        elb
    }

    pub fn with_load_balancer(self, arn: impl Into<String>) -> Self {
        self.add_load_balancer(arn);
        self
    }

    pub fn add_load_balancer(&self, arn: impl Into<String>) {
        self.lock().load_balancers.push(LoadBalancerState {
            arn: arn.into(),
            listeners: Vec::new(),
        });
    }

    /// Drops every listener and rule of a load balancer, as deleting and
    /// recreating it in the cloud would.
    pub fn recreate_load_balancer(&self, arn: &str) -> Result<(), CloudError> {
        let mut inner = self.lock();
        let lb = inner.load_balancer_mut(arn)?;
        debug!(arn, listeners = lb.listeners.len(), "Recreating load balancer");
        lb.listeners.clear();
        Ok(())
    }

    pub fn snapshot(&self, arn: &str) -> Option<LoadBalancerState> {
        self.lock()
            .load_balancers
            .iter()
            .find(|lb| lb.arn == arn)
            .cloned()
    }

    /// Makes every subsequent call of `operation` fail.
    pub fn fail_on(&self, operation: Operation) {
        self.fail_after(operation, 0);
    }

    /// Lets `successes` calls of `operation` through, then fails the rest.
    pub fn fail_after(&self, operation: Operation, successes: usize) {
        self.lock().failures.insert(operation, successes);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    /// Calls made so far that change cloud state.
    pub fn mutations(&self) -> Vec<Operation> {
        self.calls()
            .into_iter()
            .filter(Operation::is_mutation)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ElbApi for MemoryElb {
    async fn describe_listeners(
        &self,
        load_balancer_arn: &str,
    ) -> Result<Vec<ListenerDescriptor>, CloudError> {
        let mut inner = self.lock();
        inner.call(Operation::DescribeListeners)?;
        let lb = inner.load_balancer_mut(load_balancer_arn)?;
        Ok(lb.listeners.iter().map(|l| l.listener.clone()).collect())
    }

    async fn describe_rules(&self, listener_arn: &str) -> Result<Vec<RuleDescriptor>, CloudError> {
        let mut inner = self.lock();
        inner.call(Operation::DescribeRules)?;
        Ok(inner.listener_mut(listener_arn)?.rules.clone())
    }

    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        listener: &ListenerDescriptor,
    ) -> Result<ListenerDescriptor, CloudError> {
        let mut inner = self.lock();
        inner.call(Operation::CreateListener)?;
        validate_listener(Operation::CreateListener, listener)?;

        let lb = inner.load_balancer_mut(load_balancer_arn)?;
        if lb.listeners.iter().any(|l| l.listener.port == listener.port) {
            return Err(CloudError::Conflict(format!(
                "port {} already has a listener",
                listener.port
            )));
        }

        let arn = format!("{}/listener/{}", load_balancer_arn, Uuid::new_v4().simple());
        let created = ListenerDescriptor {
            arn: Some(arn.clone()),
            ..listener.clone()
        };
        let default_rule = RuleDescriptor {
            arn: Some(format!("{}/rule/{}", arn, Uuid::new_v4().simple())),
            priority: 0,
            conditions: Vec::new(),
            target_group_arn: listener.default_target_group_arn.clone(),
            is_default: true,
        };
        lb.listeners.push(ListenerState {
            listener: created.clone(),
            rules: vec![default_rule],
        });
        Ok(created)
    }

    async fn modify_listener(
        &self,
        listener_arn: &str,
        listener: &ListenerDescriptor,
    ) -> Result<ListenerDescriptor, CloudError> {
        let mut inner = self.lock();
        inner.call(Operation::ModifyListener)?;
        validate_listener(Operation::ModifyListener, listener)?;

        let taken = inner.load_balancers.iter().any(|lb| {
            lb.listeners.iter().any(|l| l.listener.arn.as_deref() == Some(listener_arn))
                && lb.listeners.iter().any(|l| {
                    l.listener.port == listener.port
                        && l.listener.arn.as_deref() != Some(listener_arn)
                })
        });
        if taken {
            return Err(CloudError::Conflict(format!(
                "port {} already has a listener",
                listener.port
            )));
        }

        let state = inner.listener_mut(listener_arn)?;
        state.listener = ListenerDescriptor {
            arn: Some(listener_arn.to_string()),
            ..listener.clone()
        };
        for rule in state.rules.iter_mut().filter(|r| r.is_default) {
            rule.target_group_arn = listener.default_target_group_arn.clone();
        }
        Ok(state.listener.clone())
    }

    async fn delete_listener(&self, listener_arn: &str) -> Result<(), CloudError> {
        let mut inner = self.lock();
        inner.call(Operation::DeleteListener)?;
        for lb in inner.load_balancers.iter_mut() {
            if let Some(pos) = lb
                .listeners
                .iter()
                .position(|l| l.listener.arn.as_deref() == Some(listener_arn))
            {
                lb.listeners.remove(pos);
                return Ok(());
            }
        }
        Err(CloudError::NotFound(format!("listener {}", listener_arn)))
    }

    async fn create_rule(
        &self,
        listener_arn: &str,
        rule: &RuleDescriptor,
    ) -> Result<RuleDescriptor, CloudError> {
        let mut inner = self.lock();
        inner.call(Operation::CreateRule)?;
        validate_rule(Operation::CreateRule, rule)?;

        let state = inner.listener_mut(listener_arn)?;
        ensure_priority_free(state, rule.priority, None)?;
        let created = RuleDescriptor {
            arn: Some(format!("{}/rule/{}", listener_arn, Uuid::new_v4().simple())),
            is_default: false,
            ..rule.clone()
        };
        state.rules.push(created.clone());
        Ok(created)
    }

    async fn modify_rule(
        &self,
        rule_arn: &str,
        rule: &RuleDescriptor,
    ) -> Result<RuleDescriptor, CloudError> {
        let mut inner = self.lock();
        inner.call(Operation::ModifyRule)?;
        validate_rule(Operation::ModifyRule, rule)?;

        if inner.rule_mut(rule_arn)?.is_default {
            return Err(CloudError::Api {
                operation: Operation::ModifyRule,
                message: "default rules are modified through their listener".to_string(),
            });
        }
        let state = inner.rule_listener_mut(rule_arn)?;
        ensure_priority_free(state, rule.priority, Some(rule_arn))?;
        let existing = state
            .rules
            .iter_mut()
            .find(|r| r.arn.as_deref() == Some(rule_arn))
            .ok_or_else(|| CloudError::NotFound(format!("rule {}", rule_arn)))?;
        *existing = RuleDescriptor {
            arn: Some(rule_arn.to_string()),
            is_default: false,
            ..rule.clone()
        };
        Ok(existing.clone())
    }

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), CloudError> {
        let mut inner = self.lock();
        inner.call(Operation::DeleteRule)?;
        if inner.rule_mut(rule_arn)?.is_default {
            return Err(CloudError::Api {
                operation: Operation::DeleteRule,
                message: "default rules cannot be deleted".to_string(),
            });
        }
        for listener in inner
            .load_balancers
            .iter_mut()
            .flat_map(|lb| lb.listeners.iter_mut())
        {
            listener.rules.retain(|r| r.arn.as_deref() != Some(rule_arn));
        }
        Ok(())
    }
}
