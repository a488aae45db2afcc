//! Cloud load balancer API boundary.
//!
//! The engine never talks to the cloud directly; every listener and rule
//! mutation goes through [`ElbApi`].

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ListenerDescriptor, RuleDescriptor};

pub use memory::{ListenerState, LoadBalancerState, MemoryElb};

/// Cloud API operations, used for failure injection and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeListeners,
    DescribeRules,
    CreateListener,
    ModifyListener,
    DeleteListener,
    CreateRule,
    ModifyRule,
    DeleteRule,
}

impl Operation {
    /// Whether the operation changes cloud state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::DescribeListeners | Operation::DescribeRules)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::DescribeListeners => "DescribeListeners",
            Operation::DescribeRules => "DescribeRules",
            Operation::CreateListener => "CreateListener",
            Operation::ModifyListener => "ModifyListener",
            Operation::DeleteListener => "DeleteListener",
            Operation::CreateRule => "CreateRule",
            Operation::ModifyRule => "ModifyRule",
            Operation::DeleteRule => "DeleteRule",
        };
        f.write_str(name)
    }
}

/// Errors returned by the cloud API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with an existing resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Request rejected by the API.
    #[error("{operation} failed: {message}")]
    Api {
        operation: Operation,
        message: String,
    },
}

/// Listener and rule operations of the cloud load balancer API.
#[async_trait]
pub trait ElbApi: Send + Sync {
    /// Lists the listeners of a load balancer.
    async fn describe_listeners(
        &self,
        load_balancer_arn: &str,
    ) -> Result<Vec<ListenerDescriptor>, CloudError>;

    /// Lists the rules of a listener, including its default rule.
    async fn describe_rules(&self, listener_arn: &str) -> Result<Vec<RuleDescriptor>, CloudError>;

    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        listener: &ListenerDescriptor,
    ) -> Result<ListenerDescriptor, CloudError>;

    async fn modify_listener(
        &self,
        listener_arn: &str,
        listener: &ListenerDescriptor,
    ) -> Result<ListenerDescriptor, CloudError>;

    /// Deletes a listener together with all of its rules.
    async fn delete_listener(&self, listener_arn: &str) -> Result<(), CloudError>;

    async fn create_rule(
        &self,
        listener_arn: &str,
        rule: &RuleDescriptor,
    ) -> Result<RuleDescriptor, CloudError>;

    async fn modify_rule(
        &self,
        rule_arn: &str,
        rule: &RuleDescriptor,
    ) -> Result<RuleDescriptor, CloudError>;

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), CloudError>;
}
