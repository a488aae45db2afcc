//! Option bundles passed down the reconcile cascade.
//!
//! The top-level context names the load balancer; each level derives a
//! narrower one for its children, replacing the parent identifier.

use crate::events::{EventRecorder, Events};
use crate::model::TargetGroups;

/// Context for reconciling a load balancer's listener collection.
#[derive(Clone)]
pub struct ReconcileContext {
    pub events: Events,
    pub load_balancer_arn: String,
    pub target_groups: TargetGroups,
}

impl ReconcileContext {
    pub fn new(
        events: Events,
        load_balancer_arn: impl Into<String>,
        target_groups: TargetGroups,
    ) -> Self {
        Self {
            events,
            load_balancer_arn: load_balancer_arn.into(),
            target_groups,
        }
    }

    /// Context for a single listener of this load balancer.
    pub fn listener(&self) -> ListenerContext<'_> {
        ListenerContext {
            events: self.events.as_ref(),
            load_balancer_arn: &self.load_balancer_arn,
            target_groups: &self.target_groups,
        }
    }
}

/// Context for reconciling one listener.
#[derive(Clone, Copy)]
pub struct ListenerContext<'a> {
    pub events: &'a dyn EventRecorder,
    pub load_balancer_arn: &'a str,
    pub target_groups: &'a TargetGroups,
}

impl<'a> ListenerContext<'a> {
    /// Context for the rules of the listener identified by `listener_arn`.
    pub fn rules<'b>(&self, listener_arn: &'b str) -> RuleContext<'b>
    where
        'a: 'b,
    {
        RuleContext {
            events: self.events,
            listener_arn,
            target_groups: self.target_groups,
        }
    }
}

/// Context for reconciling the rules of one listener.
#[derive(Clone, Copy)]
pub struct RuleContext<'a> {
    pub events: &'a dyn EventRecorder,
    pub listener_arn: &'a str,
    pub target_groups: &'a TargetGroups,
}
