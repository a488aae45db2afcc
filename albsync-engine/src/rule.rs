//! Listener rules - desired/current pairs and their collection.

use std::ops::{Deref, DerefMut};

use tracing::{debug, info};

use crate::cloud::ElbApi;
use crate::context::RuleContext;
use crate::error::{AssemblyError, Error, Result};
use crate::events::EventType;
use crate::model::{RuleCondition, RuleDescriptor, ServiceBackend, MAX_RULE_PRIORITY};

/// A routing rule of one listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    /// What the declarations ask for; `None` when the rule should go away.
    pub desired: Option<RuleDescriptor>,
    /// What the cloud reports; `None` when the rule does not exist yet.
    pub current: Option<RuleDescriptor>,
    /// Backend the desired rule forwards to, resolved to a target group on reconcile.
    pub backend: Option<ServiceBackend>,
    /// Set once the rule has been removed from the cloud.
    pub deleted: bool,
}

impl Rule {
    /// A rule that does not exist in the cloud yet.
    pub fn new_desired(
        priority: u32,
        host: Option<&str>,
        path: Option<&str>,
        backend: ServiceBackend,
    ) -> Self {
        Self {
            desired: Some(RuleDescriptor {
                arn: None,
                priority,
                conditions: RuleCondition::for_route(host, path),
                target_group_arn: None,
                is_default: false,
            }),
            current: None,
            backend: Some(backend),
            deleted: false,
        }
    }

    /// A rule as the cloud reports it, with nothing desired yet.
    pub fn from_cloud(descriptor: RuleDescriptor) -> Self {
        Self {
            desired: None,
            current: Some(descriptor),
            backend: None,
            deleted: false,
        }
    }

    /// Whether the rule matches on exactly `conditions`, judged by its
    /// current state, or its desired state when it does not exist yet.
    pub fn has_conditions(&self, conditions: &[RuleCondition]) -> bool {
        self.current
            .as_ref()
            .or(self.desired.as_ref())
            .is_some_and(|r| RuleCondition::same_set(&r.conditions, conditions))
    }

    /// Whether the current rule differs from `target`.
    pub fn needs_modification(&self, target: &RuleDescriptor) -> bool {
        let Some(current) = self.current.as_ref() else {
            return true;
        };
        if current.priority != target.priority {
            return true;
        }
        if !RuleCondition::same_set(&current.conditions, &target.conditions) {
            return true;
        }
        target.target_group_arn.is_some() && current.target_group_arn != target.target_group_arn
    }

    /// Drives the cloud rule towards the desired state.
    ///
    /// Creates, modifies or deletes the rule as needed. On success `current`
    /// reflects the cloud and `deleted` is set if the rule is gone.
    pub async fn reconcile(&mut self, api: &dyn ElbApi, ctx: &RuleContext<'_>) -> Result<()> {
        if self.desired.is_none() {
            return self.delete(api, ctx).await;
        }

        let target_group_arn = self.resolve_target_group(ctx)?;
        let Some(desired) = self.desired.as_mut() else {
            return Ok(());
        };
        desired.target_group_arn = Some(target_group_arn);
        let desired = desired.clone();

        match self.current.as_ref().and_then(|c| c.arn.clone()) {
            None => self.create(api, ctx, desired).await,
            Some(arn) if self.needs_modification(&desired) => {
                self.modify(api, ctx, &arn, desired).await
            }
            Some(arn) => {
                debug!(rule = %arn, priority = desired.priority, "Rule up to date");
                Ok(())
            }
        }
    }

    fn resolve_target_group(&self, ctx: &RuleContext<'_>) -> Result<String> {
        let desired = self.desired.as_ref();
        match &self.backend {
            Some(backend) => ctx
                .target_groups
                .lookup(backend)
                .map(|tg| tg.arn.clone())
                .ok_or_else(|| Error::TargetGroupNotFound(backend.to_string())),
            None => desired
                .and_then(|d| d.target_group_arn.clone())
                .ok_or_else(|| Error::NoBackend(desired.map(|d| d.priority).unwrap_or_default())),
        }
    }

    async fn create(
        &mut self,
        api: &dyn ElbApi,
        ctx: &RuleContext<'_>,
        desired: RuleDescriptor,
    ) -> Result<()> {
        info!(
            listener = %ctx.listener_arn,
            priority = desired.priority,
            conditions = ?desired.conditions,
            "Creating rule"
        );
        match api.create_rule(ctx.listener_arn, &desired).await {
            Ok(created) => {
                ctx.events.record(
                    EventType::Normal,
                    "CREATE",
                    &format!("{} rule created", created.priority),
                );
                self.current = Some(created);
                Ok(())
            }
            Err(e) => {
                ctx.events.record(
                    EventType::Warning,
                    "ERROR",
                    &format!("Error creating {} rule: {}", desired.priority, e),
                );
                Err(e.into())
            }
        }
    }

    async fn modify(
        &mut self,
        api: &dyn ElbApi,
        ctx: &RuleContext<'_>,
        arn: &str,
        desired: RuleDescriptor,
    ) -> Result<()> {
        info!(rule = %arn, priority = desired.priority, "Modifying rule");
        match api.modify_rule(arn, &desired).await {
            Ok(modified) => {
                ctx.events.record(
                    EventType::Normal,
                    "MODIFY",
                    &format!("{} rule modified", modified.priority),
                );
                self.current = Some(modified);
                Ok(())
            }
            Err(e) => {
                ctx.events.record(
                    EventType::Warning,
                    "ERROR",
                    &format!("Error modifying {} rule: {}", desired.priority, e),
                );
                Err(e.into())
            }
        }
    }

    /// Moves the cloud rule to `priority`, leaving everything else as is.
    async fn move_aside(
        &mut self,
        api: &dyn ElbApi,
        ctx: &RuleContext<'_>,
        priority: u32,
    ) -> Result<()> {
        let Some(current) = self.current.clone() else {
            return Ok(());
        };
        let Some(arn) = current.arn.clone() else {
            return Ok(());
        };

        let from = current.priority;
        debug!(rule = %arn, from, to = priority, "Moving rule aside");
        let parked = RuleDescriptor { priority, ..current };
        match api.modify_rule(&arn, &parked).await {
            Ok(modified) => {
                self.current = Some(modified);
                Ok(())
            }
            Err(e) => {
                ctx.events.record(
                    EventType::Warning,
                    "ERROR",
                    &format!("Error moving {} rule to {}: {}", from, priority, e),
                );
                Err(e.into())
            }
        }
    }

    async fn delete(&mut self, api: &dyn ElbApi, ctx: &RuleContext<'_>) -> Result<()> {
        let Some(current) = self.current.as_ref() else {
            self.deleted = true;
            return Ok(());
        };

        // Default rules live and die with their listener.
        if current.is_default {
            self.current = None;
            self.deleted = true;
            return Ok(());
        }

        let priority = current.priority;
        if let Some(arn) = current.arn.as_deref() {
            info!(rule = %arn, priority, "Deleting rule");
            if let Err(e) = api.delete_rule(arn).await {
                ctx.events.record(
                    EventType::Warning,
                    "ERROR",
                    &format!("Error deleting {} rule: {}", priority, e),
                );
                return Err(e.into());
            }
        }

        ctx.events.record(
            EventType::Normal,
            "DELETE",
            &format!("{} rule deleted", priority),
        );
        self.current = None;
        self.deleted = true;
        Ok(())
    }
}

/// The ordered rules of one listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rules(Vec<Rule>);

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<Rule> {
        self.0
    }

    /// Position of the first rule already satisfying `descriptor`.
    pub fn find(&self, descriptor: &RuleDescriptor) -> Option<usize> {
        self.0.iter().position(|r| !r.needs_modification(descriptor))
    }

    /// Reconciles every rule and returns the ones that still exist.
    ///
    /// Rules without desired state are deleted first, freeing their
    /// priorities. The rest are reconciled in order; a rule still holding a
    /// priority another rule wants is first moved to a spare priority above
    /// every one in use.
    ///
    /// Stops at the first failure; rules reconciled before it keep their
    /// cloud-side changes.
    pub async fn reconcile(self, api: &dyn ElbApi, ctx: &RuleContext<'_>) -> Result<Rules> {
        let (removed, mut kept): (Vec<Rule>, Vec<Rule>) =
            self.0.into_iter().partition(|r| r.desired.is_none());
        for mut rule in removed {
            rule.reconcile(api, ctx).await?;
        }

        let mut spare = kept
            .iter()
            .flat_map(|r| r.desired.iter().chain(r.current.iter()))
            .map(|d| d.priority)
            .max()
            .unwrap_or_default();

        for i in 0..kept.len() {
            let Some(wanted) = kept[i].desired.as_ref().map(|d| d.priority) else {
                continue;
            };
            let blocker = (0..kept.len()).find(|&j| {
                j != i
                    && kept[j]
                        .current
                        .as_ref()
                        .is_some_and(|c| !c.is_default && c.priority == wanted)
                    && kept[j].desired.as_ref().is_some_and(|d| d.priority != wanted)
            });
            if let Some(j) = blocker {
                spare = spare
                    .checked_add(1)
                    .filter(|p| *p <= MAX_RULE_PRIORITY)
                    .ok_or(AssemblyError::PriorityExhausted(spare.saturating_add(1)))?;
                kept[j].move_aside(api, ctx, spare).await?;
            }
            kept[i].reconcile(api, ctx).await?;
        }

        Ok(Rules(kept))
    }

    pub fn strip_desired_state(&mut self) {
        for rule in self.0.iter_mut() {
            rule.desired = None;
        }
    }

    pub fn strip_current_state(&mut self) {
        for rule in self.0.iter_mut() {
            rule.current = None;
        }
    }
}

impl Deref for Rules {
    type Target = Vec<Rule>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Rules {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Rule>> for Rules {
    fn from(rules: Vec<Rule>) -> Self {
        Self(rules)
    }
}

impl FromIterator<Rule> for Rules {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Rules {
    type Item = Rule;
    type IntoIter = std::vec::IntoIter<Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
