//! Listeners - desired/current pairs, their rules, and the cascading
//! reconciler over a load balancer's listener collection.

use std::ops::{Deref, DerefMut};

use tracing::{debug, info};

use crate::cloud::ElbApi;
use crate::context::{ListenerContext, ReconcileContext};
use crate::error::{Error, Result};
use crate::events::EventType;
use crate::model::{ListenerDescriptor, ListenerPort, Protocol, ServiceBackend};
use crate::rule::{Rule, Rules};

/// A load balancer listener and the rules it owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listener {
    pub desired: Option<ListenerDescriptor>,
    pub current: Option<ListenerDescriptor>,
    /// Backend of the default action, resolved to a target group on reconcile.
    pub default_backend: Option<ServiceBackend>,
    pub rules: Rules,
    pub deleted: bool,
}

impl Listener {
    /// A listener that does not exist in the cloud yet.
    ///
    /// Only HTTPS listeners carry the certificate.
    pub fn new_desired(
        port: &ListenerPort,
        certificate_arn: Option<&str>,
        default_backend: Option<ServiceBackend>,
    ) -> Self {
        let certificate_arn = match port.protocol {
            Protocol::Https => certificate_arn.map(str::to_string),
            Protocol::Http => None,
        };
        Self {
            desired: Some(ListenerDescriptor {
                arn: None,
                port: port.port,
                protocol: port.protocol,
                certificate_arn,
                default_target_group_arn: None,
            }),
            current: None,
            default_backend,
            rules: Rules::new(),
            deleted: false,
        }
    }

    /// A listener as the cloud reports it, with nothing desired yet.
    pub fn from_cloud(descriptor: ListenerDescriptor, rules: Rules) -> Self {
        Self {
            desired: None,
            current: Some(descriptor),
            default_backend: None,
            rules,
            deleted: false,
        }
    }

    /// The port the listener is bound to in the cloud.
    pub fn current_port(&self) -> Option<u16> {
        self.current.as_ref().map(|c| c.port)
    }

    pub fn current_arn(&self) -> Option<&str> {
        self.current.as_ref().and_then(|c| c.arn.as_deref())
    }

    /// Whether the current listener differs from `target`.
    pub fn needs_modification(&self, target: &ListenerDescriptor) -> bool {
        let Some(current) = self.current.as_ref() else {
            return true;
        };
        if current.port != target.port || current.protocol != target.protocol {
            return true;
        }
        if current.certificate_arn != target.certificate_arn {
            return true;
        }
        target.default_target_group_arn.is_some()
            && current.default_target_group_arn != target.default_target_group_arn
    }

    /// Drives the cloud listener towards the desired state.
    ///
    /// Does not touch the rules; the collection reconciler handles them once
    /// the listener exists.
    pub async fn reconcile(&mut self, api: &dyn ElbApi, ctx: &ListenerContext<'_>) -> Result<()> {
        let Some(desired) = self.desired.as_ref() else {
            return self.delete(api, ctx).await;
        };

        let mut desired = desired.clone();
        desired.default_target_group_arn = Some(self.resolve_default_target_group(ctx, &desired)?);
        self.desired = Some(desired.clone());

        match self.current_arn().map(str::to_string) {
            None => self.create(api, ctx, desired).await,
            Some(arn) if self.needs_modification(&desired) => {
                self.modify(api, ctx, &arn, desired).await
            }
            Some(arn) => {
                debug!(listener = %arn, port = desired.port, "Listener up to date");
                Ok(())
            }
        }
    }

    fn resolve_default_target_group(
        &self,
        ctx: &ListenerContext<'_>,
        desired: &ListenerDescriptor,
    ) -> Result<String> {
        let declared = self
            .default_backend
            .as_ref()
            .and_then(|backend| ctx.target_groups.lookup(backend));
        declared
            .or_else(|| ctx.target_groups.first())
            .map(|tg| tg.arn.clone())
            .or_else(|| desired.default_target_group_arn.clone())
            .ok_or(Error::NoDefaultTargetGroup(desired.port))
    }

    async fn create(
        &mut self,
        api: &dyn ElbApi,
        ctx: &ListenerContext<'_>,
        desired: ListenerDescriptor,
    ) -> Result<()> {
        info!(
            load_balancer = %ctx.load_balancer_arn,
            port = desired.port,
            protocol = %desired.protocol,
            "Creating listener"
        );
        match api.create_listener(ctx.load_balancer_arn, &desired).await {
            Ok(created) => {
                ctx.events.record(
                    EventType::Normal,
                    "CREATE",
                    &format!("{} listener created", created.port),
                );
                self.current = Some(created);
                Ok(())
            }
            Err(e) => {
                ctx.events.record(
                    EventType::Warning,
                    "ERROR",
                    &format!("Error creating {} listener: {}", desired.port, e),
                );
                Err(e.into())
            }
        }
    }

    async fn modify(
        &mut self,
        api: &dyn ElbApi,
        ctx: &ListenerContext<'_>,
        arn: &str,
        desired: ListenerDescriptor,
    ) -> Result<()> {
        info!(listener = %arn, port = desired.port, "Modifying listener");
        match api.modify_listener(arn, &desired).await {
            Ok(modified) => {
                ctx.events.record(
                    EventType::Normal,
                    "MODIFY",
                    &format!("{} listener modified", modified.port),
                );
                self.current = Some(modified);
                Ok(())
            }
            Err(e) => {
                ctx.events.record(
                    EventType::Warning,
                    "ERROR",
                    &format!("Error modifying {} listener: {}", desired.port, e),
                );
                Err(e.into())
            }
        }
    }

    async fn delete(&mut self, api: &dyn ElbApi, ctx: &ListenerContext<'_>) -> Result<()> {
        let Some(current) = self.current.as_ref() else {
            self.deleted = true;
            return Ok(());
        };

        let port = current.port;
        if let Some(arn) = current.arn.as_deref() {
            info!(listener = %arn, port, "Deleting listener");
            if let Err(e) = api.delete_listener(arn).await {
                ctx.events.record(
                    EventType::Warning,
                    "ERROR",
                    &format!("Error deleting {} listener: {}", port, e),
                );
                return Err(e.into());
            }
        }

        ctx.events.record(
            EventType::Normal,
            "DELETE",
            &format!("{} listener deleted", port),
        );
        self.current = None;
        self.deleted = true;
        Ok(())
    }
}

/// The listeners of one load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listeners(Vec<Listener>);

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<Listener> {
        self.0
    }

    /// Builds listeners from cloud descriptors, fetching each listener's rules.
    ///
    /// Default rules are left out; the listener's default action owns them.
    pub async fn from_cloud(
        api: &dyn ElbApi,
        descriptors: Vec<ListenerDescriptor>,
    ) -> Result<Self> {
        let mut output = Listeners::new();
        for descriptor in descriptors {
            let Some(arn) = descriptor.arn.clone() else {
                debug!(port = descriptor.port, "Skipping listener without ARN");
                continue;
            };

            info!(listener = %arn, "Fetching rules for listener");
            let rules: Rules = api
                .describe_rules(&arn)
                .await?
                .into_iter()
                .filter(|rule| !rule.is_default)
                .inspect(|rule| {
                    debug!(
                        priority = rule.priority,
                        conditions = ?rule.conditions,
                        "Assembling rule"
                    )
                })
                .map(Rule::from_cloud)
                .collect();

            output.0.push(Listener::from_cloud(descriptor, rules));
        }
        Ok(output)
    }

    /// Position of the first listener already satisfying `descriptor`.
    pub fn find(&self, descriptor: &ListenerDescriptor) -> Option<usize> {
        self.0.iter().position(|l| !l.needs_modification(descriptor))
    }

    /// Reconciles every listener and then its rules, in order.
    ///
    /// Returns the listeners that still exist. The first failure aborts the
    /// walk and discards the collection; cloud changes made before it stay.
    pub async fn reconcile(self, api: &dyn ElbApi, ctx: &ReconcileContext) -> Result<Listeners> {
        if self.0.is_empty() {
            return Ok(Listeners::new());
        }

        let listener_ctx = ctx.listener();
        let mut output = Listeners::new();
        for mut listener in self.0 {
            listener.reconcile(api, &listener_ctx).await?;

            let mut rules = std::mem::take(&mut listener.rules);
            match listener.current_arn().map(str::to_string) {
                Some(arn) => {
                    listener.rules = rules.reconcile(api, &listener_ctx.rules(&arn)).await?;
                }
                None => {
                    // Removing a listener removes its rules with it.
                    debug!(rules = rules.len(), "Listener gone, dropping its rules");
                    rules.strip_current_state();
                }
            }

            if !listener.deleted {
                output.0.push(listener);
            }
        }
        Ok(output)
    }

    pub fn strip_desired_state(&mut self) {
        for listener in self.0.iter_mut() {
            listener.desired = None;
        }
    }

    /// Forgets the cloud state of every listener and rule, for when the load
    /// balancer was destroyed and everything beneath it went with it.
    pub fn strip_current_state(&mut self) {
        for listener in self.0.iter_mut() {
            listener.current = None;
            listener.rules.strip_current_state();
        }
    }
}

impl Deref for Listeners {
    type Target = Vec<Listener>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Listeners {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Listener>> for Listeners {
    fn from(listeners: Vec<Listener>) -> Self {
        Self(listeners)
    }
}

impl FromIterator<Listener> for Listeners {
    fn from_iter<I: IntoIterator<Item = Listener>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Listeners {
    type Item = Listener;
    type IntoIter = std::vec::IntoIter<Listener>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Loads the listeners and rules of a load balancer from the cloud.
pub async fn build_from_cloud(api: &dyn ElbApi, load_balancer_arn: &str) -> Result<Listeners> {
    debug!(load_balancer = %load_balancer_arn, "Fetching listeners");
    let descriptors = api.describe_listeners(load_balancer_arn).await?;
    Listeners::from_cloud(api, descriptors).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cloud::{CloudError, MemoryElb, Operation};
    use crate::events::MemoryRecorder;
    use crate::model::{RuleCondition, RuleDescriptor, TargetGroup, TargetGroups};

    const LB: &str = "arn:lb/app/test";

    fn target_groups() -> TargetGroups {
        TargetGroups::new(vec![
            TargetGroup {
                arn: "tg-web".to_string(),
                backend: ServiceBackend::new("web", 80),
            },
            TargetGroup {
                arn: "tg-api".to_string(),
                backend: ServiceBackend::new("api", 80),
            },
        ])
    }

    fn context(events: Arc<MemoryRecorder>) -> ReconcileContext {
        ReconcileContext::new(events, LB, target_groups())
    }

    fn listener_with_rule(port: u16, host: &str) -> Listener {
        let mut listener = Listener::new_desired(&ListenerPort::http(port), None, None);
        listener.rules.push(Rule::new_desired(
            1,
            Some(host),
            None,
            ServiceBackend::new("api", 80),
        ));
        listener
    }

    fn current(arn: &str, port: u16) -> ListenerDescriptor {
        ListenerDescriptor {
            arn: Some(arn.to_string()),
            port,
            protocol: Protocol::Http,
            certificate_arn: None,
            default_target_group_arn: Some("tg-web".to_string()),
        }
    }

    #[test]
    fn test_new_desired_keeps_certificate_for_https_only() {
        let https = Listener::new_desired(&ListenerPort::https(443), Some("arn:cert"), None);
        let http = Listener::new_desired(&ListenerPort::http(80), Some("arn:cert"), None);

        assert_eq!(
            https.desired.unwrap().certificate_arn.as_deref(),
            Some("arn:cert")
        );
        assert!(http.desired.unwrap().certificate_arn.is_none());
    }

    #[test]
    fn test_find_matches_on_current_state() {
        let listeners: Listeners = vec![
            Listener::new_desired(&ListenerPort::http(80), None, None),
            Listener::from_cloud(current("arn:l/80", 80), Rules::new()),
            Listener::from_cloud(current("arn:l/8080", 8080), Rules::new()),
        ]
        .into();

        assert_eq!(listeners.find(&current("arn:l/80", 80)), Some(1));
        assert_eq!(listeners.find(&current("arn:l/8080", 8080)), Some(2));
        assert_eq!(listeners.find(&current("arn:l/81", 81)), None);

        let tls = ListenerDescriptor {
            protocol: Protocol::Https,
            certificate_arn: Some("arn:cert".to_string()),
            ..current("arn:l/80", 80)
        };
        assert_eq!(listeners.find(&tls), None);
    }

    #[tokio::test]
    async fn test_reconcile_empty_is_noop() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = context(Arc::new(MemoryRecorder::new()));

        let result = Listeners::new().reconcile(&elb, &ctx).await.unwrap();
        assert!(result.is_empty());
        assert!(elb.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_creates_listener_then_rules() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let events = Arc::new(MemoryRecorder::new());
        let ctx = context(Arc::clone(&events));

        let listeners: Listeners = vec![listener_with_rule(80, "a.com")].into();
        let listeners = listeners.reconcile(&elb, &ctx).await.unwrap();

        assert_eq!(listeners.len(), 1);
        let listener = &listeners[0];
        let arn = listener.current_arn().unwrap();
        assert_eq!(
            listener.current.as_ref().unwrap().default_target_group_arn.as_deref(),
            Some("tg-web")
        );
        assert!(listener.rules[0]
            .current
            .as_ref()
            .unwrap()
            .arn
            .as_deref()
            .unwrap()
            .starts_with(arn));
        assert_eq!(
            elb.mutations(),
            vec![Operation::CreateListener, Operation::CreateRule]
        );
        assert_eq!(events.reasons(), vec!["CREATE", "CREATE"]);
    }

    #[tokio::test]
    async fn test_reconcile_declared_default_backend() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = context(Arc::new(MemoryRecorder::new()));

        let listener = Listener::new_desired(
            &ListenerPort::http(80),
            None,
            Some(ServiceBackend::new("api", 80)),
        );
        let listeners = Listeners::from(vec![listener])
            .reconcile(&elb, &ctx)
            .await
            .unwrap();

        assert_eq!(
            listeners[0]
                .current
                .as_ref()
                .unwrap()
                .default_target_group_arn
                .as_deref(),
            Some("tg-api")
        );
    }

    #[tokio::test]
    async fn test_reconcile_without_target_groups_fails() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = ReconcileContext::new(Arc::new(MemoryRecorder::new()), LB, TargetGroups::default());

        let listeners: Listeners =
            vec![Listener::new_desired(&ListenerPort::http(80), None, None)].into();
        let err = listeners.reconcile(&elb, &ctx).await.unwrap_err();

        assert!(matches!(err, Error::NoDefaultTargetGroup(80)));
        assert!(elb.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_fails_fast() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let events = Arc::new(MemoryRecorder::new());
        let ctx = context(Arc::clone(&events));
        elb.fail_after(Operation::CreateListener, 1);

        let listeners: Listeners = vec![
            listener_with_rule(80, "a.com"),
            listener_with_rule(8080, "a.com"),
            listener_with_rule(9090, "a.com"),
        ]
        .into();
        let err = listeners.reconcile(&elb, &ctx).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Cloud(CloudError::Api {
                operation: Operation::CreateListener,
                ..
            })
        ));
        // The first listener and its rule were applied and stay applied.
        assert_eq!(elb.snapshot(LB).unwrap().listeners.len(), 1);
        assert_eq!(
            elb.mutations(),
            vec![
                Operation::CreateListener,
                Operation::CreateRule,
                Operation::CreateListener
            ]
        );
        assert_eq!(events.reasons(), vec!["CREATE", "CREATE", "ERROR"]);
    }

    #[tokio::test]
    async fn test_reconcile_deleted_listener_takes_rules_along() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = context(Arc::new(MemoryRecorder::new()));

        let listeners: Listeners = vec![listener_with_rule(80, "a.com")].into();
        let mut listeners = listeners.reconcile(&elb, &ctx).await.unwrap();
        listeners.strip_desired_state();
        listeners[0].rules.strip_desired_state();
        elb.clear_calls();

        let listeners = listeners.reconcile(&elb, &ctx).await.unwrap();
        assert!(listeners.is_empty());
        assert_eq!(elb.mutations(), vec![Operation::DeleteListener]);
        assert!(elb.snapshot(LB).unwrap().listeners.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_modifies_certificate() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = context(Arc::new(MemoryRecorder::new()));

        let listener = Listener::new_desired(&ListenerPort::https(443), Some("arn:cert/1"), None);
        let mut listeners = Listeners::from(vec![listener])
            .reconcile(&elb, &ctx)
            .await
            .unwrap();
        listeners[0].desired.as_mut().unwrap().certificate_arn = Some("arn:cert/2".to_string());
        elb.clear_calls();

        let listeners = listeners.reconcile(&elb, &ctx).await.unwrap();
        assert_eq!(elb.mutations(), vec![Operation::ModifyListener]);
        assert_eq!(
            listeners[0].current.as_ref().unwrap().certificate_arn.as_deref(),
            Some("arn:cert/2")
        );
    }

    #[tokio::test]
    async fn test_build_from_cloud_skips_default_rules() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = context(Arc::new(MemoryRecorder::new()));
        let listeners: Listeners = vec![listener_with_rule(80, "a.com")].into();
        listeners.reconcile(&elb, &ctx).await.unwrap();

        let listeners = build_from_cloud(&elb, LB).await.unwrap();
        assert_eq!(listeners.len(), 1);
        assert!(listeners[0].desired.is_none());
        assert_eq!(listeners[0].current_port(), Some(80));
        assert_eq!(listeners[0].rules.len(), 1);
        let rule: &RuleDescriptor = listeners[0].rules[0].current.as_ref().unwrap();
        assert_eq!(rule.conditions, RuleCondition::for_route(Some("a.com"), None));
    }

    #[tokio::test]
    async fn test_build_from_cloud_aborts_on_fetch_error() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = context(Arc::new(MemoryRecorder::new()));
        let listeners: Listeners = vec![
            listener_with_rule(80, "a.com"),
            listener_with_rule(8080, "b.com"),
        ]
        .into();
        listeners.reconcile(&elb, &ctx).await.unwrap();
        elb.fail_after(Operation::DescribeRules, 1);

        let err = build_from_cloud(&elb, LB).await.unwrap_err();
        assert!(matches!(err, Error::Cloud(_)));
    }

    #[test]
    fn test_strip_current_cascades_to_rules() {
        let rules: Rules = vec![Rule::from_cloud(RuleDescriptor {
            arn: Some("arn:rule/1".to_string()),
            priority: 1,
            conditions: RuleCondition::for_route(Some("a.com"), None),
            target_group_arn: Some("tg-web".to_string()),
            is_default: false,
        })]
        .into();
        let mut listeners: Listeners = vec![Listener::from_cloud(current("arn:l/80", 80), rules)].into();

        listeners.strip_current_state();
        assert!(listeners[0].current.is_none());
        assert!(listeners[0].rules.iter().all(|r| r.current.is_none()));
    }
}
