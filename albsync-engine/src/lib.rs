//! albsync engine
//!
//! Keeps the listeners and rules of an application load balancer in sync
//! with routing declarations. Every resource is held as a desired/current
//! pair; assemblers fill the desired half from declarations, and the
//! cascading reconciler issues the cloud calls that bring the current half
//! in line with it.
//!
//! # Example
//! ```ignore
//! use albsync_engine::{build_from_cloud, run_cycle, ReconcileContext};
//!
//! let previous = build_from_cloud(&elb, &lb_arn).await?;
//! let ctx = ReconcileContext::new(events, lb_arn, target_groups);
//! let listeners = run_cycle(&elb, &ctx, &declarations, previous).await?;
//! ```

pub mod assembly;
pub mod cloud;
pub mod context;
pub mod cycle;
pub mod error;
pub mod events;
pub mod listener;
pub mod model;
pub mod rule;

pub use assembly::{assemble_rules, build_from_declarations};
pub use cloud::{CloudError, ElbApi, MemoryElb, Operation};
pub use context::{ListenerContext, ReconcileContext, RuleContext};
pub use cycle::run_cycle;
pub use error::{AssemblyError, Error, Result};
pub use events::{EventRecorder, EventType, Events, MemoryRecorder, TracingRecorder};
pub use listener::{build_from_cloud, Listener, Listeners};
pub use model::{
    Declarations, HostRule, ListenerDescriptor, ListenerPort, PathRule, Protocol, RuleCondition,
    RuleDescriptor, ServiceBackend, TargetGroup, TargetGroups,
};
pub use rule::{Rule, Rules};
