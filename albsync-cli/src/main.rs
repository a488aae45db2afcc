//! albsync: drive listener/rule reconciliation against a load balancer
//! state file.
//!
//! The state file stands in for the cloud: it is loaded into an in-memory
//! load balancer, reconciled against the routing declarations, and written
//! back with whatever the cycles changed.

use std::path::PathBuf;
use std::sync::Arc;

use albsync_engine::cloud::LoadBalancerState;
use albsync_engine::{
    build_from_cloud, run_cycle, Declarations, Events, Listeners, MemoryElb, ReconcileContext,
    TargetGroups, TracingRecorder,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabled::Table;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod state;
mod table;

use table::rows;

/// albsync - load balancer listener and rule reconciliation
#[derive(Parser, Debug)]
#[command(name = "albsync", version, about)]
struct Cli {
    /// Load balancer state file (JSON)
    #[arg(short, long, env = "ALBSYNC_STATE", default_value = "albsync-state.json")]
    state: PathBuf,

    /// Load balancer ARN, required when the state file does not exist yet
    #[arg(long, env = "ALBSYNC_LOAD_BALANCER_ARN")]
    load_balancer_arn: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile the load balancer against routing declarations.
    ///
    /// Listeners on ports that are no longer declared are left in place and
    /// are no longer tracked; remove them from the state file by hand.
    Apply {
        /// Routing declarations (JSON)
        #[arg(short, long)]
        declarations: PathBuf,

        /// Resolved target groups (JSON)
        #[arg(short, long)]
        target_groups: PathBuf,

        /// Number of reconciliation cycles to run
        #[arg(long, default_value = "1")]
        cycles: u32,

        /// Simulate the load balancer being destroyed and recreated first
        #[arg(long)]
        recreate: bool,

        /// Name of the routing resource events are reported for
        #[arg(long, default_value = "ingress")]
        object: String,

        /// Write the result here instead of back to the state file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not write any state
        #[arg(long)]
        dry_run: bool,
    },

    /// Show listeners and rules of the state file
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "albsync=info,albsync_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let current = state::load_state(&cli.state, cli.load_balancer_arn.as_deref()).await?;

    match cli.command {
        Commands::Apply {
            declarations,
            target_groups,
            cycles,
            recreate,
            object,
            output,
            dry_run,
        } => {
            let declarations: Declarations = state::load_json(&declarations).await?;
            let target_groups: TargetGroups = state::load_json(&target_groups).await?;
            let elb = MemoryElb::from_state(current.clone());
            let events: Events = Arc::new(TracingRecorder::new(object));
            let ctx = ReconcileContext::new(events, current.arn.clone(), target_groups);

            let result = apply(&elb, &ctx, &declarations, cycles, recreate).await;

            // Cloud changes made before a failure are kept, so the state is
            // written either way.
            let snapshot = elb
                .snapshot(&current.arn)
                .context("Load balancer missing from state")?;
            if !dry_run {
                let path = output.as_ref().unwrap_or(&cli.state);
                state::save_state(path, &snapshot).await?;
                info!(path = %path.display(), "State written");
            }
            print_state(&snapshot);

            if let Err(e) = &result {
                error!("Reconciliation failed: {:#}", e);
            }
            result
        }
        Commands::Show => {
            print_state(&current);
            Ok(())
        }
    }
}

/// Runs `cycles` reconciliation cycles, each starting from the previous result.
///
/// Cloud listeners on undeclared ports are never deleted.
async fn apply(
    elb: &MemoryElb,
    ctx: &ReconcileContext,
    declarations: &Declarations,
    cycles: u32,
    recreate: bool,
) -> Result<()> {
    let mut listeners: Listeners = build_from_cloud(elb, &ctx.load_balancer_arn)
        .await
        .context("Failed to load listeners")?;

    if recreate {
        info!(load_balancer = %ctx.load_balancer_arn, "Recreating load balancer");
        elb.recreate_load_balancer(&ctx.load_balancer_arn)?;
        listeners.strip_current_state();
    }

    for cycle in 1..=cycles {
        elb.clear_calls();
        listeners = run_cycle(elb, ctx, declarations, listeners)
            .await
            .with_context(|| format!("Reconciliation cycle {} failed", cycle))?;
        info!(
            cycle,
            listeners = listeners.len(),
            mutations = elb.mutations().len(),
            "Cycle complete"
        );
    }
    Ok(())
}

fn print_state(state: &LoadBalancerState) {
    println!("Load balancer: {}", state.arn);
    let rows = rows(state);
    if rows.is_empty() {
        println!("No listeners found");
    } else {
        println!("{}", Table::new(rows));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use albsync_engine::{
        HostRule, ListenerPort, MemoryRecorder, PathRule, ServiceBackend, TargetGroup,
    };

    const LB: &str = "arn:lb/app/cli";

    fn declarations() -> Declarations {
        Declarations {
            ports: vec![ListenerPort::http(80)],
            certificate_arn: None,
            default_backend: None,
            rules: vec![HostRule {
                host: Some("a.com".to_string()),
                paths: vec![PathRule {
                    path: Some("/".to_string()),
                    backend: ServiceBackend::new("web", 80),
                }],
                ports: vec![],
            }],
        }
    }

    fn context() -> ReconcileContext {
        ReconcileContext::new(
            Arc::new(MemoryRecorder::new()),
            LB,
            TargetGroups::new(vec![TargetGroup {
                arn: "arn:tg/web".to_string(),
                backend: ServiceBackend::new("web", 80),
            }]),
        )
    }

    #[tokio::test]
    async fn test_apply_converges_over_cycles() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        apply(&elb, &context(), &declarations(), 3, false)
            .await
            .unwrap();

        let snapshot = elb.snapshot(LB).unwrap();
        assert_eq!(snapshot.listeners.len(), 1);
        assert_eq!(snapshot.listeners[0].rules.len(), 2);
        // The last cycle had nothing left to do.
        assert!(elb.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_apply_recreate_replaces_listener() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = context();
        apply(&elb, &ctx, &declarations(), 1, false).await.unwrap();
        let before = elb.snapshot(LB).unwrap().listeners[0].listener.arn.clone();

        apply(&elb, &ctx, &declarations(), 1, true).await.unwrap();
        let after = elb.snapshot(LB).unwrap();
        assert_eq!(after.listeners.len(), 1);
        assert_ne!(after.listeners[0].listener.arn, before);
    }

    #[tokio::test]
    async fn test_apply_leaves_undeclared_listener_in_place() {
        let elb = MemoryElb::new().with_load_balancer(LB);
        let ctx = context();
        let mut both = declarations();
        both.ports.push(ListenerPort::http(8080));
        apply(&elb, &ctx, &both, 1, false).await.unwrap();

        elb.clear_calls();
        apply(&elb, &ctx, &declarations(), 1, false).await.unwrap();

        assert!(elb.mutations().is_empty());
        let ports: Vec<u16> = elb
            .snapshot(LB)
            .unwrap()
            .listeners
            .iter()
            .map(|l| l.listener.port)
            .collect();
        assert_eq!(ports, vec![80, 8080]);
    }

    #[tokio::test]
    async fn test_apply_samples() {
        let samples = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("samples");
        let declarations: Declarations = state::load_json(&samples.join("declarations.json"))
            .await
            .unwrap();
        let target_groups: TargetGroups = state::load_json(&samples.join("target-groups.json"))
            .await
            .unwrap();
        let ctx = ReconcileContext::new(Arc::new(MemoryRecorder::new()), LB, target_groups);
        let elb = MemoryElb::new().with_load_balancer(LB);

        apply(&elb, &ctx, &declarations, 1, false).await.unwrap();

        let rows = rows(&elb.snapshot(LB).unwrap());
        // 80: default + 2 shop rules; 443: default + 2 shop rules + admin.
        assert_eq!(rows.len(), 7);
        assert_eq!(rows.iter().filter(|r| r.port == 443).count(), 4);
    }

    #[test]
    fn test_cli_parses_apply() {
        let cli = Cli::try_parse_from([
            "albsync",
            "--state",
            "lb.json",
            "apply",
            "--declarations",
            "ingress.json",
            "--target-groups",
            "tgs.json",
            "--cycles",
            "2",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.state, PathBuf::from("lb.json"));
        match cli.command {
            Commands::Apply {
                cycles, dry_run, ..
            } => {
                assert_eq!(cycles, 2);
                assert!(dry_run);
            }
            Commands::Show => panic!("expected apply"),
        }
    }
}
