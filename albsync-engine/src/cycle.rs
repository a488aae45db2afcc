//! One reconciliation cycle: assemble, then reconcile.

use tracing::info;

use crate::assembly::build_from_declarations;
use crate::cloud::ElbApi;
use crate::context::ReconcileContext;
use crate::error::Result;
use crate::listener::Listeners;
use crate::model::Declarations;

/// Assembles listeners from `declarations` on top of the previous cycle's
/// listeners and drives them to convergence.
///
/// The returned collection replaces `previous` for the next cycle. On error
/// the caller keeps nothing from this cycle and should rebuild from the
/// cloud before retrying.
pub async fn run_cycle(
    api: &dyn ElbApi,
    ctx: &ReconcileContext,
    declarations: &Declarations,
    previous: Listeners,
) -> Result<Listeners> {
    let listeners = build_from_declarations(declarations, previous)?;
    info!(
        load_balancer = %ctx.load_balancer_arn,
        listeners = listeners.len(),
        rules = listeners.iter().map(|l| l.rules.len()).sum::<usize>(),
        "Reconciling listeners"
    );
    listeners.reconcile(api, ctx).await
}
