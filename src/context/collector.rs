use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::context::{AllocationContext, ContextId};

/// Point-in-time view of one collectible context, captured under the domain's graph
/// lock so counts and edges are mutually consistent.
pub(crate) struct ContextSnapshot {
    pub(crate) id: ContextId,
    pub(crate) references: u64,
    pub(crate) edges: Vec<ContextId>,
}

/// Outcome of one [`run_collection_pass`](crate::domain::Domain::run_collection_pass).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionSummary {
    /// Contexts torn down by the pass, across all rounds.
    pub contexts_collected: usize,
    /// Plan/sweep rounds the pass ran. Teardown of one round can drop the last
    /// external count on another context, so a pass keeps re-planning until a round
    /// sweeps nothing.
    pub rounds: usize,
}

/// Decides which snapshotted contexts are garbage.
///
/// The reference count alone cannot distinguish "held by the host" from "held only by
/// other doomed contexts", so the plan subtracts the counts that context-to-context
/// edges account for: a context whose count exceeds its in-degree from snapshotted
/// contexts is provably referenced from outside the graph and becomes a root.
/// Everything reachable from a root is kept; the rest is returned for sweeping.
///
/// Pure function over the snapshot. The caller holds the graph lock, so no edge can
/// appear or disappear between snapshot and sweep.
pub(crate) fn plan_collection(snapshot: &[ContextSnapshot]) -> Vec<ContextId> {
    let by_id: HashMap<ContextId, &ContextSnapshot> =
        snapshot.iter().map(|ctx| (ctx.id, ctx)).collect();

    let mut in_degree: HashMap<ContextId, u64> = HashMap::new();
    for ctx in snapshot {
        for &target in &ctx.edges {
            if target != ctx.id && by_id.contains_key(&target) {
                *in_degree.entry(target).or_insert(0) += 1;
            }
        }
    }

    let mut worklist: Vec<ContextId> = snapshot
        .iter()
        .filter(|ctx| ctx.references > in_degree.get(&ctx.id).copied().unwrap_or(0))
        .map(|ctx| ctx.id)
        .collect();

    let mut reachable: HashSet<ContextId> = worklist.iter().copied().collect();
    while let Some(id) = worklist.pop() {
        let Some(ctx) = by_id.get(&id) else { continue };
        for &target in &ctx.edges {
            if by_id.contains_key(&target) && reachable.insert(target) {
                worklist.push(target);
            }
        }
    }

    snapshot
        .iter()
        .filter(|ctx| !reachable.contains(&ctx.id))
        .map(|ctx| ctx.id)
        .collect()
}

/// Stamps the scratch mark bit on every snapshotted context so diagnostics can see
/// which contexts the last plan considered reachable.
pub(crate) fn apply_marks(
    snapshot: &[ContextSnapshot],
    doomed: &HashSet<ContextId>,
    resolve: impl Fn(ContextId) -> Option<Arc<AllocationContext>>,
) {
    for ctx in snapshot {
        if let Some(live) = resolve(ctx.id) {
            live.set_marked(!doomed.contains(&ctx.id));
        }
    }
}

/// Holds its context quiesced for the duration of a teardown step. New work is barred
/// while the scope lives; the flag drops with the scope even if teardown unwinds.
pub(crate) struct QuiesceScope {
    ctx: Arc<AllocationContext>,
}

impl QuiesceScope {
    pub(crate) fn enter(ctx: &Arc<AllocationContext>) -> QuiesceScope {
        ctx.set_quiesced(true);
        QuiesceScope {
            ctx: Arc::clone(ctx),
        }
    }
}

impl Drop for QuiesceScope {
    fn drop(&mut self) {
        self.ctx.set_quiesced(false);
    }
}
