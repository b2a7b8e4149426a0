//! Three-tier budget semaphore (`spec.md` §4.1 "Concurrency & budgets").
//!
//! Acquisition order is fixed — parallelism group, then workload kind, then
//! namespace — so two nodes can never deadlock waiting on each other's
//! permits in the opposite order.

use std::{collections::HashMap, sync::Arc};

use ktl_config::SchedulerConfig;
use ktl_protocol::{NodeId, ParallelismGroup, RunNode, WorkloadKind};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Held permits for one running node. Dropping it (including on
/// cancellation, since an unacquired future never produced one) releases
/// every permit it holds, in reverse acquisition order.
pub struct BudgetGuard {
    _group: Option<OwnedSemaphorePermit>,
    _kind: Option<OwnedSemaphorePermit>,
    _namespace: Option<OwnedSemaphorePermit>,
}

pub struct BudgetController {
    group: HashMap<ParallelismGroup, Arc<Semaphore>>,
    kind: HashMap<WorkloadKind, Arc<Semaphore>>,
    namespace: HashMap<String, Arc<Semaphore>>,
}

impl BudgetController {
    /// Builds one semaphore per distinct group/kind/namespace referenced by
    /// `nodes`, sized from `config`. Kinds absent from
    /// `maxConcurrencyByKind` and namespaces when the per-namespace cap is
    /// `0` stay uncapped (no semaphore, no wait).
    pub fn new(nodes: &[RunNode], config: &SchedulerConfig) -> Self {
        let mut group = HashMap::new();
        let mut kind = HashMap::new();
        let mut namespace = HashMap::new();

        for node in nodes {
            if let Some(g) = &node.parallelism_group {
                group
                    .entry(g.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(config.parallelism_group_limit)));
            }
            if let Some(k) = &node.primary_kind {
                if let Some(&limit) = config.max_concurrency_by_kind.get(&k.0) {
                    kind.entry(k.clone())
                        .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))));
                }
            }
            if config.max_concurrency_per_namespace > 0 {
                if let Some((_, ns, _)) = node.id.parts() {
                    namespace
                        .entry(ns.to_string())
                        .or_insert_with(|| {
                            Arc::new(Semaphore::new(config.max_concurrency_per_namespace))
                        });
                }
            }
        }

        Self { group, kind, namespace }
    }

    /// Acquires, in fixed order, every permit `node` needs. `on_first_wait`
    /// fires at most once, the first time any tier would have to suspend —
    /// callers use it to emit `BUDGET_WAIT` (`spec.md` §4.1).
    pub async fn acquire(
        &self,
        node: &RunNode,
        cancel: &CancellationToken,
        mut on_first_wait: impl FnMut(),
    ) -> Option<BudgetGuard> {
        let group_sem = node.parallelism_group.as_ref().and_then(|g| self.group.get(g));
        let kind_sem = node.primary_kind.as_ref().and_then(|k| self.kind.get(k));
        let namespace_sem = node
            .id
            .parts()
            .and_then(|(_, ns, _)| self.namespace.get(ns));

        let mut waited = false;

        let group_permit = if let Some(sem) = group_sem {
            Some(acquire_one(sem, cancel, &mut waited, &mut on_first_wait).await?)
        } else {
            None
        };

        let kind_permit = if let Some(sem) = kind_sem {
            Some(acquire_one(sem, cancel, &mut waited, &mut on_first_wait).await?)
        } else {
            None
        };

        let namespace_permit = if let Some(sem) = namespace_sem {
            Some(acquire_one(sem, cancel, &mut waited, &mut on_first_wait).await?)
        } else {
            None
        };

        Some(BudgetGuard {
            _group: group_permit,
            _kind: kind_permit,
            _namespace: namespace_permit,
        })
    }
}

async fn acquire_one(
    sem: &Arc<Semaphore>,
    cancel: &CancellationToken,
    waited: &mut bool,
    on_first_wait: &mut impl FnMut(),
) -> Option<OwnedSemaphorePermit> {
    if let Ok(permit) = Arc::clone(sem).try_acquire_owned() {
        return Some(permit);
    }
    if !*waited {
        *waited = true;
        on_first_wait();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(sem).acquire_owned() => permit.ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::NodeStatus;

    fn node_with(group: Option<&str>, kind: Option<&str>, id: &str) -> RunNode {
        RunNode {
            id: NodeId(id.into()),
            needs: vec![],
            parallelism_group: group.map(|g| ParallelismGroup(g.into())),
            primary_kind: kind.map(|k| WorkloadKind(k.into())),
            critical: false,
            attempt: 0,
            input_hash: "h".into(),
            status: NodeStatus::Planned,
            execution_group: 0,
        }
    }

    #[tokio::test]
    async fn group_limit_serializes_co_members() {
        let nodes = vec![
            node_with(Some("db"), None, "c/ns/a"),
            node_with(Some("db"), None, "c/ns/b"),
        ];
        let mut config = SchedulerConfig::default();
        config.parallelism_group_limit = 1;
        let controller = BudgetController::new(&nodes, &config);
        let cancel = CancellationToken::new();

        let first = controller.acquire(&nodes[0], &cancel, || {}).await.unwrap();
        let mut waited = false;
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            controller.acquire(&nodes[1], &cancel, || waited = true),
        )
        .await;
        assert!(second.is_err());
        drop(first);
        assert!(controller.acquire(&nodes[1], &cancel, || {}).await.is_some());
    }

    #[tokio::test]
    async fn uncapped_kind_never_waits() {
        let nodes = vec![node_with(None, Some("Deployment"), "c/ns/a")];
        let config = SchedulerConfig::default();
        let controller = BudgetController::new(&nodes, &config);
        let cancel = CancellationToken::new();
        assert!(controller.acquire(&nodes[0], &cancel, || {}).await.is_some());
    }
}
