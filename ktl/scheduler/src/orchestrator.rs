//! Runner Orchestrator (C6): composes the plan graph, FSM, retry policy,
//! budgets, and adaptive concurrency into one `Execute(Run) → Result`
//! (`spec.md` §4.1).

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use ktl_config::{LockConfig, SchedulerConfig};
use ktl_protocol::{
    domain::NodeErrorDigest, EventKind, Fields, LockLease, NodeError, NodeExecutor,
    NodeExecutorError, NodeId, NewEvent, NodeStatus, Run, RunCommand, RunEvent, RunEventObserver,
    RunId, RunNode, RunNodeSummary, RunSummary, RunTotals,
};
use ktl_store::Store;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    adaptive::{AdaptiveController, ConcurrencyChangeReason, WorkerPool},
    budget::BudgetController,
    error::SchedulerError,
    fsm::{AttemptOutcome, NodeFsm},
    plan::PlanGraph,
};

/// Resume inputs accepted by `Execute` (`spec.md` §4.1 "Resume").
#[derive(Debug, Clone, Default)]
pub struct ResumeInputs {
    pub status_by_id: HashMap<NodeId, NodeStatus>,
    pub attempt_by_id: HashMap<NodeId, u32>,
}

impl ResumeInputs {
    /// Builds resume inputs from the raw `(status, attempt)` rows
    /// `EventStore::load_run_node_steps` returns — the "`ResumeStepsByID`"
    /// input in `spec.md` §4.1.
    pub fn from_steps(steps: BTreeMap<NodeId, (String, u32)>) -> Self {
        let mut status_by_id = HashMap::with_capacity(steps.len());
        let mut attempt_by_id = HashMap::with_capacity(steps.len());
        for (id, (status, attempt)) in steps {
            status_by_id.insert(id.clone(), parse_status(&status));
            attempt_by_id.insert(id, attempt);
        }
        Self { status_by_id, attempt_by_id }
    }
}

fn parse_status(raw: &str) -> NodeStatus {
    match raw {
        "succeeded" => NodeStatus::Succeeded,
        "failed" => NodeStatus::Failed,
        "blocked" => NodeStatus::Blocked,
        _ => NodeStatus::Planned,
    }
}

enum NodeProgress {
    BudgetWait,
    AttemptStarted { attempt: u32 },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        class: String,
        message: String,
    },
    Finished {
        outcome: AttemptOutcome,
        attempt: u32,
        error: Option<(String, String)>,
    },
}

/// Composes C1–C5 into the public `StackRunner` contract.
pub struct StackRunner {
    store: Store,
    scheduler_config: SchedulerConfig,
    lock_config: LockConfig,
    executor: Arc<dyn NodeExecutor>,
    classifier: Arc<dyn ktl_protocol::ErrorClassifier>,
    observers: Vec<Arc<dyn RunEventObserver>>,
}

impl StackRunner {
    pub fn new(
        store: Store,
        scheduler_config: SchedulerConfig,
        lock_config: LockConfig,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        Self {
            store,
            scheduler_config,
            lock_config,
            executor,
            classifier: Arc::new(ktl_protocol::DefaultErrorClassifier),
            observers: Vec::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ktl_protocol::ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn register_observer(&mut self, observer: Arc<dyn RunEventObserver>) {
        self.observers.push(observer);
    }

    pub async fn run(
        &self,
        run: Run,
        mut nodes: Vec<RunNode>,
        resume: ResumeInputs,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let lease = LockLease {
            owner: run.id.0.clone(),
            run_id: run.id.clone(),
            acquired_at: chrono::Utc::now(),
            ttl: self.lock_config.ttl,
        };
        self.store
            .locks
            .acquire(&run.stack_root, lease, self.lock_config.takeover)
            .await
            .map_err(|err| match err {
                ktl_store::StoreError::LockHeld { owner, expires_at } => {
                    SchedulerError::LockHeld { owner, expires_at }
                }
                other => SchedulerError::Store(other),
            })?;

        let graph = PlanGraph::build(&nodes, run.command)?;
        for node in &mut nodes {
            node.execution_group = graph.execution_group(&node.id);
        }
        let nodes_by_id: HashMap<NodeId, RunNode> =
            nodes.iter().cloned().map(|n| (n.id.clone(), n)).collect();

        self.store.events.create_run(&run, &nodes).await?;

        for node in &nodes {
            let (cluster, namespace, name) = node.id.parts().unwrap_or(("", "", node.id.0.as_str()));
            let mut fields = Fields::new();
            fields.insert("cluster".into(), cluster.into());
            fields.insert("namespace".into(), namespace.into());
            fields.insert("name".into(), name.into());
            fields.insert("critical".into(), node.critical.into());
            if let Some(kind) = &node.primary_kind {
                fields.insert("primary_kind".into(), kind.0.clone().into());
            }
            self.emit(&run.id, Some(node.id.clone()), EventKind::NodeMeta, 0, "node meta", fields, None)
                .await?;
        }
        self.emit(&run.id, None, EventKind::RunStarted, 0, "run started", Fields::new(), None)
            .await?;

        let mut fsms: HashMap<NodeId, NodeFsm> =
            nodes.iter().map(|n| (n.id.clone(), NodeFsm::new())).collect();
        let mut attempts: HashMap<NodeId, u32> = HashMap::new();
        let mut errors: HashMap<NodeId, NodeErrorDigest> = HashMap::new();
        let mut in_degree: HashMap<NodeId, usize> =
            nodes.iter().map(|n| (n.id.clone(), graph.in_degree(&n.id))).collect();

        let mut ready: Vec<NodeId> = Vec::new();

        for node in &nodes {
            if let Some(resumed) = resume.status_by_id.get(&node.id) {
                if *resumed == NodeStatus::Succeeded {
                    let attempt = resume.attempt_by_id.get(&node.id).copied().unwrap_or(1);
                    fsms.insert(node.id.clone(), NodeFsm::seeded_succeeded(attempt));
                    attempts.insert(node.id.clone(), attempt);
                    self.emit(
                        &run.id,
                        Some(node.id.clone()),
                        EventKind::NodeSucceeded,
                        attempt,
                        "resume: already succeeded",
                        Fields::new(),
                        None,
                    )
                    .await?;
                    for dep in graph.dependents(&node.id) {
                        if let Some(count) = in_degree.get_mut(&dep) {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
            }
        }

        for node in &nodes {
            if fsms[&node.id].status() == NodeStatus::Planned && in_degree[&node.id] == 0 {
                ready.push(node.id.clone());
            }
        }

        let pool = WorkerPool::new(self.scheduler_config.concurrency);
        let mut adaptive = self
            .scheduler_config
            .adaptive
            .clone()
            .map(|cfg| AdaptiveController::new(cfg, Arc::clone(&pool)));
        let budget = Arc::new(BudgetController::new(&nodes, &self.scheduler_config));

        let (tx, mut rx) = mpsc::channel::<(NodeId, NodeProgress)>(256);
        let mut inflight = 0usize;
        let mut stop_admitting = false;
        let mut run_failed = false;
        let mut cancelled = false;

        loop {
            if !stop_admitting {
                ready.retain(|id| fsms[id].status() == NodeStatus::Planned);
                ready.sort_by_key(|id| priority_key(id, &graph, &nodes_by_id));
                while !ready.is_empty() {
                    let node_id = ready.remove(0);
                    fsms.get_mut(&node_id).expect("node has an fsm").mark_queued();
                    self.emit(&run.id, Some(node_id.clone()), EventKind::NodeQueued, 0, "node queued", Fields::new(), None)
                        .await?;

                    let node = nodes_by_id[&node_id].clone();
                    let resume_attempt = resume.attempt_by_id.get(&node_id).copied().unwrap_or(0);
                    let task_tx = tx.clone();
                    let task_cancel = cancel.clone();
                    let task_pool = Arc::clone(&pool);
                    let task_budget = Arc::clone(&budget);
                    let task_executor = Arc::clone(&self.executor);
                    let task_classifier = Arc::clone(&self.classifier);
                    let command = run.command;
                    let max_attempts = self.scheduler_config.max_attempts;
                    tokio::spawn(async move {
                        run_node(
                            node,
                            command,
                            task_cancel,
                            max_attempts,
                            resume_attempt,
                            task_pool,
                            task_budget,
                            task_executor,
                            task_classifier,
                            task_tx,
                        )
                        .await;
                    });
                    inflight += 1;
                }
            }

            if inflight == 0 {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    stop_admitting = true;
                    ready.clear();
                }
                msg = rx.recv() => {
                    let Some((node_id, progress)) = msg else { break };
                    match progress {
                        NodeProgress::BudgetWait => {
                            self.emit(&run.id, Some(node_id), EventKind::BudgetWait, 0, "waiting for budget permit", Fields::new(), None).await?;
                        }
                        NodeProgress::AttemptStarted { attempt } => {
                            attempts.insert(node_id.clone(), attempt);
                            fsms.get_mut(&node_id).expect("node has an fsm").mark_running();
                            self.emit(&run.id, Some(node_id), EventKind::NodeRunning, attempt, "node running", Fields::new(), None).await?;
                        }
                        NodeProgress::RetryScheduled { attempt, delay, class, message } => {
                            let mut fields = Fields::new();
                            fields.insert("delay_ms".into(), (delay.as_millis() as u64).into());
                            fields.insert("class".into(), class.into());
                            self.emit(&run.id, Some(node_id), EventKind::RetryScheduled, attempt, message, fields, None).await?;
                        }
                        NodeProgress::Finished { outcome, attempt, error } => {
                            inflight -= 1;
                            attempts.insert(node_id.clone(), attempt);

                            if let Some(adaptive) = adaptive.as_mut() {
                                if let Some(change) = adaptive.record(outcome) {
                                    let reason = match change.reason {
                                        ConcurrencyChangeReason::HighFailureRate => "high_failure_rate",
                                        ConcurrencyChangeReason::LowFailureRate => "low_failure_rate",
                                    };
                                    let mut fields = Fields::new();
                                    fields.insert("from".into(), change.from.into());
                                    fields.insert("to".into(), change.to.into());
                                    fields.insert("reason".into(), reason.into());
                                    fields.insert("window".into(), change.window.into());
                                    fields.insert("fail_rate".into(), change.fail_rate.into());
                                    self.emit(&run.id, None, EventKind::RunConcurrency, 0, "concurrency target changed", fields, None).await?;
                                }
                            }

                            // `run_node` only sends `Finished` once it has exhausted its own
                            // retry loop (or hit success/permanent failure), so by the time
                            // the FSM sees this outcome there are no attempts left to spend.
                            fsms.get_mut(&node_id)
                                .expect("node has an fsm")
                                .apply_outcome(outcome, false);

                            match outcome {
                                AttemptOutcome::Succeeded => {
                                    self.emit(&run.id, Some(node_id.clone()), EventKind::NodeSucceeded, attempt, "node succeeded", Fields::new(), None).await?;
                                    self.store
                                        .events
                                        .record_node_step(run.id.clone(), node_id.clone(), attempt, "succeeded", None)
                                        .await?;
                                    for dep in graph.dependents(&node_id) {
                                        if let Some(count) = in_degree.get_mut(&dep) {
                                            *count = count.saturating_sub(1);
                                            if *count == 0 && fsms[&dep].status() == NodeStatus::Planned {
                                                ready.push(dep);
                                            }
                                        }
                                    }
                                }
                                AttemptOutcome::RetryableFailed | AttemptOutcome::PermanentFailed => {
                                    run_failed = true;
                                    let (class, message) = error.unwrap_or_else(|| ("unknown".into(), "node failed".into()));
                                    let kind = if matches!(outcome, AttemptOutcome::PermanentFailed) {
                                        ktl_protocol::ErrorKind::NodePermanent
                                    } else {
                                        ktl_protocol::ErrorKind::NodeTransient
                                    };
                                    let digest = NodeError::new(kind, class.clone(), message.clone()).digest();
                                    let error_digest = NodeErrorDigest { class, message, digest };
                                    errors.insert(node_id.clone(), error_digest.clone());
                                    self.emit(&run.id, Some(node_id.clone()), EventKind::NodeFailed, attempt, "node failed", Fields::new(), Some(error_digest.clone())).await?;
                                    self.store
                                        .events
                                        .record_node_step(
                                            run.id.clone(),
                                            node_id.clone(),
                                            attempt,
                                            "failed",
                                            Some((&error_digest.class, &error_digest.message, &error_digest.digest)),
                                        )
                                        .await?;

                                    let newly_blocked = propagate_blocked(&graph, &node_id, &mut fsms);
                                    for blocked_id in newly_blocked {
                                        ready.retain(|id| *id != blocked_id);
                                        self.emit(&run.id, Some(blocked_id.clone()), EventKind::NodeBlocked, 0, "blocked by failed dependency", Fields::new(), None).await?;
                                        self.store
                                            .events
                                            .record_node_step(run.id.clone(), blocked_id, 0, "blocked", None)
                                            .await?;
                                    }

                                    if matches!(self.scheduler_config.fail_mode, ktl_config::FailModeConfig::FailFast) {
                                        stop_admitting = true;
                                    }
                                }
                            }
                        }
                    }
                }
            }

        }

        let terminal_status = if run_failed || cancelled { "failed" } else { "succeeded" };
        let completion_message = if cancelled { "canceled" } else { terminal_status };
        let completion_event = self
            .emit(&run.id, None, EventKind::RunCompleted, 0, completion_message, Fields::new(), None)
            .await?;

        self.store
            .events
            .finalize_run(run.id.clone(), chrono::Utc::now(), terminal_status, completion_event.digest)
            .await?;

        let totals = RunTotals {
            planned: nodes.len(),
            succeeded: fsms.values().filter(|f| f.status() == NodeStatus::Succeeded).count(),
            failed: fsms.values().filter(|f| f.status() == NodeStatus::Failed).count(),
            blocked: fsms.values().filter(|f| f.status() == NodeStatus::Blocked).count(),
            running: 0,
        };
        let node_summaries = nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    RunNodeSummary {
                        status: fsms[&n.id].status(),
                        attempt: attempts.get(&n.id).copied().unwrap_or(0),
                        error: errors.get(&n.id).cloned(),
                    },
                )
            })
            .collect();
        self.store
            .events
            .write_summary(run.id.clone(), &RunSummary { totals, nodes: node_summaries })
            .await?;

        if let Err(err) = self.store.locks.release(&run.stack_root, &run.id.0).await {
            tracing::warn!(error = %err, stack_root = %run.stack_root, "lock release failed; best-effort only");
        }

        if run_failed || cancelled {
            return Err(SchedulerError::NodeFailed {
                node: "<run>".into(),
                message: completion_message.to_string(),
            });
        }
        Ok(())
    }

    async fn emit(
        &self,
        run_id: &RunId,
        node_id: Option<NodeId>,
        kind: EventKind,
        attempt: u32,
        message: impl Into<String>,
        fields: Fields,
        error: Option<NodeErrorDigest>,
    ) -> Result<RunEvent, SchedulerError> {
        let mut draft = NewEvent::new(run_id.clone(), kind, message).with_attempt(attempt);
        if let Some(node_id) = node_id {
            draft = draft.with_node(node_id);
        }
        draft.fields = fields;
        if let Some(error) = error {
            draft = draft.with_error(error);
        }
        let event = self.store.events.append_event(draft).await?;
        for observer in &self.observers {
            observer.observe(&event);
        }
        Ok(event)
    }
}

fn priority_key(
    id: &NodeId,
    graph: &PlanGraph,
    nodes_by_id: &HashMap<NodeId, RunNode>,
) -> (std::cmp::Reverse<u32>, u32, Option<String>, String) {
    let node = &nodes_by_id[id];
    (
        std::cmp::Reverse(graph.critical_path_remaining(id)),
        node.execution_group,
        node.parallelism_group.as_ref().map(|g| g.0.clone()),
        node.id.0.clone(),
    )
}

/// Marks every still-`planned` transitive dependent of `failed` as
/// `blocked`, returning the set newly transitioned (`spec.md` §4.1
/// "`blocked` is reached only when a dependency is `failed` or `blocked`").
fn propagate_blocked(
    graph: &PlanGraph,
    failed: &NodeId,
    fsms: &mut HashMap<NodeId, NodeFsm>,
) -> Vec<NodeId> {
    let mut newly_blocked = Vec::new();
    let mut stack = graph.dependents(failed);
    while let Some(dep) = stack.pop() {
        if fsms.get(&dep).map(|f| f.status()) == Some(NodeStatus::Planned) {
            fsms.get_mut(&dep).expect("checked above").mark_blocked();
            newly_blocked.push(dep.clone());
            stack.extend(graph.dependents(&dep));
        }
    }
    newly_blocked
}

#[allow(clippy::too_many_arguments)]
async fn run_node(
    node: RunNode,
    command: RunCommand,
    cancel: CancellationToken,
    max_attempts: u32,
    resume_attempt: u32,
    pool: Arc<WorkerPool>,
    budget: Arc<BudgetController>,
    executor: Arc<dyn NodeExecutor>,
    classifier: Arc<dyn ktl_protocol::ErrorClassifier>,
    tx: mpsc::Sender<(NodeId, NodeProgress)>,
) {
    let node_id = node.id.clone();

    let _pool_permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        permit = pool.semaphore().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    let notify_tx = tx.clone();
    let notify_id = node_id.clone();
    let mut waited = false;
    let Some(_budget_guard) = budget
        .acquire(&node, &cancel, || {
            if !waited {
                waited = true;
                let _ = notify_tx.try_send((notify_id.clone(), NodeProgress::BudgetWait));
            }
        })
        .await
    else {
        return;
    };

    let mut attempt = resume_attempt;
    loop {
        attempt += 1;
        if tx
            .send((node_id.clone(), NodeProgress::AttemptStarted { attempt }))
            .await
            .is_err()
        {
            return;
        }
        if cancel.is_cancelled() {
            return;
        }

        let result = executor.execute(cancel.clone(), &node_id, command).await;
        match result {
            Ok(()) => {
                let _ = tx
                    .send((
                        node_id.clone(),
                        NodeProgress::Finished {
                            outcome: AttemptOutcome::Succeeded,
                            attempt,
                            error: None,
                        },
                    ))
                    .await;
                return;
            }
            Err(NodeExecutorError::Cancelled) => return,
            Err(err) => {
                let kind = classifier.classify(&err);
                let class = err.class().to_string();
                let message = err.message();

                if kind.is_retryable() && attempt < max_attempts {
                    let delay = crate::retry::backoff(attempt - 1);
                    if tx
                        .send((
                            node_id.clone(),
                            NodeProgress::RetryScheduled {
                                attempt,
                                delay,
                                class,
                                message,
                            },
                        ))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }

                let outcome = if kind.is_retryable() {
                    AttemptOutcome::RetryableFailed
                } else {
                    AttemptOutcome::PermanentFailed
                };
                let _ = tx
                    .send((
                        node_id.clone(),
                        NodeProgress::Finished {
                            outcome,
                            attempt,
                            error: Some((class, message)),
                        },
                    ))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ktl_protocol::ParallelismGroup;

    /// Per-node scripted outcomes: the executor pops one outcome per call to
    /// `execute`, repeating the last entry once exhausted.
    struct ScriptedExecutor {
        scripts: StdHashMap<NodeId, Vec<Result<(), NodeExecutorError>>>,
        calls: Mutex<StdHashMap<NodeId, usize>>,
        concurrent: AtomicUsize,
        max_concurrent_seen: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(scripts: StdHashMap<NodeId, Vec<Result<(), NodeExecutorError>>>) -> Self {
            Self {
                scripts,
                calls: Mutex::new(StdHashMap::new()),
                concurrent: AtomicUsize::new(0),
                max_concurrent_seen: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NodeExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _cancel: CancellationToken,
            node: &NodeId,
            _command: RunCommand,
        ) -> Result<(), NodeExecutorError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(node.clone()).or_insert(0);
            let script = self.scripts.get(node).expect("scripted node");
            let idx = (*count).min(script.len() - 1);
            *count += 1;
            match &script[idx] {
                Ok(()) => Ok(()),
                Err(e) => Err(clone_executor_error(e)),
            }
        }
    }

    fn clone_executor_error(err: &NodeExecutorError) -> NodeExecutorError {
        match err {
            NodeExecutorError::Cancelled => NodeExecutorError::Cancelled,
            NodeExecutorError::Transient(m) => NodeExecutorError::Transient(m.clone()),
            NodeExecutorError::Timeout(m) => NodeExecutorError::Timeout(m.clone()),
            NodeExecutorError::Conflict(m) => NodeExecutorError::Conflict(m.clone()),
            NodeExecutorError::Permanent(m) => NodeExecutorError::Permanent(m.clone()),
        }
    }

    fn node(id: &str, needs: &[&str], group: Option<&str>) -> RunNode {
        RunNode {
            id: NodeId(id.into()),
            needs: needs.iter().map(|n| NodeId((*n).into())).collect(),
            parallelism_group: group.map(|g| ParallelismGroup(g.into())),
            primary_kind: None,
            critical: false,
            attempt: 0,
            input_hash: "h".into(),
            status: NodeStatus::Planned,
            execution_group: 0,
        }
    }

    fn test_run(stack_root: &str) -> Run {
        Run {
            id: RunId(format!("run-{stack_root}")),
            command: RunCommand::Apply,
            stack_root: stack_root.into(),
            profile: None,
            concurrency: 4,
            fail_mode: ktl_protocol::domain::FailMode::FailFast,
            selector: None,
        }
    }

    #[tokio::test]
    async fn diamond_with_root_failure_blocks_every_dependent() {
        let nodes = vec![
            node("c/ns/a", &[], None),
            node("c/ns/b", &["c/ns/a"], None),
            node("c/ns/c", &["c/ns/a"], None),
            node("c/ns/d", &["c/ns/b", "c/ns/c"], None),
        ];

        let mut scripts = StdHashMap::new();
        scripts.insert(
            NodeId("c/ns/a".into()),
            vec![Err(NodeExecutorError::Permanent("denied".into()))],
        );
        for id in ["c/ns/b", "c/ns/c", "c/ns/d"] {
            scripts.insert(NodeId(id.into()), vec![Ok(())]);
        }
        let executor = Arc::new(ScriptedExecutor::new(scripts));

        let store = ktl_store::Store::open_in_memory().unwrap();
        let runner = StackRunner::new(
            store,
            SchedulerConfig::default(),
            LockConfig::default(),
            executor,
        );

        let run = test_run("diamond");
        let result = runner
            .run(run, nodes, ResumeInputs::default(), CancellationToken::new())
            .await;

        assert!(result.is_err());
        let steps = runner
            .store
            .events
            .load_run_node_steps(RunId("run-diamond".into()))
            .await
            .unwrap();
        assert_eq!(steps.get(&NodeId("c/ns/a".into())).unwrap().0, "failed");
        assert_eq!(steps.get(&NodeId("c/ns/b".into())).unwrap().0, "blocked");
        assert_eq!(steps.get(&NodeId("c/ns/c".into())).unwrap().0, "blocked");
        assert_eq!(steps.get(&NodeId("c/ns/d".into())).unwrap().0, "blocked");
    }

    #[tokio::test]
    async fn retryable_transient_failure_succeeds_on_second_attempt() {
        let nodes = vec![node("c/ns/a", &[], None)];
        let mut scripts = StdHashMap::new();
        scripts.insert(
            NodeId("c/ns/a".into()),
            vec![Err(NodeExecutorError::Transient("flaked".into())), Ok(())],
        );
        let executor = Arc::new(ScriptedExecutor::new(scripts));

        let store = ktl_store::Store::open_in_memory().unwrap();
        let mut config = SchedulerConfig::default();
        config.max_attempts = 3;
        let runner = StackRunner::new(store, config, LockConfig::default(), executor);

        let run = test_run("retry");
        let result = runner
            .run(run, nodes, ResumeInputs::default(), CancellationToken::new())
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn parallelism_group_limit_serializes_co_members() {
        let nodes = vec![
            node("c/ns/a", &[], Some("db")),
            node("c/ns/b", &[], Some("db")),
        ];
        let mut scripts = StdHashMap::new();
        scripts.insert(NodeId("c/ns/a".into()), vec![Ok(())]);
        scripts.insert(NodeId("c/ns/b".into()), vec![Ok(())]);
        let executor = Arc::new(ScriptedExecutor::new(scripts));
        let executor_probe = Arc::clone(&executor);

        let store = ktl_store::Store::open_in_memory().unwrap();
        let mut config = SchedulerConfig::default();
        config.parallelism_group_limit = 1;
        let runner = StackRunner::new(store, config, LockConfig::default(), executor);

        let run = test_run("budget");
        let result = runner
            .run(run, nodes, ResumeInputs::default(), CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(executor_probe.max_concurrent_seen.load(Ordering::SeqCst), 1);
    }
}
