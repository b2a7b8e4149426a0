use std::collections::BTreeMap;

use ktl_protocol::{
    domain::{RunNodeSummary, RunTotals},
    EventKind, NewEvent, NodeId, Run, RunEvent, RunId, RunNode, RunSummary,
};
use rusqlite::{params, OptionalExtension};

use crate::{digest, error::StoreError, writer::Writer};

/// Per-stack embedded relational store (`spec.md` §4.3). One [`EventStore`]
/// per stack root; all writes for any run at that root serialize through
/// the same [`Writer`].
#[derive(Clone)]
pub struct EventStore {
    writer: Writer,
}

impl EventStore {
    pub fn new(writer: Writer) -> Self {
        Self { writer }
    }

    /// Records plan nodes transactionally, including each node's effective
    /// input hash.
    pub async fn create_run(&self, run: &Run, nodes: &[RunNode]) -> Result<(), StoreError> {
        let run = run.clone();
        let nodes = nodes.to_vec();
        self.writer
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO runs (run_id, command, stack_root, profile, concurrency, \
                     fail_mode, selector, created_at, finalized_at, terminal_status, last_digest) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, NULL)",
                    params![
                        run.id.0,
                        format!("{:?}", run.command),
                        run.stack_root,
                        run.profile,
                        run.concurrency as i64,
                        format!("{:?}", run.fail_mode),
                        run.selector,
                        chrono::Utc::now().to_rfc3339(),
                    ],
                )?;

                for node in &nodes {
                    tx.execute(
                        "INSERT INTO run_nodes (run_id, node_id, needs_json, parallelism_group, \
                         primary_kind, critical, input_hash, execution_group) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            run.id.0,
                            node.id.0,
                            serde_json::to_string(&node.needs)?,
                            node.parallelism_group.as_ref().map(|g| g.0.clone()),
                            node.primary_kind.as_ref().map(|k| k.0.clone()),
                            node.critical as i64,
                            node.input_hash,
                            node.execution_group as i64,
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Appends an event, enforcing monotone `seq` and the hash chain.
    pub async fn append_event(&self, draft: NewEvent) -> Result<RunEvent, StoreError> {
        self.writer
            .with_conn(move |conn| {
                let tx = conn.transaction()?;

                let (next_seq, prev_digest): (u64, String) = tx
                    .query_row(
                        "SELECT seq, digest FROM events WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                        params![draft.run_id.0],
                        |row| {
                            let seq: i64 = row.get(0)?;
                            let digest: String = row.get(1)?;
                            Ok((seq as u64 + 1, digest))
                        },
                    )
                    .optional()?
                    .unwrap_or((1, digest::GENESIS_DIGEST.to_string()));

                let mut event = RunEvent {
                    seq: next_seq,
                    timestamp: draft.timestamp,
                    run_id: draft.run_id,
                    node_id: draft.node_id,
                    kind: draft.kind,
                    attempt: draft.attempt,
                    message: draft.message,
                    fields: draft.fields,
                    error: draft.error,
                    prev_digest: prev_digest.clone(),
                    digest: String::new(),
                    crc32: 0,
                };

                let canonical = event.canonical_bytes();
                event.digest = digest::chain(&prev_digest, &canonical);
                event.crc32 = digest::crc32(&canonical);

                tx.execute(
                    "INSERT INTO events (run_id, seq, payload_json, prev_digest, digest, crc32) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        event.run_id.0,
                        event.seq as i64,
                        serde_json::to_string(&event)?,
                        event.prev_digest,
                        event.digest,
                        event.crc32,
                    ],
                )?;

                tx.commit()?;
                Ok(event)
            })
            .await
    }

    /// Stamps terminal state and the final chain digest.
    pub async fn finalize_run(
        &self,
        run_id: RunId,
        end_timestamp: chrono::DateTime<chrono::Utc>,
        terminal_status: &str,
        last_digest: String,
    ) -> Result<(), StoreError> {
        let terminal_status = terminal_status.to_string();
        self.writer
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE runs SET finalized_at = ?1, terminal_status = ?2, last_digest = ?3 \
                     WHERE run_id = ?4",
                    params![
                        end_timestamp.to_rfc3339(),
                        terminal_status,
                        last_digest,
                        run_id.0,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Atomic replace of the summary snapshot. Idempotent: writing the same
    /// content twice is a no-op observable side effect.
    pub async fn write_summary(&self, run_id: RunId, summary: &RunSummary) -> Result<(), StoreError> {
        let totals_json = serde_json::to_string(&summary.totals)?;
        let nodes_json = serde_json::to_string(&summary.nodes)?;
        self.writer
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO summaries (run_id, totals_json, nodes_json, updated_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(run_id) DO UPDATE SET \
                        totals_json = excluded.totals_json, \
                        nodes_json = excluded.nodes_json, \
                        updated_at = excluded.updated_at",
                    params![run_id.0, totals_json, nodes_json, chrono::Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn load_summary(&self, run_id: RunId) -> Result<Option<RunSummary>, StoreError> {
        self.writer
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT totals_json, nodes_json FROM summaries WHERE run_id = ?1",
                        params![run_id.0],
                        |row| {
                            let totals: String = row.get(0)?;
                            let nodes: String = row.get(1)?;
                            Ok((totals, nodes))
                        },
                    )
                    .optional()?;
                let Some((totals_json, nodes_json)) = row else {
                    return Ok(None);
                };
                let totals: RunTotals = serde_json::from_str(&totals_json)?;
                let nodes: BTreeMap<NodeId, RunNodeSummary> = serde_json::from_str(&nodes_json)?;
                Ok(Some(RunSummary { totals, nodes }))
            })
            .await
    }

    pub async fn load_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        self.writer
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT run_id, command, stack_root, profile, concurrency, fail_mode, selector \
                     FROM runs WHERE run_id = ?1",
                    params![run_id.0],
                    |row| {
                        let command: String = row.get(1)?;
                        let fail_mode: String = row.get(5)?;
                        Ok(Run {
                            id: RunId(row.get::<_, String>(0)?),
                            command: parse_command(&command),
                            stack_root: row.get(2)?,
                            profile: row.get(3)?,
                            concurrency: row.get::<_, i64>(4)? as usize,
                            fail_mode: parse_fail_mode(&fail_mode),
                            selector: row.get(6)?,
                        })
                    },
                )
                .optional()?
                .ok_or_else(|| StoreError::RunNotFound(run_id.0.clone()))
            })
            .await
    }

    /// Loads, for each node, its most recent persisted status/attempt/error
    /// — the read path used to seed `ResumeStatusByID`/`ResumeAttemptByID`.
    pub async fn load_run_node_steps(
        &self,
        run_id: RunId,
    ) -> Result<BTreeMap<NodeId, (String, u32)>, StoreError> {
        self.writer
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT node_id, status, attempt FROM run_node_steps \
                     WHERE run_id = ?1 AND (node_id, attempt) IN ( \
                        SELECT node_id, MAX(attempt) FROM run_node_steps WHERE run_id = ?1 GROUP BY node_id \
                     )",
                )?;
                let rows = stmt.query_map(params![run_id.0], |row| {
                    let node_id: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    let attempt: i64 = row.get(2)?;
                    Ok((NodeId(node_id), (status, attempt as u32)))
                })?;
                let mut out = BTreeMap::new();
                for row in rows {
                    let (node_id, value) = row?;
                    out.insert(node_id, value);
                }
                Ok(out)
            })
            .await
    }

    /// Records a node step's terminal/in-progress status, used both for the
    /// resume read path and as an audit trail independent of the event log.
    pub async fn record_node_step(
        &self,
        run_id: RunId,
        node_id: NodeId,
        attempt: u32,
        status: &str,
        error: Option<(&str, &str, &str)>,
    ) -> Result<(), StoreError> {
        let status = status.to_string();
        let error = error.map(|(class, message, digest)| {
            (class.to_string(), message.to_string(), digest.to_string())
        });
        self.writer
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO run_node_steps \
                     (run_id, node_id, attempt, status, error_class, error_message, error_digest, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(run_id, node_id, attempt) DO UPDATE SET \
                        status = excluded.status, \
                        error_class = excluded.error_class, \
                        error_message = excluded.error_message, \
                        error_digest = excluded.error_digest, \
                        updated_at = excluded.updated_at",
                    params![
                        run_id.0,
                        node_id.0,
                        attempt as i64,
                        status,
                        error.as_ref().map(|e| e.0.clone()),
                        error.as_ref().map(|e| e.1.clone()),
                        error.as_ref().map(|e| e.2.clone()),
                        chrono::Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Replays the whole chain for `run_id` and verifies every digest,
    /// returning `Err(IntegrityViolation)` on the first mismatch
    /// (`spec.md` §7 `IntegrityViolation`, §8 invariant on `Digest`).
    pub async fn verify_chain(&self, run_id: RunId) -> Result<(), StoreError> {
        self.writer
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, payload_json, prev_digest, digest FROM events \
                     WHERE run_id = ?1 ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map(params![run_id.0], |row| {
                    let seq: i64 = row.get(0)?;
                    let payload: String = row.get(1)?;
                    let prev_digest: String = row.get(2)?;
                    let digest: String = row.get(3)?;
                    Ok((seq as u64, payload, prev_digest, digest))
                })?;

                let mut expected_prev = digest::GENESIS_DIGEST.to_string();
                let mut expected_seq = 1u64;
                for row in rows {
                    let (seq, payload_json, prev_digest, digest) = row?;
                    if seq != expected_seq {
                        return Err(StoreError::NonMonotoneSequence {
                            run_id: run_id.0.clone(),
                            expected: expected_seq,
                            actual: seq,
                        });
                    }
                    if prev_digest != expected_prev {
                        return Err(StoreError::IntegrityViolation {
                            run_id: run_id.0.clone(),
                            seq,
                            expected: expected_prev,
                            actual: prev_digest,
                        });
                    }
                    let event: RunEvent = serde_json::from_str(&payload_json)?;
                    let recomputed = digest::chain(&prev_digest, &event.canonical_bytes());
                    if recomputed != digest {
                        return Err(StoreError::IntegrityViolation {
                            run_id: run_id.0.clone(),
                            seq,
                            expected: recomputed,
                            actual: digest,
                        });
                    }
                    expected_prev = digest;
                    expected_seq += 1;
                }
                Ok(())
            })
            .await
    }
}

fn parse_command(raw: &str) -> ktl_protocol::RunCommand {
    match raw {
        "Delete" => ktl_protocol::RunCommand::Delete,
        _ => ktl_protocol::RunCommand::Apply,
    }
}

fn parse_fail_mode(raw: &str) -> ktl_protocol::FailMode {
    match raw {
        "Continue" => ktl_protocol::FailMode::Continue,
        _ => ktl_protocol::FailMode::FailFast,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::{FailMode, RunCommand};

    fn sample_run() -> Run {
        Run {
            id: RunId("run-1".into()),
            command: RunCommand::Apply,
            stack_root: "/stacks/demo".into(),
            profile: None,
            concurrency: 4,
            fail_mode: FailMode::FailFast,
            selector: None,
        }
    }

    #[tokio::test]
    async fn events_form_a_gap_free_chained_sequence() {
        let store = EventStore::new(Writer::open_in_memory().unwrap());
        store.create_run(&sample_run(), &[]).await.unwrap();

        let e1 = store
            .append_event(NewEvent::new(RunId("run-1".into()), EventKind::RunStarted, "start"))
            .await
            .unwrap();
        let e2 = store
            .append_event(NewEvent::new(RunId("run-1".into()), EventKind::RunCompleted, "done"))
            .await
            .unwrap();

        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert_eq!(e2.prev_digest, e1.digest);
        store.verify_chain(RunId("run-1".into())).await.unwrap();
    }

    #[tokio::test]
    async fn verify_chain_detects_tampering() {
        let store = EventStore::new(Writer::open_in_memory().unwrap());
        store.create_run(&sample_run(), &[]).await.unwrap();
        store
            .append_event(NewEvent::new(RunId("run-1".into()), EventKind::RunStarted, "start"))
            .await
            .unwrap();

        store
            .writer
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE events SET payload_json = REPLACE(payload_json, 'start', 'tampered') \
                     WHERE run_id = 'run-1' AND seq = 1",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let result = store.verify_chain(RunId("run-1".into())).await;
        assert!(matches!(result, Err(StoreError::IntegrityViolation { .. })));
    }

    #[tokio::test]
    async fn summary_write_is_idempotent() {
        let store = EventStore::new(Writer::open_in_memory().unwrap());
        store.create_run(&sample_run(), &[]).await.unwrap();
        let summary = RunSummary {
            totals: RunTotals {
                planned: 1,
                succeeded: 1,
                failed: 0,
                blocked: 0,
                running: 0,
            },
            nodes: BTreeMap::new(),
        };
        store.write_summary(RunId("run-1".into()), &summary).await.unwrap();
        store.write_summary(RunId("run-1".into()), &summary).await.unwrap();
        let loaded = store.load_summary(RunId("run-1".into())).await.unwrap().unwrap();
        assert_eq!(loaded, summary);
    }
}
