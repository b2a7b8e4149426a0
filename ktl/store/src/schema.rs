use rusqlite::Connection;

use crate::error::StoreError;

/// Creates the durable state layout (`spec.md` §6 "Durable state layout")
/// if it does not already exist. Every statement is `IF NOT EXISTS`, so
/// calling this on an already-migrated file is a no-op, satisfying
/// "Schema migrations are idempotent".
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS runs (
            run_id          TEXT PRIMARY KEY,
            command         TEXT NOT NULL,
            stack_root      TEXT NOT NULL,
            profile         TEXT,
            concurrency     INTEGER NOT NULL,
            fail_mode       TEXT NOT NULL,
            selector        TEXT,
            created_at      TEXT NOT NULL,
            finalized_at    TEXT,
            terminal_status TEXT,
            last_digest     TEXT
        );

        CREATE TABLE IF NOT EXISTS run_nodes (
            run_id          TEXT NOT NULL REFERENCES runs(run_id),
            node_id         TEXT NOT NULL,
            needs_json      TEXT NOT NULL,
            parallelism_group TEXT,
            primary_kind    TEXT,
            critical        INTEGER NOT NULL,
            input_hash      TEXT NOT NULL,
            execution_group INTEGER NOT NULL,
            PRIMARY KEY (run_id, node_id)
        );

        CREATE TABLE IF NOT EXISTS run_node_steps (
            run_id          TEXT NOT NULL REFERENCES runs(run_id),
            node_id         TEXT NOT NULL,
            attempt         INTEGER NOT NULL,
            status          TEXT NOT NULL,
            error_class     TEXT,
            error_message   TEXT,
            error_digest    TEXT,
            updated_at      TEXT NOT NULL,
            PRIMARY KEY (run_id, node_id, attempt)
        );

        CREATE TABLE IF NOT EXISTS events (
            run_id          TEXT NOT NULL REFERENCES runs(run_id),
            seq             INTEGER NOT NULL,
            payload_json    TEXT NOT NULL,
            prev_digest     TEXT NOT NULL,
            digest          TEXT NOT NULL,
            crc32           INTEGER NOT NULL,
            PRIMARY KEY (run_id, seq)
        );

        CREATE TABLE IF NOT EXISTS summaries (
            run_id          TEXT PRIMARY KEY REFERENCES runs(run_id),
            totals_json     TEXT NOT NULL,
            nodes_json      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS locks (
            stack_root      TEXT PRIMARY KEY,
            owner           TEXT NOT NULL,
            run_id          TEXT NOT NULL,
            acquired_at     TEXT NOT NULL,
            ttl_seconds     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mirror_sessions (
            session_id      TEXT PRIMARY KEY,
            meta_json       TEXT NOT NULL,
            tags_json       TEXT NOT NULL,
            state           TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            last_seen_at    TEXT NOT NULL,
            frame_count     INTEGER NOT NULL,
            next_sequence   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mirror_frames (
            session_id      TEXT NOT NULL REFERENCES mirror_sessions(session_id),
            sequence        INTEGER NOT NULL,
            producer        TEXT NOT NULL,
            payload_json    TEXT NOT NULL,
            PRIMARY KEY (session_id, sequence)
        );

        CREATE INDEX IF NOT EXISTS idx_mirror_sessions_last_seen
            ON mirror_sessions(last_seen_at DESC);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }
}
