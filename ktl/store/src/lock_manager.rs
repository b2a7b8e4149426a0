use ktl_protocol::{LockLease, RunId};
use rusqlite::{params, OptionalExtension};

use crate::{error::StoreError, writer::Writer};

/// Stack-scoped exclusive lease store (`spec.md` §4.6 "Locking"). One row
/// per `stack_root`; acquiring over a live lease fails with
/// [`StoreError::LockHeld`], acquiring over an expired one takes it over.
#[derive(Clone)]
pub struct LockManager {
    writer: Writer,
}

impl LockManager {
    pub fn new(writer: Writer) -> Self {
        Self { writer }
    }

    /// Attempts to take the lease for `stack_root`. Succeeds if no row
    /// exists, the existing row's lease has expired (takeover), the caller
    /// already owns it (reacquire), or `takeover` is set (forced takeover of
    /// a live lease owned by someone else, `spec.md` §4.6
    /// `AcquireLock(owner, ttl, takeover, runID)`). Otherwise fails with
    /// `LockHeld` while a live lease is owned by someone else.
    pub async fn acquire(
        &self,
        stack_root: &str,
        lease: LockLease,
        takeover: bool,
    ) -> Result<(), StoreError> {
        let stack_root = stack_root.to_string();
        self.writer
            .with_conn(move |conn| {
                let tx = conn.transaction()?;

                let existing: Option<(String, String, String, i64)> = tx
                    .query_row(
                        "SELECT owner, run_id, acquired_at, ttl_seconds FROM locks WHERE stack_root = ?1",
                        params![stack_root],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, i64>(3)?,
                            ))
                        },
                    )
                    .optional()?;

                if let Some((owner, run_id, acquired_at, ttl_seconds)) = existing {
                    let acquired_at = chrono::DateTime::parse_from_rfc3339(&acquired_at)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now());
                    let existing_lease = LockLease {
                        owner: owner.clone(),
                        run_id: RunId(run_id),
                        acquired_at,
                        ttl: std::time::Duration::from_secs(ttl_seconds.max(0) as u64),
                    };
                    let contested = existing_lease.is_live(chrono::Utc::now())
                        && existing_lease.owner != lease.owner;
                    if contested {
                        if !takeover {
                            return Err(StoreError::LockHeld {
                                owner,
                                expires_at: existing_lease.expires_at(),
                            });
                        }
                        tracing::warn!(
                            stack_root = %stack_root,
                            previous_owner = %owner,
                            new_owner = %lease.owner,
                            "forced lock takeover of a live lease"
                        );
                    }
                }

                tx.execute(
                    "INSERT INTO locks (stack_root, owner, run_id, acquired_at, ttl_seconds) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(stack_root) DO UPDATE SET \
                        owner = excluded.owner, \
                        run_id = excluded.run_id, \
                        acquired_at = excluded.acquired_at, \
                        ttl_seconds = excluded.ttl_seconds",
                    params![
                        stack_root,
                        lease.owner,
                        lease.run_id.0,
                        lease.acquired_at.to_rfc3339(),
                        lease.ttl.as_secs() as i64,
                    ],
                )?;

                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Best-effort release: only removes the row if `owner` still matches,
    /// so a process that lost its lease to a takeover can't clobber the new
    /// owner's row on its way out (`spec.md` §4.6 "release is best-effort").
    pub async fn release(&self, stack_root: &str, owner: &str) -> Result<(), StoreError> {
        let stack_root = stack_root.to_string();
        let owner = owner.to_string();
        self.writer
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM locks WHERE stack_root = ?1 AND owner = ?2",
                    params![stack_root, owner],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn current(&self, stack_root: &str) -> Result<Option<LockLease>, StoreError> {
        let stack_root = stack_root.to_string();
        self.writer
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT owner, run_id, acquired_at, ttl_seconds FROM locks WHERE stack_root = ?1",
                    params![stack_root],
                    |row| {
                        let owner: String = row.get(0)?;
                        let run_id: String = row.get(1)?;
                        let acquired_at: String = row.get(2)?;
                        let ttl_seconds: i64 = row.get(3)?;
                        Ok((owner, run_id, acquired_at, ttl_seconds))
                    },
                )
                .optional()?
                .map(|(owner, run_id, acquired_at, ttl_seconds)| {
                    let acquired_at = chrono::DateTime::parse_from_rfc3339(&acquired_at)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now());
                    Ok(LockLease {
                        owner,
                        run_id: RunId(run_id),
                        acquired_at,
                        ttl: std::time::Duration::from_secs(ttl_seconds.max(0) as u64),
                    })
                })
                .transpose()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(owner: &str, run_id: &str) -> LockLease {
        LockLease {
            owner: owner.into(),
            run_id: RunId(run_id.into()),
            acquired_at: chrono::Utc::now(),
            ttl: std::time::Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn second_acquire_by_different_owner_fails_while_live() {
        let manager = LockManager::new(Writer::open_in_memory().unwrap());
        manager.acquire("/stacks/demo", lease("alice", "r1"), false).await.unwrap();
        let err = manager
            .acquire("/stacks/demo", lease("bob", "r2"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockHeld { .. }));
    }

    #[tokio::test]
    async fn acquire_over_expired_lease_takes_over() {
        let manager = LockManager::new(Writer::open_in_memory().unwrap());
        let mut expired = lease("alice", "r1");
        expired.acquired_at = chrono::Utc::now() - chrono::Duration::seconds(600);
        expired.ttl = std::time::Duration::from_secs(1);
        manager.acquire("/stacks/demo", expired, false).await.unwrap();

        manager.acquire("/stacks/demo", lease("bob", "r2"), false).await.unwrap();
        let current = manager.current("/stacks/demo").await.unwrap().unwrap();
        assert_eq!(current.owner, "bob");
    }

    #[tokio::test]
    async fn forced_takeover_overwrites_a_live_lease_owned_by_someone_else() {
        let manager = LockManager::new(Writer::open_in_memory().unwrap());
        manager.acquire("/stacks/demo", lease("alice", "r1"), false).await.unwrap();

        // Without takeover, bob is blocked by alice's still-live lease.
        let err = manager
            .acquire("/stacks/demo", lease("bob", "r2"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockHeld { .. }));

        // With takeover, bob succeeds despite alice's lease being live.
        manager.acquire("/stacks/demo", lease("bob", "r2"), true).await.unwrap();
        let current = manager.current("/stacks/demo").await.unwrap().unwrap();
        assert_eq!(current.owner, "bob");
    }

    #[tokio::test]
    async fn release_is_noop_for_non_owner() {
        let manager = LockManager::new(Writer::open_in_memory().unwrap());
        manager.acquire("/stacks/demo", lease("alice", "r1"), false).await.unwrap();
        manager.release("/stacks/demo", "bob").await.unwrap();
        assert!(manager.current("/stacks/demo").await.unwrap().is_some());
        manager.release("/stacks/demo", "alice").await.unwrap();
        assert!(manager.current("/stacks/demo").await.unwrap().is_none());
    }
}
