/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable work queue. Every unit of federation work (an inbound
//! activity to process, an outbound delivery, a scheduled housekeeping
//! task) is a row that survives restarts. Items move
//! PENDING → IN_FLIGHT → gone (acked), back to PENDING (retry with
//! backoff) or to the dead-letter archive. A per-user lease guarantees
//! at most one in-flight item per user, which preserves per-user
//! ordering across the whole worker pool.

use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::json;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{info, warn};

const STATUS_PENDING: i64 = 0;
const STATUS_IN_FLIGHT: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Inbound activity to process into local state.
    Input,
    /// Outbound activity to sign and POST to a remote inbox.
    Output,
    /// Scheduled housekeeping (question close, actor refresh, object
    /// request). Must be safe to retry on a different worker.
    Task,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Input => "input",
            JobKind::Output => "output",
            JobKind::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(JobKind::Input),
            "output" => Some(JobKind::Output),
            "task" => Some(JobKind::Task),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    /// Scope: jobs with the same user are processed one at a time, in
    /// order. None = shared scope, no exclusivity.
    pub user: Option<String>,
    /// Delivery target (inbox or actor URL) for Output jobs.
    pub target: Option<String>,
    pub payload: Vec<u8>,
    /// Key id to re-sign with on each Output attempt; signatures are
    /// time-bound and never reused across attempts.
    pub key_id: Option<String>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub output_max_attempts: u32,
    pub input_max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            output_max_attempts: 10,
            input_max_attempts: 3,
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
        }
    }
}

impl QueueSettings {
    /// Inbound data is transient, so inbound (and task) items get the
    /// small bound; federation partners are assumed to recover, so
    /// outbound items are retried much longer.
    pub fn max_attempts(&self, kind: JobKind) -> u32 {
        match kind {
            JobKind::Output => self.output_max_attempts,
            JobKind::Input | JobKind::Task => self.input_max_attempts,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        next_backoff(attempt, self.base_backoff_secs, self.max_backoff_secs)
    }
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    db_path: PathBuf,
    error_dir: PathBuf,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn open(db_path: impl AsRef<Path>, error_dir: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let error_dir = error_dir.as_ref().to_path_buf();
        fs::create_dir_all(&error_dir)
            .with_context(|| format!("create {}", error_dir.display()))?;
        init_db(&db_path)?;
        recover_in_flight(&db_path)?;
        Ok(Self {
            db_path,
            error_dir,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn notify_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn enqueue(
        &self,
        kind: JobKind,
        user: Option<&str>,
        target: Option<&str>,
        payload: Vec<u8>,
        key_id: Option<&str>,
    ) -> Result<String> {
        self.enqueue_at(kind, user, target, payload, key_id, now_ms())
            .await
    }

    /// Enqueues with an explicit not-before timestamp (scheduled
    /// tasks).
    pub async fn enqueue_at(
        &self,
        kind: JobKind,
        user: Option<&str>,
        target: Option<&str>,
        payload: Vec<u8>,
        key_id: Option<&str>,
        not_before_ms: i64,
    ) -> Result<String> {
        let job_id = new_job_id();
        let created_at = now_ms();
        let id = job_id.clone();
        let user = user.map(str::to_string);
        let target = target.map(str::to_string);
        let key_id = key_id.map(str::to_string);
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(db_path)?;
            conn.execute(
                r#"
                INSERT INTO queue_jobs (
                  id, created_at_ms, next_attempt_at_ms, attempt, status,
                  kind, user, target, payload, key_id, claimed_by, last_error
                ) VALUES (?1, ?2, ?3, 0, 0, ?4, ?5, ?6, ?7, ?8, NULL, NULL)
                "#,
                params![
                    id,
                    created_at,
                    not_before_ms,
                    kind.as_str(),
                    user,
                    target,
                    payload,
                    key_id
                ],
            )?;
            Ok(())
        })
        .await??;

        self.notify.notify_one();
        Ok(job_id)
    }

    /// Claims the oldest due item whose user scope is free, marking it
    /// IN_FLIGHT under the caller's name. Returns None when nothing is
    /// claimable right now.
    pub async fn dequeue_next(&self, worker: &str) -> Result<Option<Job>> {
        let db_path = self.db_path.clone();
        let worker = worker.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Job>> {
            let mut conn = Connection::open(db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms();
            let row = tx
                .query_row(
                    r#"
                    SELECT id, kind, user, target, payload, key_id, attempt
                    FROM queue_jobs
                    WHERE status = 0 AND next_attempt_at_ms <= ?1
                      AND (user IS NULL OR user NOT IN
                           (SELECT user FROM queue_jobs
                            WHERE status = 1 AND user IS NOT NULL))
                    ORDER BY created_at_ms ASC, id ASC
                    LIMIT 1
                    "#,
                    params![now],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Vec<u8>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, u32>(6)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, kind, user, target, payload, key_id, attempt)) = row else {
                tx.commit()?;
                return Ok(None);
            };
            tx.execute(
                "UPDATE queue_jobs SET status = ?2, claimed_by = ?3 WHERE id = ?1",
                params![id, STATUS_IN_FLIGHT, worker],
            )?;
            tx.commit()?;

            let Some(kind) = JobKind::parse(&kind) else {
                warn!("dropping queue row {id} with unknown kind {kind}");
                conn.execute("DELETE FROM queue_jobs WHERE id = ?1", params![id])?;
                return Ok(None);
            };
            Ok(Some(Job {
                id,
                kind,
                user,
                target,
                payload,
                key_id,
                attempt,
            }))
        })
        .await?
    }

    /// Terminal success: the item is deleted.
    pub async fn ack(&self, job: &Job) -> Result<()> {
        let db_path = self.db_path.clone();
        let id = job.id.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(db_path)?;
            conn.execute("DELETE FROM queue_jobs WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Transient failure: back to PENDING with an incremented attempt
    /// and a not-before timestamp.
    pub async fn retry(&self, job: &Job, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        let attempt = job.attempt.saturating_add(1);
        let db_path = self.db_path.clone();
        let id = job.id.clone();
        let err = err.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(db_path)?;
            conn.execute(
                r#"
                UPDATE queue_jobs
                SET status = 0, claimed_by = NULL, attempt = ?2,
                    next_attempt_at_ms = ?3, last_error = ?4
                WHERE id = ?1
                "#,
                params![id, attempt, next, err],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Permanent failure: the payload is preserved in the error
    /// archive for operator inspection, then the item is removed from
    /// the queue.
    pub async fn dead_letter(&self, job: &Job, err: &str) -> Result<()> {
        let record = json!({
            "id": job.id,
            "kind": job.kind.as_str(),
            "user": job.user,
            "target": job.target,
            "key_id": job.key_id,
            "attempt": job.attempt,
            "error": err,
            "payload": serde_json::from_slice::<serde_json::Value>(&job.payload)
                .unwrap_or_else(|_| json!(String::from_utf8_lossy(&job.payload))),
        });
        let archive = self.error_dir.join(format!("{}-{}.json", now_ms(), job.id));
        fs::write(&archive, serde_json::to_vec_pretty(&record)?)
            .with_context(|| format!("archive {}", archive.display()))?;
        warn!(
            "dead-lettering job {} ({}) after {} attempts: {err}",
            job.id,
            job.kind.as_str(),
            job.attempt
        );
        self.ack(job).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<QueueStats> {
            let conn = Connection::open(db_path)?;
            let pending: u64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_jobs WHERE status = 0",
                [],
                |r| r.get(0),
            )?;
            let in_flight: u64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_jobs WHERE status = 1",
                [],
                |r| r.get(0),
            )?;
            Ok(QueueStats { pending, in_flight })
        })
        .await?
    }

}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS queue_jobs (
          id TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          kind TEXT NOT NULL,
          user TEXT NULL,
          target TEXT NULL,
          payload BLOB NOT NULL,
          key_id TEXT NULL,
          claimed_by TEXT NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queue_due ON queue_jobs(status, next_attempt_at_ms);
        CREATE INDEX IF NOT EXISTS idx_queue_user ON queue_jobs(user, status);
        "#,
    )?;
    Ok(())
}

/// A crashed process leaves items IN_FLIGHT; treat them as PENDING on
/// the next open so no work is lost.
fn recover_in_flight(path: &Path) -> Result<()> {
    let conn = Connection::open(path)?;
    let n = conn.execute(
        "UPDATE queue_jobs SET status = 0, claimed_by = NULL WHERE status = ?1",
        params![STATUS_IN_FLIGHT],
    )?;
    if n > 0 {
        info!("recovered {n} in-flight queue items");
    }
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub(crate) fn new_job_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

/// Exponential backoff, capped, with up to a second of jitter. The
/// base delay never decreases as the attempt number grows.
pub fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let mut secs = base_secs.saturating_mul(1u64 << pow);
    if secs > max_secs {
        secs = max_secs;
    }
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

/// Activity id of a serialized payload, falling back to a content
/// digest for payloads without one.
pub fn activity_id_from_bytes(bytes: &[u8]) -> Option<String> {
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(bytes) {
        if let Some(id) = v.get("id").and_then(|v| v.as_str()) {
            let id = id.trim();
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    if bytes.is_empty() {
        return None;
    }
    use sha2::Digest as _;
    let mut h = sha2::Sha256::new();
    h.update(bytes);
    Some(format!("urn:murex:activity:sha256:{}", hex::encode(h.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue(dir: &Path) -> JobQueue {
        JobQueue::open(dir.join("queue.db"), dir.join("error")).unwrap()
    }

    #[tokio::test]
    async fn per_user_lease_preserves_order() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        let a = q
            .enqueue(JobKind::Output, Some("alice"), Some("inbox-a"), b"A".to_vec(), None)
            .await
            .unwrap();
        let b = q
            .enqueue(JobKind::Output, Some("alice"), Some("inbox-b"), b"B".to_vec(), None)
            .await
            .unwrap();

        let first = q.dequeue_next("w1").await.unwrap().unwrap();
        assert_eq!(first.id, a);
        // B stays invisible while A is in flight for the same user.
        assert!(q.dequeue_next("w2").await.unwrap().is_none());

        q.ack(&first).await.unwrap();
        let second = q.dequeue_next("w2").await.unwrap().unwrap();
        assert_eq!(second.id, b);
        q.ack(&second).await.unwrap();
        assert!(q.dequeue_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shared_scope_has_no_lease() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        q.enqueue(JobKind::Task, None, None, b"t1".to_vec(), None)
            .await
            .unwrap();
        q.enqueue(JobKind::Task, None, None, b"t2".to_vec(), None)
            .await
            .unwrap();
        let j1 = q.dequeue_next("w1").await.unwrap().unwrap();
        let j2 = q.dequeue_next("w2").await.unwrap().unwrap();
        assert_ne!(j1.id, j2.id);
    }

    #[tokio::test]
    async fn different_users_run_concurrently() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        q.enqueue(JobKind::Input, Some("alice"), None, b"a".to_vec(), None)
            .await
            .unwrap();
        q.enqueue(JobKind::Input, Some("bob"), None, b"b".to_vec(), None)
            .await
            .unwrap();
        let j1 = q.dequeue_next("w1").await.unwrap().unwrap();
        let j2 = q.dequeue_next("w2").await.unwrap().unwrap();
        assert_ne!(j1.user, j2.user);
    }

    #[tokio::test]
    async fn retry_until_exhaustion_then_dead_letter() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        let settings = QueueSettings {
            output_max_attempts: 3,
            ..Default::default()
        };
        q.enqueue(
            JobKind::Output,
            Some("alice"),
            Some("https://down.example/inbox"),
            br#"{"id":"https://social.example/users/alice/p/1"}"#.to_vec(),
            Some("key"),
        )
        .await
        .unwrap();

        let mut last_base = Duration::ZERO;
        loop {
            let job = q.dequeue_next("w").await.unwrap().unwrap();
            let attempt = job.attempt + 1;
            if attempt >= settings.max_attempts(job.kind) {
                q.dead_letter(&job, "connect refused").await.unwrap();
                break;
            }
            // Delay grows monotonically (jitter aside).
            let base = Duration::from_secs(
                settings.base_backoff_secs
                    * (1u64 << (attempt.saturating_sub(1)).min(20)),
            );
            assert!(base >= last_base);
            last_base = base;
            q.retry(&job, Duration::ZERO, "connect refused").await.unwrap();
        }

        // Dead items never come back...
        assert!(q.dequeue_next("w").await.unwrap().is_none());
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending + stats.in_flight, 0);
        // ...but their content is preserved for inspection.
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("error"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test]
    async fn scheduled_items_are_invisible_until_due() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        q.enqueue_at(
            JobKind::Task,
            None,
            None,
            b"later".to_vec(),
            None,
            now_ms() + 60_000,
        )
        .await
        .unwrap();
        assert!(q.dequeue_next("w").await.unwrap().is_none());
        assert_eq!(q.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn reopen_recovers_in_flight_items() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        q.enqueue(JobKind::Input, Some("alice"), None, b"x".to_vec(), None)
            .await
            .unwrap();
        let job = q.dequeue_next("w").await.unwrap().unwrap();
        assert!(q.dequeue_next("w").await.unwrap().is_none());
        drop(job);

        // Simulated crash: a fresh open must surface the item again.
        let q2 = queue(dir.path());
        assert!(q2.dequeue_next("w").await.unwrap().is_some());
    }

    #[test]
    fn backoff_is_nondecreasing_and_capped() {
        let base = 5;
        let cap = 3600;
        let mut last = Duration::ZERO;
        for attempt in 1..=20 {
            let d = next_backoff(attempt, base, cap);
            assert!(d + Duration::from_secs(1) >= last);
            assert!(d <= Duration::from_secs(cap) + Duration::from_secs(1));
            last = d;
        }
    }

    #[test]
    fn activity_id_extraction() {
        assert_eq!(
            activity_id_from_bytes(br#"{"id":"https://x.example/1"}"#).as_deref(),
            Some("https://x.example/1")
        );
        assert!(activity_id_from_bytes(b"not json")
            .unwrap()
            .starts_with("urn:murex:activity:sha256:"));
        assert!(activity_id_from_bytes(b"").is_none());
    }
}
