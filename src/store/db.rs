use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

const RUN_COLUMNS: &str =
    "id, title, ticket, workspace, status, patch_decision, created_at, updated_at";

const STEP_COLUMNS: &str = "id, run_id, step_order, name, status, summary, error, log_path, \
     artifact_path, started_at, finished_at";

fn run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        title: row.get(1)?,
        ticket: row.get(2)?,
        workspace: row.get(3)?,
        status: row.get(4)?,
        patch_decision: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        order: row.get(2)?,
        name: row.get(3)?,
        status: row.get(4)?,
        summary: row.get(5)?,
        error: row.get(6)?,
        log_path: row.get(7)?,
        artifact_path: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}

fn artifact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: row.get(0)?,
        run_id: row.get(1)?,
        kind: row.get(2)?,
        path: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// SQLite-backed store for runs, steps, artifacts, run-scoped key/values
/// and the run queue.
pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    ticket TEXT NOT NULL,
                    workspace TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'created',
                    patch_decision TEXT NOT NULL DEFAULT 'no',
                    lease_owner TEXT,
                    lease_expires_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_order INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    summary TEXT NOT NULL DEFAULT '',
                    error TEXT NOT NULL DEFAULT '',
                    log_path TEXT NOT NULL DEFAULT '',
                    artifact_path TEXT NOT NULL DEFAULT '',
                    started_at TEXT,
                    finished_at TEXT,
                    UNIQUE(run_id, step_order)
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    path TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS run_kv (
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (run_id, key)
                );

                CREATE TABLE IF NOT EXISTS run_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, title: &str, ticket: &str, workspace: &str) -> Result<Run> {
        self.conn
            .execute(
                "INSERT INTO runs (title, ticket, workspace) VALUES (?1, ?2, ?3)",
                params![title, ticket, workspace],
            )
            .context("Failed to insert run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                run_row,
            )
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Most recent first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"))
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![limit as i64], run_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    pub fn set_run_status(&self, id: i64, status: RunStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update run status")?;
        Ok(())
    }

    /// Pipeline-side status write. Never overwrites `canceled`; returns
    /// false when the run was canceled (or no longer exists).
    pub fn advance_run_status(&self, id: i64, status: RunStatus) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET status = ?1, updated_at = datetime('now') \
                 WHERE id = ?2 AND status != 'canceled'",
                params![status.as_str(), id],
            )
            .context("Failed to update run status")?;
        Ok(changed > 0)
    }

    pub fn set_patch_decision(&self, id: i64, decision: PatchDecision) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET patch_decision = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![decision.as_str(), id],
            )
            .context("Failed to update patch decision")?;
        Ok(())
    }

    /// Remove the run and everything hanging off it.
    pub fn delete_run(&self, id: i64) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for table in ["run_queue", "run_kv", "artifacts", "steps"] {
            tx.execute(&format!("DELETE FROM {table} WHERE run_id = ?1"), params![id])
                .with_context(|| format!("Failed to delete {table} rows"))?;
        }
        let count = tx
            .execute("DELETE FROM runs WHERE id = ?1", params![id])
            .context("Failed to delete run")?;
        tx.commit().context("Failed to commit run delete")?;
        Ok(count > 0)
    }

    // ── Steps ─────────────────────────────────────────────────────────

    pub fn init_steps(&self, run_id: i64, names: &[&str]) -> Result<Vec<Step>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for (i, name) in names.iter().enumerate() {
            tx.execute(
                "INSERT INTO steps (run_id, step_order, name) VALUES (?1, ?2, ?3)",
                params![run_id, (i + 1) as i64, name],
            )
            .context("Failed to insert step")?;
        }
        tx.commit().context("Failed to commit steps")?;
        self.list_steps(run_id)
    }

    pub fn list_steps(&self, run_id: i64) -> Result<Vec<Step>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_order"
            ))
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![run_id], step_row)
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read step row")?.into_step()?);
        }
        Ok(steps)
    }

    pub fn delete_steps(&self, run_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM steps WHERE run_id = ?1", params![run_id])
            .context("Failed to delete steps")?;
        Ok(())
    }

    /// Reset every step with `order >= from_order` to pending with cleared
    /// fields.
    pub fn reset_steps_from(&self, run_id: i64, from_order: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE steps SET status = 'pending', summary = '', error = '', log_path = '',
                     artifact_path = '', started_at = NULL, finished_at = NULL
                 WHERE run_id = ?1 AND step_order >= ?2",
                params![run_id, from_order],
            )
            .context("Failed to reset steps")
    }

    /// Put a single step back to pending with cleared fields.
    pub fn set_step_pending(&self, step_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE steps SET status = 'pending', summary = '', error = '', log_path = '',
                     artifact_path = '', started_at = NULL, finished_at = NULL
                 WHERE id = ?1",
                params![step_id],
            )
            .context("Failed to reset step")?;
        Ok(())
    }

    pub fn set_step_running(&self, step_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE steps SET status = 'running', started_at = datetime('now'), error = ''
                 WHERE id = ?1",
                params![step_id],
            )
            .context("Failed to mark step running")?;
        Ok(())
    }

    pub fn set_step_waiting(&self, step_id: i64, summary: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE steps SET status = 'waiting', summary = ?1 WHERE id = ?2",
                params![summary, step_id],
            )
            .context("Failed to mark step waiting")?;
        Ok(())
    }

    pub fn set_step_success(
        &self,
        step_id: i64,
        summary: &str,
        log_path: &str,
        artifact_path: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE steps SET status = 'success', summary = ?1, log_path = ?2,
                     artifact_path = ?3, finished_at = datetime('now')
                 WHERE id = ?4",
                params![summary, log_path, artifact_path, step_id],
            )
            .context("Failed to mark step success")?;
        Ok(())
    }

    pub fn set_step_failed(&self, step_id: i64, error: &str, log_path: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE steps SET status = 'failed', error = ?1, log_path = ?2,
                     finished_at = datetime('now')
                 WHERE id = ?3",
                params![error, log_path, step_id],
            )
            .context("Failed to mark step failed")?;
        Ok(())
    }

    pub fn set_step_skipped(&self, step_id: i64, summary: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE steps SET status = 'skipped', summary = ?1, error = '',
                     finished_at = datetime('now')
                 WHERE id = ?2",
                params![summary, step_id],
            )
            .context("Failed to mark step skipped")?;
        Ok(())
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn add_artifact(&self, run_id: i64, kind: &str, path: &str) -> Result<Artifact> {
        self.conn
            .execute(
                "INSERT INTO artifacts (run_id, kind, path) VALUES (?1, ?2, ?3)",
                params![run_id, kind, path],
            )
            .context("Failed to insert artifact")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, run_id, kind, path, created_at FROM artifacts WHERE id = ?1",
                params![id],
                artifact_row,
            )
            .context("Artifact not found after insert")
    }

    /// Creation order.
    pub fn list_artifacts(&self, run_id: i64) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, kind, path, created_at FROM artifacts
                 WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![run_id], artifact_row)
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?);
        }
        Ok(artifacts)
    }

    pub fn latest_artifact(&self, run_id: i64, kind: &str) -> Result<Option<Artifact>> {
        self.conn
            .query_row(
                "SELECT id, run_id, kind, path, created_at FROM artifacts
                 WHERE run_id = ?1 AND kind = ?2 ORDER BY id DESC LIMIT 1",
                params![run_id, kind],
                artifact_row,
            )
            .optional()
            .context("Failed to query latest artifact")
    }

    // ── Run-scoped key/value ──────────────────────────────────────────

    pub fn kv_get(&self, run_id: i64, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM run_kv WHERE run_id = ?1 AND key = ?2",
                params![run_id, key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read run value")
    }

    pub fn kv_set(&self, run_id: i64, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run_kv (run_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id, key) DO UPDATE SET value = excluded.value,
                     updated_at = datetime('now')",
                params![run_id, key, value],
            )
            .context("Failed to write run value")?;
        Ok(())
    }

    // ── Queue and lease ───────────────────────────────────────────────

    pub fn enqueue(&self, run_id: i64) -> Result<()> {
        self.conn
            .execute("INSERT INTO run_queue (run_id) VALUES (?1)", params![run_id])
            .context("Failed to enqueue run")?;
        Ok(())
    }

    /// Pop the oldest queue entry.
    pub fn dequeue(&self) -> Result<Option<i64>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let next: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, run_id FROM run_queue ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read queue")?;
        let Some((entry_id, run_id)) = next else {
            return Ok(None);
        };
        tx.execute("DELETE FROM run_queue WHERE id = ?1", params![entry_id])
            .context("Failed to pop queue entry")?;
        tx.commit().context("Failed to commit dequeue")?;
        Ok(Some(run_id))
    }

    pub fn queue_len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM run_queue", [], |row| row.get(0))
            .context("Failed to count queue")?;
        Ok(n as usize)
    }

    /// Take the run's lease for `owner` unless another owner holds an
    /// unexpired one. Re-acquiring an owned lease extends it.
    pub fn try_acquire_lease(&self, run_id: i64, owner: &str, ttl_secs: u64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE runs SET lease_owner = ?2, lease_expires_at = datetime('now', ?3)
                 WHERE id = ?1 AND (lease_owner IS NULL OR lease_owner = ?2
                     OR lease_expires_at IS NULL OR lease_expires_at <= datetime('now'))",
                params![run_id, owner, format!("+{} seconds", ttl_secs)],
            )
            .context("Failed to acquire run lease")?;
        Ok(count > 0)
    }

    pub fn release_lease(&self, run_id: i64, owner: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET lease_owner = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_owner = ?2",
                params![run_id, owner],
            )
            .context("Failed to release run lease")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_run() -> (RunDb, Run) {
        let db = RunDb::new_in_memory().unwrap();
        let run = db.create_run("Fix rounding", "ticket", "/ws").unwrap();
        (db, run)
    }

    #[test]
    fn test_create_run_defaults() {
        let (db, run) = db_with_run();
        assert_eq!(run.status, RunStatus::Created);
        assert_eq!(run.patch_decision, PatchDecision::No);
        assert_eq!(db.list_runs(10).unwrap().len(), 1);
        assert!(db.get_run(999).unwrap().is_none());
    }

    #[test]
    fn test_status_and_decision_updates() {
        let (db, run) = db_with_run();
        db.set_run_status(run.id, RunStatus::WaitingApproval).unwrap();
        db.set_patch_decision(run.id, PatchDecision::Rejected).unwrap();
        let run = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::WaitingApproval);
        assert_eq!(run.patch_decision, PatchDecision::Rejected);
    }

    #[test]
    fn test_advance_status_keeps_cancel() {
        let (db, run) = db_with_run();
        assert!(db.advance_run_status(run.id, RunStatus::Running).unwrap());
        db.set_run_status(run.id, RunStatus::Canceled).unwrap();
        assert!(!db.advance_run_status(run.id, RunStatus::Failed).unwrap());
        assert_eq!(db.get_run(run.id).unwrap().unwrap().status, RunStatus::Canceled);
        assert!(!db.advance_run_status(999, RunStatus::Failed).unwrap());
    }

    #[test]
    fn test_steps_lifecycle_and_reset() {
        let (db, run) = db_with_run();
        let steps = db.init_steps(run.id, &["A", "B", "C"]).unwrap();
        assert_eq!(steps.iter().map(|s| s.order).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));

        db.set_step_running(steps[0].id).unwrap();
        db.set_step_success(steps[0].id, "ok", "a.log", "a.txt").unwrap();
        db.set_step_failed(steps[1].id, "boom", "b.log").unwrap();
        db.set_step_skipped(steps[2].id, "nothing").unwrap();

        let steps = db.list_steps(run.id).unwrap();
        assert_eq!(steps[0].status, StepStatus::Success);
        assert!(steps[0].started_at.is_some());
        assert_eq!(steps[0].artifact_path, "a.txt");
        assert_eq!(steps[1].error, "boom");
        assert_eq!(steps[2].status, StepStatus::Skipped);

        assert_eq!(db.reset_steps_from(run.id, 2).unwrap(), 2);
        let steps = db.list_steps(run.id).unwrap();
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[1].status, StepStatus::Pending);
        assert_eq!(steps[1].error, "");
        assert!(steps[1].finished_at.is_none());
    }

    #[test]
    fn test_single_step_back_to_pending() {
        let (db, run) = db_with_run();
        let steps = db.init_steps(run.id, &["A", "B"]).unwrap();
        db.set_step_running(steps[0].id).unwrap();
        db.set_step_running(steps[1].id).unwrap();

        db.set_step_pending(steps[1].id).unwrap();
        let steps = db.list_steps(run.id).unwrap();
        assert_eq!(steps[0].status, StepStatus::Running);
        assert_eq!(steps[1].status, StepStatus::Pending);
        assert!(steps[1].started_at.is_none());
    }

    #[test]
    fn test_duplicate_step_order_rejected() {
        let (db, run) = db_with_run();
        db.init_steps(run.id, &["A"]).unwrap();
        assert!(db.init_steps(run.id, &["A"]).is_err());
        db.delete_steps(run.id).unwrap();
        assert!(db.list_steps(run.id).unwrap().is_empty());
    }

    #[test]
    fn test_artifacts_latest_by_kind() {
        let (db, run) = db_with_run();
        db.add_artifact(run.id, "proposal_diff", "/a/1").unwrap();
        db.add_artifact(run.id, "plan", "/a/plan.md").unwrap();
        db.add_artifact(run.id, "proposal_diff", "/a/2").unwrap();
        assert_eq!(db.list_artifacts(run.id).unwrap().len(), 3);
        let latest = db.latest_artifact(run.id, "proposal_diff").unwrap().unwrap();
        assert_eq!(latest.path, "/a/2");
        assert!(db.latest_artifact(run.id, "report").unwrap().is_none());
    }

    #[test]
    fn test_kv_upsert() {
        let (db, run) = db_with_run();
        assert!(db.kv_get(run.id, "patcher_mode").unwrap().is_none());
        db.kv_set(run.id, "patcher_mode", "ollama").unwrap();
        db.kv_set(run.id, "patcher_mode", "hf").unwrap();
        assert_eq!(db.kv_get(run.id, "patcher_mode").unwrap().as_deref(), Some("hf"));
    }

    #[test]
    fn test_queue_is_fifo() {
        let (db, run) = db_with_run();
        let other = db.create_run("b", "t", "/ws").unwrap();
        db.enqueue(run.id).unwrap();
        db.enqueue(other.id).unwrap();
        assert_eq!(db.queue_len().unwrap(), 2);
        assert_eq!(db.dequeue().unwrap(), Some(run.id));
        assert_eq!(db.dequeue().unwrap(), Some(other.id));
        assert_eq!(db.dequeue().unwrap(), None);
    }

    #[test]
    fn test_lease_excludes_other_owner() {
        let (db, run) = db_with_run();
        assert!(db.try_acquire_lease(run.id, "w1", 60).unwrap());
        assert!(!db.try_acquire_lease(run.id, "w2", 60).unwrap());
        assert!(db.try_acquire_lease(run.id, "w1", 60).unwrap());
        db.release_lease(run.id, "w2").unwrap();
        assert!(!db.try_acquire_lease(run.id, "w2", 60).unwrap());
        db.release_lease(run.id, "w1").unwrap();
        assert!(db.try_acquire_lease(run.id, "w2", 60).unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let (db, run) = db_with_run();
        assert!(db.try_acquire_lease(run.id, "w1", 0).unwrap());
        assert!(db.try_acquire_lease(run.id, "w2", 60).unwrap());
    }

    #[test]
    fn test_delete_run_cascades() {
        let (db, run) = db_with_run();
        db.init_steps(run.id, &["A"]).unwrap();
        db.add_artifact(run.id, "plan", "/p").unwrap();
        db.kv_set(run.id, "k", "v").unwrap();
        db.enqueue(run.id).unwrap();
        assert!(db.delete_run(run.id).unwrap());
        assert!(db.get_run(run.id).unwrap().is_none());
        assert!(db.list_steps(run.id).unwrap().is_empty());
        assert_eq!(db.queue_len().unwrap(), 0);
        assert!(!db.delete_run(run.id).unwrap());
    }
}
