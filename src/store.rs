use crate::error::AppError;
use crate::types::StudentEvaluation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use std::path::PathBuf;
use time::OffsetDateTime;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Flattened call record as persisted. The full transcript rides along as a
/// JSON document rather than a child table; call logs are written once at
/// call end and read back whole.
#[derive(Serialize, Deserialize, sqlx::FromRow, Clone, Debug)]
pub struct CallLogRow {
    pub id: Uuid,
    pub student_id: Option<String>,
    pub tpo_id: Option<String>,
    pub contact_type: String,
    pub duration_secs: i64,
    pub status: String,
    pub notes: String,
    pub transcript: serde_json::Value,
    pub jotform_sent: bool,
    pub teams_scheduled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait CallLogStore: Send + Sync {
    /// Insert or replace the record for `row.id`. Retried writes of the same
    /// call must not produce duplicates.
    async fn upsert_call_log(&self, row: &CallLogRow) -> Result<(), AppError>;

    /// All persisted call logs, newest first.
    async fn list_call_logs(&self) -> Result<Vec<CallLogRow>, AppError>;

    async fn update_student_evaluation(
        &self,
        student_id: &str,
        evaluation: &StudentEvaluation,
    ) -> Result<(), AppError>;
}

pub struct PgCallLogStore {
    pool: PgPool,
}

impl PgCallLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallLogStore for PgCallLogStore {
    async fn upsert_call_log(&self, row: &CallLogRow) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO call_logs \
             (id, student_id, tpo_id, contact_type, duration_secs, status, notes, \
              transcript, jotform_sent, teams_scheduled, completed_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (id) DO UPDATE SET \
               duration_secs = EXCLUDED.duration_secs, \
               status = EXCLUDED.status, \
               notes = EXCLUDED.notes, \
               transcript = EXCLUDED.transcript, \
               jotform_sent = EXCLUDED.jotform_sent, \
               teams_scheduled = EXCLUDED.teams_scheduled, \
               completed_at = EXCLUDED.completed_at",
        )
        .bind(row.id)
        .bind(&row.student_id)
        .bind(&row.tpo_id)
        .bind(&row.contact_type)
        .bind(row.duration_secs)
        .bind(&row.status)
        .bind(&row.notes)
        .bind(&row.transcript)
        .bind(row.jotform_sent)
        .bind(row.teams_scheduled)
        .bind(row.completed_at)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error=%e, call_id=%row.id, "failed to upsert call log");
            AppError("failed to upsert call log")
        })?;
        Ok(())
    }

    async fn list_call_logs(&self) -> Result<Vec<CallLogRow>, AppError> {
        sqlx::query_as::<_, CallLogRow>(
            "SELECT id, student_id, tpo_id, contact_type, duration_secs, status, notes, \
             transcript, jotform_sent, teams_scheduled, completed_at, created_at \
             FROM call_logs ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(error=%e, "failed to list call logs");
            AppError("failed to list call logs")
        })
    }

    async fn update_student_evaluation(
        &self,
        student_id: &str,
        evaluation: &StudentEvaluation,
    ) -> Result<(), AppError> {
        let evaluation = serde_json::to_value(evaluation)
            .map_err(|_| AppError("failed to serialize evaluation"))?;
        sqlx::query("UPDATE students SET evaluation = $1, updated_at = now() WHERE id = $2")
            .bind(evaluation)
            .bind(student_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(error=%e, student_id, "failed to update student evaluation");
                AppError("failed to update student evaluation")
            })?;
        Ok(())
    }
}

/// Durable local queue for call logs the primary store rejected. Entries live
/// in a JSONL file, one call log per line, and survive process restarts. An
/// entry is removed only after its own write has been confirmed, so a sweep
/// interrupted midway loses nothing.
///
/// Every operation is a read-modify-write of the whole file, so all of them
/// are serialized behind one async mutex (shared across clones) and rewrite
/// the file through a temp file plus rename; concurrent pushes from two
/// failing sessions cannot overwrite each other, and a crash mid-write never
/// clobbers entries already queued.
#[derive(Clone, Debug)]
pub struct BackupQueue {
    path: PathBuf,
    file_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl BackupQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_lock: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub async fn push(&self, row: &CallLogRow) -> Result<(), AppError> {
        let line = serde_json::to_string(row)
            .map_err(|_| AppError("failed to serialize backup entry"))?;
        let _guard = self.file_lock.lock().await;
        let mut contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                error!(error=%e, "failed to read backup queue");
                return Err(AppError("failed to read backup queue"));
            }
        };
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&line);
        contents.push('\n');
        self.replace_file(contents).await?;
        debug!(call_id=%row.id, "call log queued for retry");
        Ok(())
    }

    pub async fn load(&self) -> Result<Vec<CallLogRow>, AppError> {
        let _guard = self.file_lock.lock().await;
        self.read_rows().await
    }

    /// Drop the entry for `id`, keeping all others.
    pub async fn remove(&self, id: Uuid) -> Result<(), AppError> {
        let _guard = self.file_lock.lock().await;
        let rows = self.read_rows().await?;
        let mut contents = String::new();
        for row in rows.iter().filter(|r| r.id != id) {
            let line = serde_json::to_string(row)
                .map_err(|_| AppError("failed to serialize backup entry"))?;
            contents.push_str(&line);
            contents.push('\n');
        }
        self.replace_file(contents).await
    }

    async fn read_rows(&self) -> Result<Vec<CallLogRow>, AppError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                error!(error=%e, "failed to read backup queue");
                return Err(AppError("failed to read backup queue"));
            }
        };
        let mut rows = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CallLogRow>(line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(error=%e, "skipping malformed backup entry"),
            }
        }
        Ok(rows)
    }

    async fn replace_file(&self, contents: String) -> Result<(), AppError> {
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await.map_err(|e| {
            error!(error=%e, "failed to write backup queue");
            AppError("failed to write backup queue")
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            error!(error=%e, "failed to replace backup queue");
            AppError("failed to replace backup queue")
        })?;
        Ok(())
    }
}

/// In-memory store used by tests. Write failures are switchable so the
/// backup-queue path can be exercised.
pub struct MemoryCallStore {
    rows: std::sync::Mutex<Vec<CallLogRow>>,
    evaluations: std::sync::Mutex<Vec<(String, StudentEvaluation)>>,
    fail_writes: std::sync::atomic::AtomicBool,
    fail_for: std::sync::Mutex<Option<Uuid>>,
    upsert_attempts: std::sync::atomic::AtomicUsize,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self {
            rows: std::sync::Mutex::new(Vec::new()),
            evaluations: std::sync::Mutex::new(Vec::new()),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
            fail_for: std::sync::Mutex::new(None),
            upsert_attempts: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Reject writes for one specific call id while accepting the rest.
    pub fn set_fail_for(&self, id: Option<Uuid>) {
        *self.fail_for.lock().unwrap() = id;
    }

    pub fn rows(&self) -> Vec<CallLogRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn evaluations(&self) -> Vec<(String, StudentEvaluation)> {
        self.evaluations.lock().unwrap().clone()
    }

    pub fn upsert_attempts(&self) -> usize {
        self.upsert_attempts
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for MemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallLogStore for MemoryCallStore {
    async fn upsert_call_log(&self, row: &CallLogRow) -> Result<(), AppError> {
        self.upsert_attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError("store unavailable"));
        }
        if *self.fail_for.lock().unwrap() == Some(row.id) {
            return Err(AppError("store rejected this record"));
        }
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows.iter_mut().find(|r| r.id == row.id) {
            *existing = row.clone();
        } else {
            rows.push(row.clone());
        }
        Ok(())
    }

    async fn list_call_logs(&self) -> Result<Vec<CallLogRow>, AppError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError("store unavailable"));
        }
        let mut rows = self.rows.lock().unwrap().clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update_student_evaluation(
        &self,
        student_id: &str,
        evaluation: &StudentEvaluation,
    ) -> Result<(), AppError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError("store unavailable"));
        }
        self.evaluations
            .lock()
            .unwrap()
            .push((student_id.to_string(), evaluation.clone()));
        Ok(())
    }
}
