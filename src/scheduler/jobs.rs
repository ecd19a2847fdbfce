/**
 * Janitor Jobs
 *
 * Each job returns `Ok(true)` when a full batch was processed and more
 * work likely remains, so the scheduler re-arms it on the short
 * interval.
 */

use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::ApiError;

/// Orphaned files older than this are eligible for cleanup.
const FILE_MIN_AGE_MINUTES: i32 = 30;
/// Rows fetched per file-cleanup batch.
const FILE_BATCH: i64 = 10_000;
/// Concurrent storage DELETEs per batch.
const FILE_DELETE_CONCURRENCY: usize = 100;
/// Soft-deleted posts older than this are compacted.
const POST_MIN_AGE_DAYS: i32 = 3;
/// Rows promoted per pending-email batch.
const EMAIL_BATCH: i64 = 1000;

/// The scheduled janitor jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Delete unreferenced file rows and their stored objects.
    FileCleanup,
    /// Compact posts soft-deleted more than three days ago.
    PostCleanup,
    /// Promote confirmed pending email addresses past their deadline.
    PendingEmail,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::FileCleanup => "file_cleanup",
            JobKind::PostCleanup => "post_cleanup",
            JobKind::PendingEmail => "pending_email",
        }
    }

    pub async fn run(&self, ctx: &JobContext) -> Result<bool, ApiError> {
        match self {
            JobKind::FileCleanup => file_cleanup(ctx).await,
            JobKind::PostCleanup => post_cleanup(ctx).await,
            JobKind::PendingEmail => pending_email(ctx).await,
        }
    }
}

/// Everything a job needs to do its work.
pub struct JobContext {
    pub pool: PgPool,
    pub http: reqwest::Client,
    pub storage_base_url: String,
    pub server_id: i64,
    pub worker_id: i64,
    pub total_servers: i64,
    pub total_workers: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanedFile {
    file_id: i64,
    objects: Vec<String>,
}

/// Delete unreferenced files in batches. Work is sharded by context so
/// no two live processes ever race on the same rows: a process only
/// touches contexts where `context_id mod total_servers` and
/// `context_id mod total_workers` match its own identity.
async fn file_cleanup(ctx: &JobContext) -> Result<bool, ApiError> {
    let rows = sqlx::query_as::<_, OrphanedFile>(
        r#"
        SELECT file_id, objects
        FROM files
        WHERE reference_count = 0
          AND created_at < NOW() - make_interval(mins => $1)
          AND context_id % $2 = $3
          AND context_id % $4 = $5
        LIMIT $6
        "#,
    )
    .bind(FILE_MIN_AGE_MINUTES)
    .bind(ctx.total_servers)
    .bind(ctx.server_id)
    .bind(ctx.total_workers)
    .bind(ctx.worker_id)
    .bind(FILE_BATCH)
    .fetch_all(&ctx.pool)
    .await?;

    if rows.is_empty() {
        return Ok(false);
    }
    let batch_full = rows.len() as i64 == FILE_BATCH;
    tracing::info!(count = rows.len(), "[Scheduler] Cleaning orphaned files");

    let permits = Arc::new(Semaphore::new(FILE_DELETE_CONCURRENCY));
    for row in rows {
        let mut deletes: JoinSet<bool> = JoinSet::new();
        for object in &row.objects {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| ApiError::internal(e))?;
            let http = ctx.http.clone();
            let url = format!("{}/{}", ctx.storage_base_url.trim_end_matches('/'), object);
            deletes.spawn(async move {
                let _permit = permit;
                match http.delete(&url).send().await {
                    Ok(response) if response.status().is_success() || response.status().as_u16() == 404 => true,
                    Ok(response) => {
                        tracing::warn!(url, status = response.status().as_u16(), "[Scheduler] Object delete rejected");
                        false
                    }
                    Err(e) => {
                        tracing::warn!(url, "[Scheduler] Object delete failed: {e}");
                        false
                    }
                }
            });
        }

        let mut all_deleted = true;
        while let Some(result) = deletes.join_next().await {
            if !matches!(result, Ok(true)) {
                all_deleted = false;
            }
        }
        // Keep the row if any object survived; it will be retried on the
        // next pass.
        if !all_deleted {
            continue;
        }

        sqlx::query("DELETE FROM files WHERE file_id = $1")
            .bind(row.file_id)
            .execute(&ctx.pool)
            .await?;
    }

    Ok(batch_full)
}

/// Remove posts marked deleted more than three days ago, one statement.
async fn post_cleanup(ctx: &JobContext) -> Result<bool, ApiError> {
    let result = sqlx::query(
        r#"
        DELETE FROM posts
        WHERE is_deleted = TRUE
          AND deleted_at < NOW() - make_interval(days => $1)
        "#,
    )
    .bind(POST_MIN_AGE_DAYS)
    .execute(&ctx.pool)
    .await?;

    if result.rows_affected() > 0 {
        tracing::info!(count = result.rows_affected(), "[Scheduler] Compacted deleted posts");
    }
    Ok(false)
}

/// Promote `pending_email -> email` for rows whose confirmation deadline
/// has passed, including rows whose deadline is exactly now.
async fn pending_email(ctx: &JobContext) -> Result<bool, ApiError> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET email = pending_email, pending_email = NULL, pending_email_deadline = NULL
        WHERE user_id IN (
            SELECT user_id FROM users
            WHERE pending_email IS NOT NULL
              AND pending_email_deadline <= NOW()
            LIMIT $1
        )
        "#,
    )
    .bind(EMAIL_BATCH)
    .execute(&ctx.pool)
    .await?;

    let promoted = result.rows_affected() as i64;
    if promoted > 0 {
        tracing::info!(count = promoted, "[Scheduler] Promoted pending emails");
    }
    Ok(promoted == EMAIL_BATCH)
}
