//! PostgreSQL repository.
//!
//! Record mutations run in a transaction: the row is read with
//! `SELECT ... FOR UPDATE`, the mutation closure runs against the decoded
//! record, and the result is written back before commit. Concurrent updates
//! of the same batch, video or post therefore serialize on the row lock.
//!
//! Batch counters are the exception: they move in a single
//! `UPDATE ... RETURNING` statement that also settles the batch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::batch::model::{Batch, BatchVideo, CounterDelta};
use crate::error::{BatchError, PublishError, StoreError};
use crate::publisher::model::{ScheduledPost, SocialAccount};

use super::migrations::MigrationRunner;
use super::repository::{
    AccountRepository, BatchMutation, BatchRepository, PostMutation, PostRepository,
    VideoMutation, VideoSweep,
};

const BATCH_COLUMNS: &str = "id, user_id, name, total_videos, completed, failed, in_progress, \
     progress, status, outcome, config, error, created_at, started_at, completed_at, updated_at";

const VIDEO_COLUMNS: &str = "id, batch_id, position, title, description, prompt, config, status, \
     progress, timeline_id, error, attempts, artifacts, started_at, completed_at, updated_at";

const POST_COLUMNS: &str = "id, user_id, video_id, video_path, scheduled_at, timezone, recurring, \
     platforms, status, outcome, error, created_at, updated_at";

/// Counter adjustment with the same clamping and settling rules as
/// `Batch::apply_counters`. Binds: id, completed, failed, in_progress delta,
/// now. The CTE row lock orders concurrent adjustments of one batch.
const ADJUST_COUNTERS_SQL: &str = r#"
WITH cur AS (
    SELECT id AS target, total_videos AS total, status AS old_status,
           LEAST(GREATEST(completed + $2, 0), total_videos) AS c,
           failed + $3 AS f_raw,
           in_progress + $4 AS i_raw
    FROM batches WHERE id = $1 FOR UPDATE
), clamped AS (
    SELECT target, total, old_status, c, i_raw,
           LEAST(GREATEST(f_raw, 0), total - c) AS f
    FROM cur
), next AS (
    SELECT target, total, c, f,
           LEAST(GREATEST(i_raw, 0), total - c - f) AS i,
           CASE WHEN $4 > 0 AND old_status = 'queued' THEN 'processing'
                ELSE old_status END AS s,
           old_status IN ('queued', 'processing', 'paused') AND c + f >= total AS settles
    FROM clamped
)
UPDATE batches SET
    completed = n.c,
    failed = n.f,
    in_progress = CASE WHEN n.settles THEN 0 ELSE n.i END,
    progress = CASE WHEN n.total = 0 THEN 0
                    ELSE LEAST((n.c + n.f)::DOUBLE PRECISION / n.total * 100, 100) END,
    status = CASE WHEN n.settles AND n.c > 0 THEN 'completed'
                  WHEN n.settles THEN 'failed'
                  ELSE n.s END,
    outcome = CASE WHEN NOT n.settles THEN batches.outcome
                   WHEN n.f = 0 THEN 'succeeded'
                   WHEN n.c = 0 THEN 'failed'
                   ELSE 'partial' END,
    completed_at = CASE WHEN n.settles THEN $5 ELSE batches.completed_at END,
    updated_at = $5
FROM next n
WHERE batches.id = n.target
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<usize, StoreError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", column, value)))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(StoreError::Corrupt)
}

fn parse_optional_column<T>(row: &PgRow, column: &str) -> Result<Option<T>, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| s.parse::<T>().map_err(StoreError::Corrupt))
        .transpose()
}

fn batch_from_row(row: &PgRow) -> Result<Batch, StoreError> {
    Ok(Batch {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        total_videos: to_u32(row.try_get("total_videos")?, "total_videos")?,
        completed: to_u32(row.try_get("completed")?, "completed")?,
        failed: to_u32(row.try_get("failed")?, "failed")?,
        in_progress: to_u32(row.try_get("in_progress")?, "in_progress")?,
        progress: row.try_get("progress")?,
        status: parse_column(row, "status")?,
        outcome: parse_optional_column(row, "outcome")?,
        config: serde_json::from_value(row.try_get("config")?)?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn video_from_row(row: &PgRow) -> Result<BatchVideo, StoreError> {
    let progress: i16 = row.try_get("progress")?;
    Ok(BatchVideo {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        position: to_u32(row.try_get("position")?, "position")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        prompt: row.try_get("prompt")?,
        config: serde_json::from_value(row.try_get("config")?)?,
        status: parse_column(row, "status")?,
        progress: u8::try_from(progress)
            .map_err(|_| StoreError::Corrupt(format!("progress out of range: {}", progress)))?,
        timeline_id: row.try_get("timeline_id")?,
        error: row.try_get("error")?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        artifacts: serde_json::from_value(row.try_get("artifacts")?)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn post_from_row(row: &PgRow) -> Result<ScheduledPost, StoreError> {
    let recurring: Option<serde_json::Value> = row.try_get("recurring")?;
    Ok(ScheduledPost {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        video_id: row.try_get("video_id")?,
        video_path: row.try_get("video_path")?,
        scheduled_at: row.try_get("scheduled_at")?,
        timezone: row.try_get("timezone")?,
        recurring: recurring.map(serde_json::from_value).transpose()?,
        platforms: serde_json::from_value(row.try_get("platforms")?)?,
        status: parse_column(row, "status")?,
        outcome: parse_optional_column(row, "outcome")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<SocialAccount, StoreError> {
    Ok(SocialAccount {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        platform: parse_column(row, "platform")?,
        handle: row.try_get("handle")?,
        access_token: row.try_get("access_token")?,
    })
}

async fn write_batch(conn: &mut PgConnection, batch: &Batch) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO batches (
            id, user_id, name, total_videos, completed, failed, in_progress, progress,
            status, outcome, config, error, created_at, started_at, completed_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            completed = EXCLUDED.completed,
            failed = EXCLUDED.failed,
            in_progress = EXCLUDED.in_progress,
            progress = EXCLUDED.progress,
            status = EXCLUDED.status,
            outcome = EXCLUDED.outcome,
            config = EXCLUDED.config,
            error = EXCLUDED.error,
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(batch.id)
    .bind(&batch.user_id)
    .bind(&batch.name)
    .bind(to_i32(batch.total_videos))
    .bind(to_i32(batch.completed))
    .bind(to_i32(batch.failed))
    .bind(to_i32(batch.in_progress))
    .bind(batch.progress)
    .bind(batch.status.as_str())
    .bind(batch.outcome.map(|o| o.as_str()))
    .bind(serde_json::to_value(&batch.config)?)
    .bind(&batch.error)
    .bind(batch.created_at)
    .bind(batch.started_at)
    .bind(batch.completed_at)
    .bind(batch.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn write_video(conn: &mut PgConnection, video: &BatchVideo) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO batch_videos (
            id, batch_id, position, title, description, prompt, config, status, progress,
            timeline_id, error, attempts, artifacts, started_at, completed_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            progress = EXCLUDED.progress,
            timeline_id = EXCLUDED.timeline_id,
            error = EXCLUDED.error,
            attempts = EXCLUDED.attempts,
            artifacts = EXCLUDED.artifacts,
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(video.id)
    .bind(video.batch_id)
    .bind(to_i32(video.position))
    .bind(&video.title)
    .bind(&video.description)
    .bind(&video.prompt)
    .bind(serde_json::to_value(&video.config)?)
    .bind(video.status.as_str())
    .bind(i16::from(video.progress))
    .bind(&video.timeline_id)
    .bind(&video.error)
    .bind(to_i32(video.attempts))
    .bind(serde_json::to_value(&video.artifacts)?)
    .bind(video.started_at)
    .bind(video.completed_at)
    .bind(video.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn write_post(conn: &mut PgConnection, post: &ScheduledPost) -> Result<(), StoreError> {
    let recurring = post.recurring.as_ref().map(serde_json::to_value).transpose()?;
    sqlx::query(
        r#"
        INSERT INTO scheduled_posts (
            id, user_id, video_id, video_path, scheduled_at, timezone, recurring,
            platforms, status, outcome, error, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (id) DO UPDATE SET
            video_id = EXCLUDED.video_id,
            video_path = EXCLUDED.video_path,
            scheduled_at = EXCLUDED.scheduled_at,
            timezone = EXCLUDED.timezone,
            recurring = EXCLUDED.recurring,
            platforms = EXCLUDED.platforms,
            status = EXCLUDED.status,
            outcome = EXCLUDED.outcome,
            error = EXCLUDED.error,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(post.id)
    .bind(&post.user_id)
    .bind(&post.video_id)
    .bind(&post.video_path)
    .bind(post.scheduled_at)
    .bind(&post.timezone)
    .bind(recurring)
    .bind(serde_json::to_value(&post.platforms)?)
    .bind(post.status.as_str())
    .bind(post.outcome.map(|o| o.as_str()))
    .bind(&post.error)
    .bind(post.created_at)
    .bind(post.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl BatchRepository for PgStore {
    async fn insert_batch(&self, batch: &Batch, videos: &[BatchVideo]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_batch(&mut tx, batch).await?;
        for video in videos {
            write_video(&mut tx, video).await?;
        }
        tx.commit().await?;
        debug!(batch_id = %batch.id, videos = videos.len(), "Inserted batch");
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM batches WHERE id = $1", BATCH_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn list_batches(&self, user_id: &str) -> Result<Vec<Batch>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM batches WHERE user_id = $1 ORDER BY created_at DESC",
            BATCH_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn get_video(&self, id: Uuid) -> Result<Option<BatchVideo>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM batch_videos WHERE id = $1",
            VIDEO_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(video_from_row).transpose()
    }

    async fn list_videos(&self, batch_id: Uuid) -> Result<Vec<BatchVideo>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM batch_videos WHERE batch_id = $1 ORDER BY position",
            VIDEO_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(video_from_row).collect()
    }

    async fn update_batch(&self, id: Uuid, mutate: BatchMutation<'_>) -> Result<Batch, BatchError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM batches WHERE id = $1 FOR UPDATE",
            BATCH_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .ok_or(BatchError::NotFound(id))?;

        let mut batch = batch_from_row(&row)?;
        mutate(&mut batch)?;
        write_batch(&mut tx, &batch).await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(batch)
    }

    async fn adjust_counters(
        &self,
        id: Uuid,
        delta: CounterDelta,
        now: DateTime<Utc>,
    ) -> Result<Batch, BatchError> {
        let row = sqlx::query(&format!("{} RETURNING {}", ADJUST_COUNTERS_SQL, BATCH_COLUMNS))
            .bind(id)
            .bind(delta.completed)
            .bind(delta.failed)
            .bind(delta.in_progress)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?
            .ok_or(BatchError::NotFound(id))?;
        Ok(batch_from_row(&row)?)
    }

    async fn update_video(
        &self,
        id: Uuid,
        mutate: VideoMutation<'_>,
    ) -> Result<BatchVideo, BatchError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM batch_videos WHERE id = $1 FOR UPDATE",
            VIDEO_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .ok_or(BatchError::VideoNotFound(id))?;

        let mut video = video_from_row(&row)?;
        mutate(&mut video)?;
        write_video(&mut tx, &video).await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(video)
    }

    async fn update_videos(
        &self,
        batch_id: Uuid,
        sweep: VideoSweep<'_>,
    ) -> Result<Vec<BatchVideo>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM batch_videos WHERE batch_id = $1 ORDER BY position FOR UPDATE",
            VIDEO_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut changed = Vec::new();
        for row in &rows {
            let mut video = video_from_row(row)?;
            if sweep(&mut video) {
                write_video(&mut tx, &video).await?;
                changed.push(video);
            }
        }
        tx.commit().await?;
        Ok(changed)
    }
}

#[async_trait]
impl PostRepository for PgStore {
    async fn save_post(&self, post: &ScheduledPost) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_post(&mut conn, post).await
    }

    async fn get_post(&self, id: Uuid) -> Result<Option<ScheduledPost>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_posts WHERE id = $1",
            POST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn list_posts(&self, user_id: &str) -> Result<Vec<ScheduledPost>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scheduled_posts WHERE user_id = $1 ORDER BY scheduled_at",
            POST_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(post_from_row).collect()
    }

    async fn update_post(
        &self,
        id: Uuid,
        mutate: PostMutation<'_>,
    ) -> Result<ScheduledPost, PublishError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_posts WHERE id = $1 FOR UPDATE",
            POST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .ok_or(PublishError::PostNotFound(id))?;

        let mut post = post_from_row(&row)?;
        mutate(&mut post)?;
        write_post(&mut tx, &post).await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(post)
    }
}

#[async_trait]
impl AccountRepository for PgStore {
    async fn save_account(&self, account: &SocialAccount) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO social_accounts (id, user_id, platform, handle, access_token)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                platform = EXCLUDED.platform,
                handle = EXCLUDED.handle,
                access_token = EXCLUDED.access_token
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(account.platform.as_str())
        .bind(&account.handle)
        .bind(&account.access_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<SocialAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, platform, handle, access_token FROM social_accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }
}
