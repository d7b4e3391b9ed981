//! Repository traits over batches, posts and social accounts.
//!
//! Mutations take a closure and apply it to the current record atomically:
//! under the store mutex in memory, inside a `SELECT ... FOR UPDATE`
//! transaction in Postgres. A closure that returns an error leaves the
//! record unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::batch::model::{Batch, BatchVideo, CounterDelta};
use crate::error::{BatchError, PublishError, StoreError};
use crate::publisher::model::{ScheduledPost, SocialAccount};

pub type BatchMutation<'a> = &'a (dyn Fn(&mut Batch) -> Result<(), BatchError> + Send + Sync);
pub type VideoMutation<'a> = &'a (dyn Fn(&mut BatchVideo) -> Result<(), BatchError> + Send + Sync);
/// Returns whether the video changed.
pub type VideoSweep<'a> = &'a (dyn Fn(&mut BatchVideo) -> bool + Send + Sync);
pub type PostMutation<'a> =
    &'a (dyn Fn(&mut ScheduledPost) -> Result<(), PublishError> + Send + Sync);

#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// Persists a new batch together with its videos.
    async fn insert_batch(&self, batch: &Batch, videos: &[BatchVideo]) -> Result<(), StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError>;

    /// Batches of a user, newest first.
    async fn list_batches(&self, user_id: &str) -> Result<Vec<Batch>, StoreError>;

    async fn get_video(&self, id: Uuid) -> Result<Option<BatchVideo>, StoreError>;

    /// Videos of a batch in request order.
    async fn list_videos(&self, batch_id: Uuid) -> Result<Vec<BatchVideo>, StoreError>;

    async fn update_batch(&self, id: Uuid, mutate: BatchMutation<'_>) -> Result<Batch, BatchError>;

    async fn update_video(&self, id: Uuid, mutate: VideoMutation<'_>)
        -> Result<BatchVideo, BatchError>;

    /// Applies `sweep` to every video of a batch in one atomic step and
    /// returns the videos it changed.
    async fn update_videos(
        &self,
        batch_id: Uuid,
        sweep: VideoSweep<'_>,
    ) -> Result<Vec<BatchVideo>, StoreError>;

    /// Adjusts the batch counters and settles the batch when every video is done.
    async fn adjust_counters(
        &self,
        id: Uuid,
        delta: CounterDelta,
        now: DateTime<Utc>,
    ) -> Result<Batch, BatchError> {
        self.update_batch(id, &move |batch: &mut Batch| {
            batch.apply_counters(delta, now);
            Ok(())
        })
        .await
    }
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    /// Inserts or replaces a post.
    async fn save_post(&self, post: &ScheduledPost) -> Result<(), StoreError>;

    async fn get_post(&self, id: Uuid) -> Result<Option<ScheduledPost>, StoreError>;

    /// Posts of a user ordered by scheduled time.
    async fn list_posts(&self, user_id: &str) -> Result<Vec<ScheduledPost>, StoreError>;

    async fn update_post(
        &self,
        id: Uuid,
        mutate: PostMutation<'_>,
    ) -> Result<ScheduledPost, PublishError>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn save_account(&self, account: &SocialAccount) -> Result<(), StoreError>;

    async fn get_account(&self, id: &str) -> Result<Option<SocialAccount>, StoreError>;
}
