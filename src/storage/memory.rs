//! In-process repository used by tests and single-node runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::batch::model::{Batch, BatchVideo};
use crate::error::{BatchError, PublishError, StoreError};
use crate::publisher::model::{ScheduledPost, SocialAccount};

use super::repository::{
    AccountRepository, BatchMutation, BatchRepository, PostMutation, PostRepository,
    VideoMutation, VideoSweep,
};

#[derive(Default)]
struct MemoryState {
    batches: HashMap<Uuid, Batch>,
    videos: HashMap<Uuid, BatchVideo>,
    posts: HashMap<Uuid, ScheduledPost>,
    accounts: HashMap<String, SocialAccount>,
}

/// All repositories behind one mutex.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchRepository for MemoryStore {
    async fn insert_batch(&self, batch: &Batch, videos: &[BatchVideo]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.batches.insert(batch.id, batch.clone());
        for video in videos {
            state.videos.insert(video.id, video.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError> {
        Ok(self.state.lock().await.batches.get(&id).cloned())
    }

    async fn list_batches(&self, user_id: &str) -> Result<Vec<Batch>, StoreError> {
        let state = self.state.lock().await;
        let mut batches: Vec<Batch> = state
            .batches
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    async fn get_video(&self, id: Uuid) -> Result<Option<BatchVideo>, StoreError> {
        Ok(self.state.lock().await.videos.get(&id).cloned())
    }

    async fn list_videos(&self, batch_id: Uuid) -> Result<Vec<BatchVideo>, StoreError> {
        let state = self.state.lock().await;
        let mut videos: Vec<BatchVideo> = state
            .videos
            .values()
            .filter(|v| v.batch_id == batch_id)
            .cloned()
            .collect();
        videos.sort_by_key(|v| v.position);
        Ok(videos)
    }

    async fn update_batch(&self, id: Uuid, mutate: BatchMutation<'_>) -> Result<Batch, BatchError> {
        let mut state = self.state.lock().await;
        let current = state.batches.get_mut(&id).ok_or(BatchError::NotFound(id))?;
        let mut next = current.clone();
        mutate(&mut next)?;
        *current = next.clone();
        Ok(next)
    }

    async fn update_video(
        &self,
        id: Uuid,
        mutate: VideoMutation<'_>,
    ) -> Result<BatchVideo, BatchError> {
        let mut state = self.state.lock().await;
        let current = state
            .videos
            .get_mut(&id)
            .ok_or(BatchError::VideoNotFound(id))?;
        let mut next = current.clone();
        mutate(&mut next)?;
        *current = next.clone();
        Ok(next)
    }

    async fn update_videos(
        &self,
        batch_id: Uuid,
        sweep: VideoSweep<'_>,
    ) -> Result<Vec<BatchVideo>, StoreError> {
        let mut state = self.state.lock().await;
        let mut changed: Vec<BatchVideo> = state
            .videos
            .values_mut()
            .filter(|v| v.batch_id == batch_id)
            .filter_map(|v| sweep(v).then(|| v.clone()))
            .collect();
        changed.sort_by_key(|v| v.position);
        Ok(changed)
    }
}

#[async_trait]
impl PostRepository for MemoryStore {
    async fn save_post(&self, post: &ScheduledPost) -> Result<(), StoreError> {
        self.state.lock().await.posts.insert(post.id, post.clone());
        Ok(())
    }

    async fn get_post(&self, id: Uuid) -> Result<Option<ScheduledPost>, StoreError> {
        Ok(self.state.lock().await.posts.get(&id).cloned())
    }

    async fn list_posts(&self, user_id: &str) -> Result<Vec<ScheduledPost>, StoreError> {
        let state = self.state.lock().await;
        let mut posts: Vec<ScheduledPost> = state
            .posts
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        posts.sort_by_key(|p| p.scheduled_at);
        Ok(posts)
    }

    async fn update_post(
        &self,
        id: Uuid,
        mutate: PostMutation<'_>,
    ) -> Result<ScheduledPost, PublishError> {
        let mut state = self.state.lock().await;
        let current = state
            .posts
            .get_mut(&id)
            .ok_or(PublishError::PostNotFound(id))?;
        let mut next = current.clone();
        mutate(&mut next)?;
        *current = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn save_account(&self, account: &SocialAccount) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<SocialAccount>, StoreError> {
        Ok(self.state.lock().await.accounts.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::model::{BatchStatus, CounterDelta, GenerationConfig, VideoDefinition};
    use crate::publisher::model::{Platform, PlatformPost};
    use chrono::Utc;

    fn seeded_batch(n: u32) -> (Batch, Vec<BatchVideo>) {
        let now = Utc::now();
        let batch = Batch::new("user-1", None, n, GenerationConfig::default(), now);
        let videos = (0..n)
            .map(|i| {
                BatchVideo::from_definition(&batch, i, &VideoDefinition::new(format!("v{}", i)), now)
            })
            .collect();
        (batch, videos)
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_record_untouched() {
        let store = MemoryStore::new();
        let (batch, videos) = seeded_batch(1);
        store.insert_batch(&batch, &videos).await.unwrap();

        let result = store
            .update_batch(batch.id, &|b: &mut Batch| {
                b.name = Some("renamed".into());
                Err(BatchError::Validation("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get_batch(batch.id).await.unwrap().unwrap(), batch);
    }

    #[tokio::test]
    async fn test_missing_records_are_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.update_batch(id, &|_b: &mut Batch| Ok(())).await,
            Err(BatchError::NotFound(_))
        ));
        assert!(matches!(
            store.update_post(id, &|_p: &mut ScheduledPost| Ok(())).await,
            Err(PublishError::PostNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_counter_updates_are_atomic() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let (mut batch, videos) = seeded_batch(20);
        batch.start(Utc::now()).unwrap();
        store.insert_batch(&batch, &videos).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let id = batch.id;
            handles.push(tokio::spawn(async move {
                store.adjust_counters(id, CounterDelta::started(), Utc::now()).await.unwrap();
                store.adjust_counters(id, CounterDelta::succeeded(), Utc::now()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let batch = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.completed, 20);
        assert_eq!(batch.in_progress, 0);
        assert_eq!(batch.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_update_videos_returns_changed_in_order() {
        let store = MemoryStore::new();
        let (batch, videos) = seeded_batch(3);
        store.insert_batch(&batch, &videos).await.unwrap();

        let changed = store
            .update_videos(batch.id, &|v: &mut BatchVideo| v.position != 1 && v.cancel(Utc::now()))
            .await
            .unwrap();
        let positions: Vec<u32> = changed.iter().map(|v| v.position).collect();
        assert_eq!(positions, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_posts_listed_by_schedule() {
        let store = MemoryStore::new();
        let later = ScheduledPost::new("u", "v2", "/v2.mp4", Utc::now() + chrono::Duration::hours(2))
            .with_leg(PlatformPost::new("a", Platform::Youtube, "later"));
        let sooner = ScheduledPost::new("u", "v1", "/v1.mp4", Utc::now())
            .with_leg(PlatformPost::new("a", Platform::Youtube, "sooner"));
        store.save_post(&later).await.unwrap();
        store.save_post(&sooner).await.unwrap();

        let posts = store.list_posts("u").await.unwrap();
        assert_eq!(posts[0].id, sooner.id);
        assert!(store.list_posts("other").await.unwrap().is_empty());
    }
}
