//! Database schema constants.
//!
//! Every statement is idempotent so the migration runner can replay them.

pub const CREATE_SOCIAL_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS social_accounts (
    id VARCHAR(255) PRIMARY KEY,
    user_id VARCHAR(255) NOT NULL,
    platform VARCHAR(32) NOT NULL,
    handle VARCHAR(255) NOT NULL,
    access_token TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id UUID PRIMARY KEY,
    user_id VARCHAR(255) NOT NULL,
    name VARCHAR(255),
    total_videos INTEGER NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    in_progress INTEGER NOT NULL DEFAULT 0,
    progress DOUBLE PRECISION NOT NULL DEFAULT 0,
    status VARCHAR(32) NOT NULL,
    outcome VARCHAR(32),
    config JSONB NOT NULL,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL,
    CHECK (completed + failed + in_progress <= total_videos)
)
"#;

/// Stage artifacts are kept as JSONB next to the video row.
pub const CREATE_BATCH_VIDEOS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS batch_videos (
    id UUID PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES batches(id),
    position INTEGER NOT NULL,
    title VARCHAR(512) NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    prompt TEXT,
    config JSONB NOT NULL,
    status VARCHAR(32) NOT NULL,
    progress SMALLINT NOT NULL DEFAULT 0,
    timeline_id VARCHAR(255),
    error TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    artifacts JSONB NOT NULL DEFAULT '{}'::jsonb,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE(batch_id, position)
)
"#;

/// Legs are stored as a JSONB array on the post row.
pub const CREATE_SCHEDULED_POSTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scheduled_posts (
    id UUID PRIMARY KEY,
    user_id VARCHAR(255) NOT NULL,
    video_id VARCHAR(255) NOT NULL,
    video_path TEXT NOT NULL,
    scheduled_at TIMESTAMPTZ NOT NULL,
    timezone VARCHAR(64) NOT NULL,
    recurring JSONB,
    platforms JSONB NOT NULL,
    status VARCHAR(32) NOT NULL,
    outcome VARCHAR(32),
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

pub const CREATE_BATCHES_USER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_batches_user_id ON batches(user_id, created_at DESC)";

pub const CREATE_BATCH_VIDEOS_BATCH_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_batch_videos_batch_id ON batch_videos(batch_id)";

pub const CREATE_POSTS_USER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_scheduled_posts_user ON scheduled_posts(user_id, scheduled_at)";

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_SOCIAL_ACCOUNTS_TABLE,
        CREATE_BATCHES_TABLE,
        CREATE_BATCH_VIDEOS_TABLE,
        CREATE_SCHEDULED_POSTS_TABLE,
        CREATE_BATCHES_USER_INDEX,
        CREATE_BATCH_VIDEOS_BATCH_INDEX,
        CREATE_POSTS_USER_INDEX,
    ]
}

pub mod tables {
    pub const SOCIAL_ACCOUNTS: &str = "social_accounts";
    pub const BATCHES: &str = "batches";
    pub const BATCH_VIDEOS: &str = "batch_videos";
    pub const SCHEDULED_POSTS: &str = "scheduled_posts";

    /// Drop order (dependents first).
    pub const ALL: [&str; 4] = [BATCH_VIDEOS, BATCHES, SCHEDULED_POSTS, SOCIAL_ACCOUNTS];
}
