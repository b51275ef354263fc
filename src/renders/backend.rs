use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::db::models::{RenderJobRequest, RenderRecord, SubmitResponse};

/// Job submission endpoint. `Err` covers both backend error responses and transport failures.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, request: RenderJobRequest) -> Result<SubmitResponse>;
}

/// Persisted render records, scoped by owner, non-archived, newest first.
#[async_trait]
pub trait RenderStore: Send + Sync {
    /// One-shot pull with the same filter and ordering as the realtime feed.
    async fn fetch_snapshot(&self, owner: &str, limit: usize) -> Result<Vec<RenderRecord>>;

    /// Hard delete by id.
    async fn discard(&self, record_id: &str) -> Result<()>;

    /// Realtime feed: the receiver sees a full snapshot after every underlying change.
    async fn subscribe(&self, owner: &str, limit: usize)
        -> Result<watch::Receiver<Vec<RenderRecord>>>;
}
