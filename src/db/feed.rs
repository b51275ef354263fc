use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    db::{
        connection::Database,
        models::{RenderRecord, RenderStatus},
    },
    renders::RenderStore,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

struct OwnerFeed {
    sender: Arc<watch::Sender<Vec<RenderRecord>>>,
    limit: usize,
}

/// SQLite-backed render store with an in-process realtime feed.
///
/// Every mutation republishes the affected owner's full snapshot to subscribers.
#[derive(Clone)]
pub struct LocalRenderStore {
    db: Database,
    feeds: Arc<Mutex<HashMap<String, OwnerFeed>>>,
}

impl LocalRenderStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            feeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn insert_render(&self, owner: &str, render: &RenderRecord) -> Result<()> {
        self.db.insert_render(owner, render).await?;
        self.publish(owner).await;
        Ok(())
    }

    pub async fn complete_render(
        &self,
        render_id: &str,
        status: RenderStatus,
        html: Option<String>,
        updated_at: i64,
    ) -> Result<bool> {
        let owner = self
            .db
            .update_render_result(render_id, status, html, updated_at)
            .await?;
        self.publish_for(owner.as_deref()).await;
        Ok(owner.is_some())
    }

    pub async fn archive_render(&self, render_id: &str, updated_at: i64) -> Result<bool> {
        let owner = self.db.archive_render(render_id, updated_at).await?;
        self.publish_for(owner.as_deref()).await;
        Ok(owner.is_some())
    }

    async fn publish_for(&self, owner: Option<&str>) {
        if let Some(owner) = owner {
            self.publish(owner).await;
        }
    }

    /// Push the owner's current snapshot to subscribers; fetch failures are logged.
    async fn publish(&self, owner: &str) {
        let feed = {
            let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
            feeds.retain(|_, feed| feed.sender.receiver_count() > 0);
            feeds
                .get(owner)
                .map(|feed| (feed.sender.clone(), feed.limit))
        };
        let Some((sender, limit)) = feed else {
            return;
        };

        match self.db.list_renders(owner, limit).await {
            Ok(snapshot) => {
                log_debug!("render feed for {owner}: {} record(s)", snapshot.len());
                sender.send_replace(snapshot);
            }
            Err(err) => log_warn!("render feed refresh for {owner} failed: {err:#}"),
        }
    }
}

#[async_trait]
impl RenderStore for LocalRenderStore {
    async fn fetch_snapshot(&self, owner: &str, limit: usize) -> Result<Vec<RenderRecord>> {
        self.db.list_renders(owner, limit).await
    }

    async fn discard(&self, record_id: &str) -> Result<()> {
        let owner = self.db.delete_render(record_id).await?;
        self.publish_for(owner.as_deref()).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        owner: &str,
        limit: usize,
    ) -> Result<watch::Receiver<Vec<RenderRecord>>> {
        let snapshot = self.db.list_renders(owner, limit).await?;

        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let feed = feeds.entry(owner.to_string()).or_insert_with(|| OwnerFeed {
            sender: Arc::new(watch::channel(Vec::new()).0),
            limit,
        });
        feed.limit = feed.limit.max(limit);
        feed.sender.send_replace(snapshot);
        Ok(feed.sender.subscribe())
    }
}
