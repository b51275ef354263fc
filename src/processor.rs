//! In-process render job processor.
//!
//! Stands in for the remote render backend: persists a queued record, answers like the
//! real endpoint would, then completes the job after a delay.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    db::{
        models::{RenderJobRequest, RenderRecord, RenderStatus, SubmitResponse},
        LocalRenderStore,
    },
    identity::{short_label, DEFAULT_LABEL_CHARS},
    renders::JobSubmitter,
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// How the processor answers a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    /// Finish inline and return the artifact.
    Immediate,
    /// Answer 202 and finish after the delay.
    Deferred(Duration),
}

pub struct LocalRenderProcessor {
    store: LocalRenderStore,
    owner: String,
    mode: ProcessorMode,
    failing_keys: HashSet<String>,
    offline: Arc<AtomicBool>,
}

impl LocalRenderProcessor {
    pub fn new(store: LocalRenderStore, owner: impl Into<String>, mode: ProcessorMode) -> Self {
        Self {
            store,
            owner: owner.into(),
            mode,
            failing_keys: HashSet::new(),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Jobs for these keys are persisted but end up `failed`.
    pub fn with_failing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// While offline, submissions fail before anything is persisted.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobSubmitter for LocalRenderProcessor {
    async fn submit(&self, request: RenderJobRequest) -> Result<SubmitResponse> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("render backend unreachable");
        }
        if request.key.trim().is_empty() {
            bail!("render request is missing a screenshot key");
        }

        let now = Utc::now().timestamp_millis();
        let record = RenderRecord {
            id: Uuid::new_v4().to_string(),
            key: Some(request.key.clone()),
            status: RenderStatus::Queued,
            url: request.url.clone(),
            url_fingerprint: request.url_fingerprint.clone(),
            name_hint: request.name_hint.clone(),
            html: None,
            archived: false,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_render(&self.owner, &record).await?;
        log_info!("render job {} queued for {}", record.id, request.key);

        let failing = self.failing_keys.contains(&request.key);
        let html = render_artifact(&request);

        match self.mode {
            ProcessorMode::Immediate => {
                finish_job(&self.store, &record.id, failing, html.clone()).await?;
                if failing {
                    bail!("render job for {} failed", request.key);
                }
                Ok(SubmitResponse::Completed { html })
            }
            ProcessorMode::Deferred(delay) => {
                let store = self.store.clone();
                let render_id = record.id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = finish_job(&store, &render_id, failing, html).await {
                        log_error!("failed to finish render job {render_id}: {err:#}");
                    }
                });
                Ok(SubmitResponse::Accepted)
            }
        }
    }
}

async fn finish_job(
    store: &LocalRenderStore,
    render_id: &str,
    failing: bool,
    html: String,
) -> Result<()> {
    let (status, html) = if failing {
        (RenderStatus::Failed, None)
    } else {
        (RenderStatus::Ready, Some(html))
    };
    let now = Utc::now().timestamp_millis();
    if !store.complete_render(render_id, status, html, now).await? {
        log_info!("render {render_id} was discarded before it finished");
    }
    Ok(())
}

fn render_artifact(request: &RenderJobRequest) -> String {
    let title = request.name_hint.clone().unwrap_or_else(|| {
        format!(
            "Render {}",
            short_label(&request.key, None, DEFAULT_LABEL_CHARS)
        )
    });
    let source = request.url.as_deref().unwrap_or_default();

    format!(
        "<!doctype html><html><head><title>{}</title></head><body><main data-source=\"{}\"><img src=\"{}\" alt=\"\"></main></body></html>",
        escape_html(&title),
        escape_html(source),
        escape_html(&request.key)
    )
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
