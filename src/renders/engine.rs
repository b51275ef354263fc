use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cooldown::CooldownGate,
    db::models::{RenderJobRequest, RenderRecord, RenderScope, SubmitResponse},
    settings::EngineConfig,
};

use super::{
    backend::{JobSubmitter, RenderStore},
    equality::sequence_equals,
    state::{ReconcileOutcome, ReconciliationState, SubmitRejection},
    supervisor::{PollExit, PollTick, PollTiming, PollingSupervisor},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum SubmitOutcome {
    /// Refused without contacting the backend.
    Rejected { reason: SubmitRejection },
    /// The backend took the job, either finished or accepted for later.
    Submitted {
        placeholder: RenderRecord,
        #[serde(skip)]
        response: SubmitResponse,
    },
}

struct FeedTask {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

struct EngineShared {
    state: Mutex<ReconciliationState>,
    store: Arc<dyn RenderStore>,
    submitter: Arc<dyn JobSubmitter>,
    config: EngineConfig,
    view_tx: watch::Sender<Vec<RenderRecord>>,
    supervisor: Mutex<PollingSupervisor>,
    feed: Mutex<Option<FeedTask>>,
    cooldown: CooldownGate,
}

/// Client-side reconciliation engine for render jobs in one scope.
///
/// Merges the realtime feed, optimistic placeholders and a bounded poll fallback into a
/// single ordered view. Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct RenderEngine {
    inner: Arc<EngineShared>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl RenderEngine {
    pub fn new(
        scope: RenderScope,
        config: EngineConfig,
        store: Arc<dyn RenderStore>,
        submitter: Arc<dyn JobSubmitter>,
    ) -> Self {
        let (view_tx, _) = watch::channel(Vec::new());
        let cooldown = CooldownGate::new(config.cooldown_tick());
        Self {
            inner: Arc::new(EngineShared {
                state: Mutex::new(ReconciliationState::new(scope)),
                store,
                submitter,
                config,
                view_tx,
                supervisor: Mutex::new(PollingSupervisor::new()),
                feed: Mutex::new(None),
                cooldown,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Rate limit for user-triggered re-captures, ticking at `cooldown_tick_ms`.
    pub fn cooldown(&self) -> &CooldownGate {
        &self.inner.cooldown
    }

    pub async fn scope(&self) -> RenderScope {
        self.inner.state.lock().await.scope().clone()
    }

    /// Current merged view, newest placeholders first.
    pub fn view(&self) -> Vec<RenderRecord> {
        self.inner.view_tx.borrow().clone()
    }

    /// Notified only when the view actually changes.
    pub fn subscribe_view(&self) -> watch::Receiver<Vec<RenderRecord>> {
        self.inner.view_tx.subscribe()
    }

    pub async fn is_key_locked(&self, key: &str) -> bool {
        self.inner.state.lock().await.is_key_locked(key, now_ms())
    }

    pub async fn is_record_locked(&self, record_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .is_record_locked(record_id, now_ms())
    }

    pub async fn is_pending(&self, key: &str) -> bool {
        self.inner.state.lock().await.is_pending(key)
    }

    pub async fn supervisor_active(&self) -> bool {
        self.inner.supervisor.lock().await.is_active()
    }

    /// Request a render for screenshot `key`.
    ///
    /// Refusals come back as `SubmitOutcome::Rejected`; `Err` means the backend call
    /// failed and the placeholder now shows as failed (its lock is kept).
    pub async fn submit_job(&self, key: &str, name_hint: Option<String>) -> Result<SubmitOutcome> {
        let (placeholder, request) = {
            let mut state = self.inner.state.lock().await;
            let placeholder = match state.begin_submission(
                key,
                name_hint.clone(),
                now_ms(),
                self.inner.config.lock_duration_ms,
            ) {
                Ok(record) => record,
                Err(reason) => {
                    log_debug!("render submission for {key} ignored: {reason:?}");
                    return Ok(SubmitOutcome::Rejected { reason });
                }
            };
            self.publish(state.view());

            let scope = state.scope();
            let request = RenderJobRequest {
                key: key.to_string(),
                url: Some(scope.url.clone()),
                url_fingerprint: Some(scope.url_fingerprint.clone()),
                name_hint,
            };
            (placeholder, request)
        };

        self.inner.supervisor.lock().await.rearm();
        self.supervise(true).await;

        log_info!("submitting render job for {key} ({})", placeholder.id);
        match self.inner.submitter.submit(request).await {
            Ok(response) => {
                if let SubmitResponse::Accepted = response {
                    log_debug!("render job for {key} accepted for later completion");
                }
                if let Err(err) = self.refresh().await {
                    log_warn!("post-submit refresh failed: {err:#}");
                }
                Ok(SubmitOutcome::Submitted {
                    placeholder,
                    response,
                })
            }
            Err(err) => {
                log_error!("render job for {key} failed: {err:#}");
                let has_queued = {
                    let mut state = self.inner.state.lock().await;
                    state.mark_submission_failed(key, &placeholder.id);
                    self.publish(state.view());
                    state.has_queued()
                };
                self.supervise(has_queued).await;
                Err(err.context(format!("render job for {key} failed")))
            }
        }
    }

    /// Resubmit a key whose placeholder failed, once its lock window has elapsed.
    pub async fn retry_job(&self, key: &str, name_hint: Option<String>) -> Result<SubmitOutcome> {
        {
            let mut state = self.inner.state.lock().await;
            if let Err(reason) = state.prepare_retry(key, now_ms()) {
                log_debug!("render retry for {key} ignored: {reason:?}");
                return Ok(SubmitOutcome::Rejected { reason });
            }
            self.publish(state.view());
        }
        self.submit_job(key, name_hint).await
    }

    /// Remove a record from the view and delete it from the store.
    pub async fn discard(&self, record_id: &str) -> Result<()> {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let removed = state.discard(record_id);
            self.publish(state.view());
            removed
        };

        match removed {
            Some(record) if record.is_optimistic() => Ok(()),
            _ => self
                .inner
                .store
                .discard(record_id)
                .await
                .with_context(|| format!("failed to discard render {record_id}")),
        }
    }

    /// Apply one persisted snapshot (feed delivery or poll result).
    pub async fn reconcile(&self, fresh: Vec<RenderRecord>) -> ReconcileOutcome {
        let outcome = self.apply_snapshot(None, fresh).await;
        self.supervise(outcome.has_queued).await;
        outcome
    }

    /// Pull a one-shot snapshot and reconcile it. A failed fetch leaves the view untouched.
    pub async fn refresh(&self) -> Result<ReconcileOutcome> {
        let outcome = self.pull_snapshot().await?;
        self.supervise(outcome.has_queued).await;
        Ok(outcome)
    }

    /// Subscribe to the store's realtime feed for the current scope.
    pub async fn attach_feed(&self) -> Result<()> {
        let scope = self.scope().await;
        let mut receiver = self
            .inner
            .store
            .subscribe(&scope.owner, self.inner.config.feed_page_size)
            .await
            .context("failed to subscribe to render feed")?;

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let initial = receiver.borrow_and_update().clone();
            if !feed_deliver(&weak, &scope, initial).await {
                return;
            }

            loop {
                tokio::select! {
                    changed = receiver.changed() => {
                        if changed.is_err() {
                            log_info!("render feed closed");
                            break;
                        }
                        let snapshot = receiver.borrow_and_update().clone();
                        if !feed_deliver(&weak, &scope, snapshot).await {
                            break;
                        }
                    }
                    _ = token_clone.cancelled() => break,
                }
            }
        });

        let previous = self.inner.feed.lock().await.replace(FeedTask {
            handle,
            cancel_token,
        });
        if let Some(previous) = previous {
            previous.cancel_token.cancel();
            previous.handle.abort();
        }
        Ok(())
    }

    /// The active URL changed: drop all state and, if attached, resubscribe.
    pub async fn set_scope(&self, scope: RenderScope) -> Result<()> {
        let had_feed = self.detach_feed().await;
        self.inner.supervisor.lock().await.stop();

        {
            let mut state = self.inner.state.lock().await;
            *state = ReconciliationState::new(scope);
            self.publish(state.view());
        }

        if had_feed {
            self.attach_feed().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.detach_feed().await;
        self.inner.supervisor.lock().await.stop();
        self.inner.cooldown.clear().await;
    }

    async fn detach_feed(&self) -> bool {
        match self.inner.feed.lock().await.take() {
            Some(feed) => {
                feed.cancel_token.cancel();
                feed.handle.abort();
                true
            }
            None => false,
        }
    }

    async fn pull_snapshot(&self) -> Result<ReconcileOutcome> {
        let scope = self.scope().await;
        let snapshot = self
            .inner
            .store
            .fetch_snapshot(&scope.owner, self.inner.config.feed_page_size)
            .await
            .context("failed to fetch render snapshot")?;
        Ok(self.apply_snapshot(Some(&scope), snapshot).await)
    }

    /// Reconcile unless the scope moved on while the snapshot was in flight.
    async fn apply_snapshot(
        &self,
        expected_scope: Option<&RenderScope>,
        fresh: Vec<RenderRecord>,
    ) -> ReconcileOutcome {
        let mut state = self.inner.state.lock().await;
        if expected_scope.is_some_and(|scope| scope != state.scope()) {
            log_debug!("dropping snapshot for a stale scope");
            return ReconcileOutcome {
                has_queued: state.has_queued(),
                ..ReconcileOutcome::default()
            };
        }

        let outcome = state.reconcile(fresh, now_ms());
        if outcome.retired > 0 {
            log_debug!("retired {} render placeholder(s)", outcome.retired);
        }
        if outcome.changed {
            self.publish(state.view());
        }
        outcome
    }

    fn publish(&self, view: &[RenderRecord]) -> bool {
        self.inner.view_tx.send_if_modified(|current| {
            if sequence_equals(current, view) {
                false
            } else {
                *current = view.to_vec();
                true
            }
        })
    }

    async fn supervise(&self, has_queued: bool) {
        let mut supervisor = self.inner.supervisor.lock().await;
        if !has_queued {
            supervisor.stop();
            return;
        }

        let config = &self.inner.config;
        let timing = PollTiming {
            interval: config.poll_interval(),
            extend: config.poll_extend(),
            ceiling: config.poll_ceiling(),
        };

        let tick_weak = Arc::downgrade(&self.inner);
        let exit_weak = Arc::downgrade(&self.inner);
        supervisor.ensure_running(
            timing,
            move || poll_tick(tick_weak.clone()),
            move |exit| poll_exit(exit_weak, exit),
        );
    }
}

async fn poll_tick(weak: Weak<EngineShared>) -> PollTick {
    let Some(inner) = weak.upgrade() else {
        return PollTick::Idle;
    };
    let engine = RenderEngine { inner };
    match engine.pull_snapshot().await {
        Ok(outcome) if outcome.has_queued => PollTick::Queued,
        Ok(_) => PollTick::Idle,
        Err(err) => {
            log_warn!("render poll skipped: {err:#}");
            PollTick::Skipped
        }
    }
}

async fn poll_exit(weak: Weak<EngineShared>, exit: PollExit) {
    if exit != PollExit::DeadlineExceeded {
        return;
    }
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let engine = RenderEngine { inner };
    let mut state = engine.inner.state.lock().await;
    let failed = state.fail_stale_placeholders();
    if failed > 0 {
        log_warn!("{failed} render placeholder(s) never confirmed; marked failed");
        engine.publish(state.view());
    }
}

/// Returns false once the engine is gone or moved to another scope.
async fn feed_deliver(
    weak: &Weak<EngineShared>,
    scope: &RenderScope,
    snapshot: Vec<RenderRecord>,
) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let engine = RenderEngine { inner };
    if engine.scope().await != *scope {
        return false;
    }
    engine.reconcile(snapshot).await;
    true
}
