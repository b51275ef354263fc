use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, Instant},
};

use super::CooldownState;

/// Rate limit for a single user-initiated action (e.g. re-capturing a screenshot).
///
/// While active, a ticker republishes the remaining seconds every `tick_interval` and
/// retires itself once the deadline passes.
#[derive(Clone)]
pub struct CooldownGate {
    state: Arc<Mutex<CooldownState>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
    remaining_tx: watch::Sender<u64>,
}

impl CooldownGate {
    pub fn new(tick_interval: Duration) -> Self {
        let (remaining_tx, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(CooldownState::new())),
            ticker: Arc::new(Mutex::new(None)),
            tick_interval,
            remaining_tx,
        }
    }

    pub async fn remaining_seconds(&self) -> u64 {
        self.state.lock().await.remaining_seconds(Instant::now())
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.is_active(Instant::now())
    }

    /// Remaining seconds as last published by the ticker.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.remaining_tx.subscribe()
    }

    pub async fn start(&self, duration: Duration) {
        let remaining = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.start(now, duration);
            state.remaining_seconds(now)
        };
        self.remaining_tx.send_replace(remaining);
        self.spawn_ticker().await;
    }

    pub async fn clear(&self) {
        self.state.lock().await.clear();
        self.cancel_ticker().await;
        self.remaining_tx.send_replace(0);
    }

    pub async fn ticker_running(&self) -> bool {
        self.ticker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let remaining_tx = self.remaining_tx.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            loop {
                interval.tick().await;

                let remaining = state.lock().await.remaining_seconds(Instant::now());
                remaining_tx.send_if_modified(|current| {
                    if *current == remaining {
                        false
                    } else {
                        *current = remaining;
                        true
                    }
                });

                if remaining == 0 {
                    break;
                }
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }
}
