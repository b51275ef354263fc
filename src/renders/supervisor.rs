use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// What one poll tick found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTick {
    /// Snapshot still contains a queued render.
    Queued,
    /// Nothing queued anymore.
    Idle,
    /// Fetch failed; try again next interval.
    Skipped,
}

/// Why a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    Drained,
    DeadlineExceeded,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub interval: Duration,
    /// Rolling extension granted by every tick that still sees a queued render.
    pub extend: Duration,
    /// Absolute cap measured from the first start of the current window.
    pub ceiling: Duration,
}

/// Bounded-lifetime poller that re-pulls snapshots while renders are queued.
pub struct PollingSupervisor {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    window_started: Option<Instant>,
    exhausted: bool,
    last_exit: Arc<Mutex<Option<PollExit>>>,
}

impl PollingSupervisor {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            window_started: None,
            exhausted: false,
            last_exit: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_active(&self) -> bool {
        let cancelled = self
            .cancel_token
            .as_ref()
            .map_or(true, CancellationToken::is_cancelled);
        !cancelled && self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// True once the absolute ceiling stopped the current window.
    pub fn is_exhausted(&mut self) -> bool {
        self.absorb_last_exit();
        self.exhausted
    }

    /// Start polling unless already running or the window's ceiling was hit.
    ///
    /// `tick` performs one fetch + reconcile; `on_exit` runs once when the loop ends on its own.
    pub fn ensure_running<T, TFut, E, EFut>(&mut self, timing: PollTiming, tick: T, on_exit: E) -> bool
    where
        T: FnMut() -> TFut + Send + 'static,
        TFut: Future<Output = PollTick> + Send + 'static,
        E: FnOnce(PollExit) -> EFut + Send + 'static,
        EFut: Future<Output = ()> + Send + 'static,
    {
        if self.is_active() {
            return false;
        }

        self.absorb_last_exit();
        if self.exhausted {
            log_debug!("poll supervisor exhausted; not restarting");
            return false;
        }

        let now = Instant::now();
        let window_started = *self.window_started.get_or_insert(now);
        if now.duration_since(window_started) >= timing.ceiling {
            self.exhausted = true;
            return false;
        }

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        // Each run reports into its own slot so a stopped run cannot leak into the next.
        let last_exit = Arc::new(Mutex::new(None));
        self.last_exit = last_exit.clone();

        let handle = tokio::spawn(async move {
            let exit = poll_loop(tick, timing, window_started, token_clone.clone()).await;
            // A tick already in flight when `stop` ran still returns its own verdict.
            let exit = if token_clone.is_cancelled() {
                PollExit::Cancelled
            } else {
                exit
            };
            *last_exit.lock().unwrap_or_else(PoisonError::into_inner) = Some(exit);
            if exit != PollExit::Cancelled {
                on_exit(exit).await;
            }
        });

        log_info!(
            "poll supervisor started (every {}ms)",
            timing.interval.as_millis()
        );
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        true
    }

    /// Stop polling because nothing is queued; the next start opens a fresh window.
    pub fn stop(&mut self) {
        let was_active = self.is_active();
        self.cancel();
        self.window_started = None;
        self.exhausted = false;
        self.last_exit = Arc::new(Mutex::new(None));
        if was_active {
            log_info!("poll supervisor stopped");
        }
    }

    /// Forget an exhausted window so a new submission gets a full polling budget.
    pub fn rearm(&mut self) {
        self.absorb_last_exit();
        if self.exhausted {
            self.window_started = None;
            self.exhausted = false;
        }
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.handle.take();
    }

    fn absorb_last_exit(&mut self) {
        let exit = self
            .last_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match exit {
            Some(PollExit::DeadlineExceeded) => self.exhausted = true,
            Some(PollExit::Drained) => self.window_started = None,
            Some(PollExit::Cancelled) | None => {}
        }
    }
}

impl Default for PollingSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

async fn poll_loop<T, TFut>(
    mut tick: T,
    timing: PollTiming,
    window_started: Instant,
    cancel_token: CancellationToken,
) -> PollExit
where
    T: FnMut() -> TFut,
    TFut: Future<Output = PollTick>,
{
    let mut ticker = time::interval_at(Instant::now() + timing.interval, timing.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ceiling_at = window_started + timing.ceiling;
    let mut deadline = (Instant::now() + timing.extend).min(ceiling_at);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tick().await {
                    PollTick::Idle => {
                        log_debug!("poll supervisor drained");
                        return PollExit::Drained;
                    }
                    PollTick::Queued => {
                        deadline = (Instant::now() + timing.extend).min(ceiling_at);
                    }
                    PollTick::Skipped => {}
                }

                if Instant::now() >= deadline {
                    log_warn!("poll supervisor deadline exceeded; giving up on queued renders");
                    return PollExit::DeadlineExceeded;
                }
            }
            _ = cancel_token.cancelled() => {
                return PollExit::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{oneshot, Notify};

    fn timing() -> PollTiming {
        PollTiming {
            interval: Duration::from_secs(5),
            extend: Duration::from_secs(300),
            ceiling: Duration::from_secs(600),
        }
    }

    fn counting_tick(
        counter: Arc<AtomicUsize>,
        result: PollTick,
    ) -> impl FnMut() -> std::future::Ready<PollTick> + Send + 'static {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(result)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drains_when_nothing_is_queued() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (exit_tx, exit_rx) = oneshot::channel();
        let mut supervisor = PollingSupervisor::new();

        assert!(supervisor.ensure_running(
            timing(),
            counting_tick(ticks.clone(), PollTick::Idle),
            move |exit| async move {
                let _ = exit_tx.send(exit);
            },
        ));
        assert!(supervisor.is_active());

        assert_eq!(exit_rx.await.unwrap(), PollExit::Drained);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        tokio::task::yield_now().await;
        assert!(!supervisor.is_active());
        assert!(!supervisor.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_interval() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut supervisor = PollingSupervisor::new();
        supervisor.ensure_running(
            timing(),
            counting_tick(ticks.clone(), PollTick::Queued),
            |_| async {},
        );

        time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_stops_stuck_queue() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (exit_tx, exit_rx) = oneshot::channel();
        let mut supervisor = PollingSupervisor::new();
        supervisor.ensure_running(
            timing(),
            counting_tick(ticks.clone(), PollTick::Queued),
            move |exit| async move {
                let _ = exit_tx.send(exit);
            },
        );

        assert_eq!(exit_rx.await.unwrap(), PollExit::DeadlineExceeded);
        assert_eq!(ticks.load(Ordering::SeqCst), 120);
        tokio::task::yield_now().await;
        assert!(supervisor.is_exhausted());

        let restarted = supervisor.ensure_running(
            timing(),
            counting_tick(ticks.clone(), PollTick::Queued),
            |_| async {},
        );
        assert!(!restarted);

        supervisor.rearm();
        assert!(supervisor.ensure_running(
            timing(),
            counting_tick(ticks, PollTick::Queued),
            |_| async {},
        ));
        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_deadline_expires_without_queued_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (exit_tx, exit_rx) = oneshot::channel();
        let mut supervisor = PollingSupervisor::new();
        supervisor.ensure_running(
            timing(),
            counting_tick(ticks.clone(), PollTick::Skipped),
            move |exit| async move {
                let _ = exit_tx.send(exit);
            },
        );

        assert_eq!(exit_rx.await.unwrap(), PollExit::DeadlineExceeded);
        assert_eq!(ticks.load(Ordering::SeqCst), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_without_exit_callback() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let called = Arc::new(AtomicUsize::new(0));
        let called_clone = called.clone();
        let mut supervisor = PollingSupervisor::new();
        supervisor.ensure_running(
            timing(),
            counting_tick(ticks.clone(), PollTick::Queued),
            move |_| async move {
                called_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        supervisor.stop();
        assert!(!supervisor.is_active());
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_a_noop_while_running() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut supervisor = PollingSupervisor::new();
        assert!(supervisor.ensure_running(
            timing(),
            counting_tick(ticks.clone(), PollTick::Queued),
            |_| async {},
        ));
        assert!(!supervisor.ensure_running(
            timing(),
            counting_tick(ticks, PollTick::Queued),
            |_| async {},
        ));
        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_inflight_tick_keeps_next_window_clean() {
        let short = PollTiming {
            interval: Duration::from_secs(5),
            extend: Duration::from_secs(5),
            ceiling: Duration::from_secs(600),
        };
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));
        let exits = Arc::new(AtomicUsize::new(0));

        let mut supervisor = PollingSupervisor::new();
        let (release_tick, started_tick, exits_cb) =
            (release.clone(), started.clone(), exits.clone());
        supervisor.ensure_running(
            short,
            move || {
                started_tick.fetch_add(1, Ordering::SeqCst);
                let release = release_tick.clone();
                async move {
                    release.notified().await;
                    PollTick::Skipped
                }
            },
            move |_| async move {
                exits_cb.fetch_add(1, Ordering::SeqCst);
            },
        );

        time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // The blocked tick will land past its deadline once released.
        supervisor.stop();
        let ticks = Arc::new(AtomicUsize::new(0));
        assert!(supervisor.ensure_running(
            timing(),
            counting_tick(ticks, PollTick::Queued),
            |_| async {},
        ));

        release.notify_one();
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(exits.load(Ordering::SeqCst), 0);
        assert!(!supervisor.is_exhausted());
        assert!(supervisor.is_active());
        supervisor.stop();
    }
}
