//! Cancellable, pausable countdown.
//!
//! ## State machine
//!
//! ```text
//! IDLE     → start(d)                  → RUNNING (or COMPLETED when d == 0)
//! RUNNING  → pause requested           → PAUSED   (remaining frozen)
//! PAUSED   → resume                    → RUNNING
//! RUNNING  → remaining reaches zero    → COMPLETED
//! RUNNING  → skip/advance requested    → COMPLETED (skipped)
//! RUNNING  → retry requested           → RUNNING   (remaining = total)
//! any      → cancel / superseded       → CANCELLED
//! ```
//!
//! The loop runs on the caller's thread. It sleeps one poll interval at a
//! time (a fraction of a tick), so cancellation is observed within one poll,
//! and it only accumulates elapsed time while not paused.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::session::TickUpdate;

/// Timing parameters for a countdown engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountdownConfig {
    /// Unit of decrement.
    pub tick: Duration,
    /// How often pause/cancel/skip/retry requests are checked.
    pub poll: Duration,
    /// Extra ticks beyond the duration before a countdown counts as stuck.
    pub grace_ticks: u32,
}

impl Default for CountdownConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            poll: Duration::from_millis(50),
            grace_ticks: 10,
        }
    }
}

impl CountdownConfig {
    pub fn new(tick: Duration, poll_divisor: u32, grace_ticks: u32) -> Self {
        let poll = tick / poll_divisor.max(1);
        Self {
            tick,
            poll: poll.max(Duration::from_millis(1)),
            grace_ticks,
        }
    }

    pub fn grace(&self) -> Duration {
        self.tick * self.grace_ticks
    }
}

#[derive(Debug, Default)]
struct ControlFlags {
    cancelled: AtomicBool,
    paused: AtomicBool,
    skip: AtomicBool,
    retry: AtomicBool,
    advance: AtomicBool,
}

/// Cooperative pause/cancel/skip/retry token for one run.
///
/// Cancellation always wins: cancelling clears a pending pause, and a
/// cancelled token refuses to pause again.
#[derive(Debug, Clone, Default)]
pub struct ControlToken {
    flags: Arc<ControlFlags>,
}

impl ControlToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flags.cancelled.store(true, Ordering::SeqCst);
        self.flags.paused.store(false, Ordering::SeqCst);
    }

    /// Returns true if this call moved the token into the paused state.
    pub fn pause(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        !self.flags.paused.swap(true, Ordering::SeqCst)
    }

    /// Returns true if this call cleared a pause.
    pub fn resume(&self) -> bool {
        self.flags.paused.swap(false, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst) && !self.is_cancelled()
    }

    pub fn request_skip(&self) {
        self.flags.skip.store(true, Ordering::SeqCst);
    }

    pub fn request_retry(&self) {
        self.flags.retry.store(true, Ordering::SeqCst);
    }

    fn take_skip(&self) -> bool {
        self.flags.skip.swap(false, Ordering::SeqCst)
    }

    fn take_retry(&self) -> bool {
        self.flags.retry.swap(false, Ordering::SeqCst)
    }

    /// Ask the run to abandon the current prompt's cycle. Ends the active
    /// countdown like a skip, but stays pending until the run takes it.
    pub fn request_advance(&self) {
        self.flags.advance.store(true, Ordering::SeqCst);
    }

    pub fn advance_requested(&self) -> bool {
        self.flags.advance.load(Ordering::SeqCst)
    }

    pub fn take_advance(&self) -> bool {
        self.flags.advance.swap(false, Ordering::SeqCst)
    }

    /// Drop skip/retry requests that arrived between countdowns.
    pub fn clear_requests(&self) {
        self.flags.skip.store(false, Ordering::SeqCst);
        self.flags.retry.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountdownState {
    pub total: Duration,
    pub remaining: Duration,
    pub label: String,
    pub next_label: String,
    pub previous_label: String,
    pub status: CountdownStatus,
}

impl CountdownState {
    fn idle() -> Self {
        Self {
            total: Duration::ZERO,
            remaining: Duration::ZERO,
            label: String::new(),
            next_label: String::new(),
            previous_label: String::new(),
            status: CountdownStatus::Idle,
        }
    }
}

/// How a countdown invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub struct CountdownOutcome {
    pub status: CountdownStatus,
    /// The countdown is still paused and the caller must wait for a resume
    /// before continuing it with [`CountdownEngine::continue_countdown`].
    pub paused: bool,
    pub skipped: bool,
    /// The hard ceiling passed while the countdown was running.
    pub timed_out: bool,
    pub retries: u32,
    pub elapsed: Duration,
}

impl CountdownOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == CountdownStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == CountdownStatus::Cancelled
    }
}

/// Result of waiting for an operator to resume a paused countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeWait {
    Resumed,
    Cancelled,
    TimedOut,
}

pub type TickObserver = Arc<dyn Fn(&TickUpdate) + Send + Sync>;

struct EngineShared {
    state: Mutex<CountdownState>,
    generation: AtomicU64,
    run_lock: Mutex<()>,
}

/// Countdown engine bound to one run's control token.
///
/// Clones share state; a clone can observe `status()` or supersede the active
/// countdown from another thread.
#[derive(Clone)]
pub struct CountdownEngine {
    shared: Arc<EngineShared>,
    config: CountdownConfig,
    control: ControlToken,
    observer: Option<TickObserver>,
}

impl std::fmt::Debug for CountdownEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountdownEngine")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

enum Exit {
    Finished(CountdownStatus),
    Skipped,
    TimedOut,
    StillPaused,
    Superseded,
}

impl CountdownEngine {
    pub fn new(config: CountdownConfig, control: ControlToken) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(CountdownState::idle()),
                generation: AtomicU64::new(0),
                run_lock: Mutex::new(()),
            }),
            config,
            control,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: TickObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &CountdownConfig {
        &self.config
    }

    pub fn control(&self) -> &ControlToken {
        &self.control
    }

    pub fn status(&self) -> CountdownStatus {
        self.shared.state.lock().unwrap().status
    }

    pub fn state(&self) -> CountdownState {
        self.shared.state.lock().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status(),
            CountdownStatus::Running | CountdownStatus::Paused
        )
    }

    /// Run a countdown to completion on the calling thread.
    ///
    /// An active countdown on this engine is superseded first; this call
    /// blocks until that loop has exited.
    pub fn start(
        &self,
        duration: Duration,
        label: &str,
        next_label: &str,
        previous_label: &str,
    ) -> CountdownOutcome {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = self.lock_run();

        if self.shared.generation.load(Ordering::SeqCst) != generation {
            // A newer start arrived while we waited for the previous loop.
            return self.outcome(CountdownStatus::Cancelled, Duration::ZERO);
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            *state = CountdownState {
                total: duration,
                remaining: duration,
                label: label.to_string(),
                next_label: next_label.to_string(),
                previous_label: previous_label.to_string(),
                status: CountdownStatus::Running,
            };
        }

        if duration.is_zero() {
            self.set_status(CountdownStatus::Completed);
            self.publish(false);
            return self.outcome(CountdownStatus::Completed, Duration::ZERO);
        }

        debug!(
            label = %label,
            secs = duration.as_secs_f64(),
            generation,
            "countdown started"
        );
        self.run_loop(generation)
    }

    /// Continue a countdown that returned with `paused: true`, keeping its
    /// remaining time.
    pub fn continue_countdown(&self) -> CountdownOutcome {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let _running = self.lock_run();

        let status = self.status();
        match status {
            CountdownStatus::Running | CountdownStatus::Paused => {
                if !self.control.is_paused() {
                    self.set_status(CountdownStatus::Running);
                }
                self.run_loop(generation)
            }
            other => self.outcome(other, Duration::ZERO),
        }
    }

    /// Stop the active countdown, if any. It ends as cancelled within one poll.
    pub fn supersede(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Block until the token leaves the paused state, bounded by `timeout`.
    pub fn await_resume(&self, timeout: Duration) -> ResumeWait {
        let deadline = Instant::now() + timeout;
        loop {
            if self.control.is_cancelled() {
                return ResumeWait::Cancelled;
            }
            if !self.control.is_paused() {
                return ResumeWait::Resumed;
            }
            if Instant::now() >= deadline {
                return ResumeWait::TimedOut;
            }
            std::thread::sleep(self.config.poll);
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, ()> {
        self.shared
            .run_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_loop(&self, generation: u64) -> CountdownOutcome {
        let started = Instant::now();
        let mut last_poll = started;
        let mut since_tick = Duration::ZERO;
        let mut paused_for_emit = Duration::ZERO;
        let mut was_paused = false;
        let mut retries = 0u32;
        let mut deadline = started + self.remaining() + self.config.grace();

        self.publish(false);

        let exit = loop {
            if self.shared.generation.load(Ordering::SeqCst) != generation {
                break Exit::Superseded;
            }
            if self.control.is_cancelled() {
                break Exit::Finished(CountdownStatus::Cancelled);
            }
            if self.control.take_skip() || self.control.advance_requested() {
                break Exit::Skipped;
            }
            if self.control.take_retry() {
                let total = {
                    let mut state = self.shared.state.lock().unwrap();
                    state.remaining = state.total;
                    state.total
                };
                since_tick = Duration::ZERO;
                retries += 1;
                deadline = Instant::now() + total + self.config.grace();
                info!(label = %self.label(), retries, "countdown restarted");
                self.publish(false);
            }

            let now = Instant::now();
            let delta = now.duration_since(last_poll);
            last_poll = now;

            if self.control.is_paused() {
                if !was_paused {
                    was_paused = true;
                    paused_for_emit = Duration::ZERO;
                    self.set_status(CountdownStatus::Paused);
                    debug!(remaining = ?self.remaining(), "countdown paused");
                    self.publish(true);
                } else {
                    paused_for_emit += delta;
                    if paused_for_emit >= self.config.tick {
                        paused_for_emit = Duration::ZERO;
                        self.publish(true);
                    }
                }
                if now >= deadline {
                    break Exit::StillPaused;
                }
                std::thread::sleep(self.config.poll);
                continue;
            }

            if was_paused {
                was_paused = false;
                self.set_status(CountdownStatus::Running);
                deadline = now + self.remaining() + self.config.grace();
                debug!(remaining = ?self.remaining(), "countdown resumed");
                self.publish(false);
            }

            since_tick += delta;
            let remaining = self.remaining();
            let step = remaining.min(self.config.tick);
            if since_tick >= step {
                since_tick -= step;
                let remaining = {
                    let mut state = self.shared.state.lock().unwrap();
                    state.remaining = state.remaining.saturating_sub(step);
                    state.remaining
                };
                self.publish(false);
                if remaining.is_zero() {
                    break Exit::Finished(CountdownStatus::Completed);
                }
            }

            if now >= deadline {
                break Exit::TimedOut;
            }
            std::thread::sleep(self.config.poll);
        };

        let elapsed = started.elapsed();
        match exit {
            Exit::Finished(status) => {
                self.set_status(status);
                if status == CountdownStatus::Cancelled {
                    debug!(label = %self.label(), "countdown cancelled");
                }
                let mut outcome = self.outcome(status, elapsed);
                outcome.retries = retries;
                outcome
            }
            Exit::Skipped => {
                {
                    let mut state = self.shared.state.lock().unwrap();
                    state.remaining = Duration::ZERO;
                    state.status = CountdownStatus::Completed;
                }
                info!(label = %self.label(), "countdown skipped");
                self.publish(false);
                let mut outcome = self.outcome(CountdownStatus::Completed, elapsed);
                outcome.skipped = true;
                outcome.retries = retries;
                outcome
            }
            Exit::TimedOut => {
                warn!(
                    label = %self.label(),
                    elapsed_secs = elapsed.as_secs_f64(),
                    "countdown exceeded its ceiling"
                );
                self.set_status(CountdownStatus::Cancelled);
                let mut outcome = self.outcome(CountdownStatus::Cancelled, elapsed);
                outcome.timed_out = true;
                outcome.retries = retries;
                outcome
            }
            Exit::StillPaused => {
                info!(label = %self.label(), "countdown still paused at ceiling; handing wait to caller");
                let mut outcome = self.outcome(CountdownStatus::Paused, elapsed);
                outcome.paused = true;
                outcome.retries = retries;
                outcome
            }
            Exit::Superseded => {
                debug!(generation, "countdown superseded by a newer start");
                self.outcome(CountdownStatus::Cancelled, elapsed)
            }
        }
    }

    fn outcome(&self, status: CountdownStatus, elapsed: Duration) -> CountdownOutcome {
        CountdownOutcome {
            status,
            paused: false,
            skipped: false,
            timed_out: false,
            retries: 0,
            elapsed,
        }
    }

    fn remaining(&self) -> Duration {
        self.shared.state.lock().unwrap().remaining
    }

    fn label(&self) -> String {
        self.shared.state.lock().unwrap().label.clone()
    }

    fn set_status(&self, status: CountdownStatus) {
        self.shared.state.lock().unwrap().status = status;
    }

    fn publish(&self, paused: bool) {
        let Some(observer) = &self.observer else {
            return;
        };
        let update = {
            let state = self.shared.state.lock().unwrap();
            TickUpdate {
                remaining: state.remaining,
                total: state.total,
                label: state.label.clone(),
                next_label: state.next_label.clone(),
                paused,
            }
        };
        observer(&update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fast_config() -> CountdownConfig {
        CountdownConfig {
            tick: Duration::from_millis(20),
            poll: Duration::from_millis(1),
            grace_ticks: 10,
        }
    }

    fn recording_engine(
        config: CountdownConfig,
        control: ControlToken,
    ) -> (CountdownEngine, Arc<Mutex<Vec<TickUpdate>>>) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let engine = CountdownEngine::new(config, control)
            .with_observer(Arc::new(move |u: &TickUpdate| sink.lock().unwrap().push(u.clone())));
        (engine, updates)
    }

    #[test]
    fn config_derives_poll_from_divisor() {
        let config = CountdownConfig::new(Duration::from_secs(1), 20, 10);
        assert_eq!(config.poll, Duration::from_millis(50));
        assert_eq!(config.grace(), Duration::from_secs(10));

        let config = CountdownConfig::new(Duration::from_millis(2), 20, 1);
        assert_eq!(config.poll, Duration::from_millis(1));
    }

    #[test]
    fn zero_duration_completes_immediately() {
        let (engine, updates) = recording_engine(fast_config(), ControlToken::new());
        let started = Instant::now();
        let outcome = engine.start(Duration::ZERO, "now", "", "");
        assert!(outcome.is_completed());
        assert!(!outcome.paused);
        assert!(started.elapsed() < Duration::from_millis(20));
        assert_eq!(engine.status(), CountdownStatus::Completed);
        assert_eq!(updates.lock().unwrap().len(), 1);
    }

    #[test]
    fn completes_after_duration_with_non_increasing_remaining() {
        let config = fast_config();
        let (engine, updates) = recording_engine(config, ControlToken::new());
        let duration = config.tick * 5;

        let outcome = engine.start(duration, "Get ready", "next", "prev");

        assert!(outcome.is_completed());
        assert!(outcome.elapsed >= duration - config.tick);
        assert!(outcome.elapsed < duration + config.tick * 10);

        let updates = updates.lock().unwrap();
        assert!(updates.windows(2).all(|w| w[1].remaining <= w[0].remaining));
        let last = updates.last().unwrap();
        assert_eq!(last.remaining, Duration::ZERO);
        assert_eq!(last.total, duration);
        assert_eq!(last.label, "Get ready");
        assert_eq!(last.next_label, "next");
        assert!(updates.iter().all(|u| u.remaining <= u.total));
    }

    #[test]
    fn partial_final_tick_is_not_rounded_up() {
        let config = fast_config();
        let (engine, _) = recording_engine(config, ControlToken::new());
        let outcome = engine.start(config.tick / 2, "short", "", "");
        assert!(outcome.is_completed());
        assert!(outcome.elapsed < config.tick * 3);
    }

    #[test]
    fn pause_freezes_remaining_and_extends_wall_time() {
        let config = fast_config();
        let control = ControlToken::new();
        let (engine, updates) = recording_engine(config, control.clone());
        let duration = config.tick * 5;
        let pause_for = config.tick * 5;

        let pauser = {
            let control = control.clone();
            thread::spawn(move || {
                thread::sleep(config.tick * 2);
                control.pause();
                thread::sleep(pause_for);
                control.resume();
            })
        };

        let outcome = engine.start(duration, "wait", "", "");
        pauser.join().unwrap();

        assert!(outcome.is_completed());
        assert!(
            outcome.elapsed >= duration + pause_for - config.tick,
            "elapsed {:?}",
            outcome.elapsed
        );

        let updates = updates.lock().unwrap();
        let paused: Vec<_> = updates.iter().filter(|u| u.paused).collect();
        assert!(!paused.is_empty());
        let frozen = paused[0].remaining;
        assert!(paused.iter().all(|u| u.remaining == frozen));
    }

    #[test]
    fn cancel_is_observed_within_one_poll() {
        let config = CountdownConfig {
            tick: Duration::from_secs(1),
            poll: Duration::from_millis(5),
            grace_ticks: 10,
        };
        let control = ControlToken::new();
        let engine = CountdownEngine::new(config, control.clone());

        let worker = {
            let engine = engine.clone();
            thread::spawn(move || engine.start(Duration::from_secs(60), "long", "", ""))
        };
        thread::sleep(Duration::from_millis(30));
        let cancelled_at = Instant::now();
        control.cancel();
        let outcome = worker.join().unwrap();

        assert!(outcome.is_cancelled());
        assert!(cancelled_at.elapsed() < Duration::from_millis(250));
        assert_eq!(engine.status(), CountdownStatus::Cancelled);
    }

    #[test]
    fn cancel_overrides_pause() {
        let config = fast_config();
        let control = ControlToken::new();
        let engine = CountdownEngine::new(config, control.clone());
        control.pause();

        let worker = {
            let engine = engine.clone();
            thread::spawn(move || engine.start(config.tick * 50, "held", "", ""))
        };
        thread::sleep(config.tick);
        assert_eq!(engine.status(), CountdownStatus::Paused);
        control.cancel();
        let outcome = worker.join().unwrap();

        assert!(outcome.is_cancelled());
        assert!(!control.is_paused());
        assert!(!control.pause(), "a cancelled token refuses to pause");
    }

    #[test]
    fn skip_completes_immediately() {
        let config = fast_config();
        let control = ControlToken::new();
        let engine = CountdownEngine::new(config, control.clone());

        let worker = {
            let engine = engine.clone();
            thread::spawn(move || engine.start(config.tick * 500, "long", "", ""))
        };
        thread::sleep(config.tick * 2);
        control.request_skip();
        let outcome = worker.join().unwrap();

        assert!(outcome.is_completed());
        assert!(outcome.skipped);
        assert!(outcome.elapsed < config.tick * 50);
        assert_eq!(engine.state().remaining, Duration::ZERO);
    }

    #[test]
    fn advance_ends_countdown_and_stays_pending() {
        let config = fast_config();
        let control = ControlToken::new();
        let engine = CountdownEngine::new(config, control.clone());

        let worker = {
            let engine = engine.clone();
            thread::spawn(move || engine.start(config.tick * 500, "long", "", ""))
        };
        thread::sleep(config.tick * 2);
        control.request_advance();
        let outcome = worker.join().unwrap();

        assert!(outcome.skipped);
        assert!(outcome.elapsed < config.tick * 50);
        control.clear_requests();
        assert!(control.advance_requested(), "phase reset keeps the advance");

        let outcome = engine.start(config.tick * 500, "next", "", "");
        assert!(outcome.skipped);
        assert!(control.take_advance());
        assert!(!control.advance_requested());
    }

    #[test]
    fn retry_restarts_with_same_duration() {
        let config = fast_config();
        let control = ControlToken::new();
        let engine = CountdownEngine::new(config, control.clone());
        let duration = config.tick * 6;

        let retrier = {
            let control = control.clone();
            thread::spawn(move || {
                thread::sleep(config.tick * 3);
                control.request_retry();
            })
        };
        let outcome = engine.start(duration, "retry me", "", "");
        retrier.join().unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.retries, 1);
        assert!(outcome.elapsed >= duration + config.tick * 2);
    }

    #[test]
    fn ceiling_while_paused_hands_wait_to_caller() {
        let config = CountdownConfig {
            tick: Duration::from_millis(10),
            poll: Duration::from_millis(1),
            grace_ticks: 2,
        };
        let control = ControlToken::new();
        let engine = CountdownEngine::new(config, control.clone());
        control.pause();

        let outcome = engine.start(config.tick * 2, "held", "", "");
        assert_eq!(outcome.status, CountdownStatus::Paused);
        assert!(outcome.paused);
        assert_eq!(engine.status(), CountdownStatus::Paused);
        assert_eq!(engine.state().remaining, config.tick * 2);

        control.resume();
        assert_eq!(
            engine.await_resume(Duration::from_millis(50)),
            ResumeWait::Resumed
        );
        let outcome = engine.continue_countdown();
        assert!(outcome.is_completed());
    }

    #[test]
    fn await_resume_times_out_and_sees_cancel() {
        let config = fast_config();
        let control = ControlToken::new();
        let engine = CountdownEngine::new(config, control.clone());
        control.pause();
        assert_eq!(
            engine.await_resume(Duration::from_millis(20)),
            ResumeWait::TimedOut
        );
        control.cancel();
        assert_eq!(
            engine.await_resume(Duration::from_millis(20)),
            ResumeWait::Cancelled
        );
    }

    #[test]
    fn starting_again_supersedes_the_active_countdown() {
        let config = fast_config();
        let engine = CountdownEngine::new(config, ControlToken::new());

        let first = {
            let engine = engine.clone();
            thread::spawn(move || engine.start(config.tick * 500, "first", "", ""))
        };
        thread::sleep(config.tick * 2);
        assert!(engine.is_active());

        let second = engine.start(config.tick * 2, "second", "", "");
        let first = first.join().unwrap();

        assert!(first.is_cancelled());
        assert!(second.is_completed());
        assert_eq!(engine.state().label, "second");
    }
}
