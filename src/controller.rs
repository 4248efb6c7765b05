//! Automation controller: lifecycle and the run worker.
//!
//! ## State machine
//!
//! ```text
//! Idle ──start()──▶ Starting ──worker up──▶ Running ⇄ Paused
//!                       │                      │         │
//!                       └──────── cancel ──────┴─────────┴──▶ Cancelled
//!                                              └── last prompt ──▶ Completed
//! ```
//!
//! `start()` validates, snapshots, and spawns exactly one worker thread. The
//! worker walks the snapshot's prompts through four timed phases each and is
//! the only writer of `current_index` during a run. Every other operation
//! flips flags on the run's [`ControlToken`] and returns immediately.

use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actions::{self, AcceptOutcome, ActionDriver};
use crate::countdown::{
    ControlToken, CountdownConfig, CountdownEngine, CountdownOutcome, ResumeWait,
};
use crate::error::{AutomationError, ValidationError};
use crate::log::{ExecutionLog, LogEvent};
use crate::progress::{Observers, ProgressEvent};
use crate::session::{
    AutomationState, GuardedData, Phase, Role, SessionState, SessionView, TickUpdate,
};
use crate::snapshot::{self, RunSnapshot};
use crate::watchdog::{HealthView, Repair, Supervised};

/// Label published during the cooldown between prompts.
pub const WAITING_LABEL: &str = "Waiting...";
const START_LABEL: &str = "About to start!";
const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerConfig {
    pub countdown: CountdownConfig,
    /// How long a run may stay paused once a countdown has handed the wait
    /// back to the worker.
    pub pause_timeout: Duration,
    pub stop_join_timeout: Duration,
    pub max_timer_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            countdown: CountdownConfig::default(),
            pause_timeout: Duration::from_secs(300),
            stop_join_timeout: Duration::from_secs(5),
            max_timer_secs: 3600,
        }
    }
}

/// Check run preconditions: coordinates, then timers, then prompts.
pub fn validate(data: &GuardedData, max_timer_secs: u64) -> Result<(), ValidationError> {
    for role in Role::ALL {
        let point = data
            .coordinates
            .get(&role)
            .ok_or(ValidationError::MissingCoordinate(role))?;
        if !point.is_non_negative() {
            return Err(ValidationError::NegativeCoordinate {
                role,
                x: point.x,
                y: point.y,
            });
        }
    }

    for (name, value) in data.timers.entries() {
        if !value.is_finite() || value < 0.0 {
            return Err(ValidationError::InvalidTimer { name, value });
        }
        if value > max_timer_secs as f64 {
            return Err(ValidationError::TimerTooLarge {
                name,
                secs: value,
                max_secs: max_timer_secs,
            });
        }
    }

    if data.prompts.is_empty() {
        return Err(ValidationError::NoPrompts);
    }
    Ok(())
}

struct WorkerHandle {
    run_id: String,
    total: usize,
    handle: JoinHandle<()>,
    engine: CountdownEngine,
}

impl WorkerHandle {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct AutomationController {
    session: SessionState,
    driver: Arc<dyn ActionDriver>,
    config: ControllerConfig,
    observers: Observers,
    journal: Option<Arc<ExecutionLog>>,
    worker: Mutex<Option<WorkerHandle>>,
    /// Serializes start/stop against each other.
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for AutomationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationController")
            .field("config", &self.config)
            .field("state", &self.session.state())
            .field("worker_alive", &self.worker_alive())
            .finish()
    }
}

impl AutomationController {
    pub fn new(session: SessionState, driver: Arc<dyn ActionDriver>, config: ControllerConfig) -> Self {
        Self {
            session,
            driver,
            config,
            observers: Observers::default(),
            journal: None,
            worker: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn with_journal(mut self, journal: Arc<ExecutionLog>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Live session handle, for editing prompts, coordinates and timers.
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn session_state(&self) -> SessionView {
        self.session.view()
    }

    pub fn state(&self) -> AutomationState {
        self.session.state()
    }

    /// `(current_index, prompt count)` for the active or most recent run.
    pub fn progress(&self) -> (usize, usize) {
        let total = match self.worker.lock().unwrap().as_ref() {
            Some(worker) => worker.total,
            None => self.session.prompts().len(),
        };
        (self.session.current_index(), total)
    }

    pub fn on_tick<F>(&self, callback: F)
    where
        F: Fn(&TickUpdate) + Send + Sync + 'static,
    {
        self.observers.register(Arc::new(move |event: &ProgressEvent| {
            if let ProgressEvent::Tick(update) = event {
                callback(update);
            }
        }));
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.observers.register(Arc::new(callback));
    }

    pub fn worker_alive(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(WorkerHandle::is_alive)
    }

    /// Validate, snapshot and spawn the run worker. Returns the run id.
    ///
    /// A refused start is also published as a Validation-class
    /// [`ProgressEvent::Failed`] so the display can show why.
    pub fn start(&self) -> Result<String, AutomationError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        match self.launch() {
            Ok(launch) => {
                info!(run_id = %launch.run_id, prompts = launch.total, "automation started");
                self.observers.emit(&ProgressEvent::StateChanged {
                    from: launch.from,
                    to: AutomationState::Starting,
                });
                let _ = launch.go.send(());
                Ok(launch.run_id)
            }
            Err(err) => {
                warn!(class = %err.class(), error = %err, "automation not started");
                self.observers.emit(&ProgressEvent::Failed {
                    class: err.class(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Spawn a worker that holds until the returned `go` signal is sent.
    fn launch(&self) -> Result<Launch, AutomationError> {
        let mut slot = self.worker.lock().unwrap();

        let state = self.session.state();
        if state.is_active() || slot.as_ref().is_some_and(WorkerHandle::is_alive) {
            return Err(ValidationError::NotIdle(state.to_string()).into());
        }

        let snapshot = snapshot::capture(&self.session);
        validate(snapshot.data(), self.config.max_timer_secs)?;

        if let Some(previous) = slot.take() {
            if previous.handle.join().is_err() {
                warn!(run_id = %previous.run_id, "previous run worker had panicked");
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let control = ControlToken::new();
        self.session.begin_run(control.clone());

        let engine = {
            let session = self.session.clone();
            let observers = self.observers.clone();
            CountdownEngine::new(self.config.countdown, control).with_observer(Arc::new(
                move |update: &TickUpdate| {
                    session.record_tick(update);
                    observers.emit(&ProgressEvent::Tick(update.clone()));
                },
            ))
        };

        let total = snapshot.len();
        let context = RunContext {
            run_id: run_id.clone(),
            session: self.session.clone(),
            snapshot,
            driver: self.driver.clone(),
            engine: engine.clone(),
            observers: self.observers.clone(),
            journal: self.journal.clone(),
            pause_timeout: self.config.pause_timeout,
        };

        let (go, ready) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("stacker-run".to_string())
            .spawn(move || {
                if ready.recv().is_ok() {
                    context.execute();
                }
            })
            .map_err(|e| {
                self.session.transition(AutomationState::Idle);
                AutomationError::WorkerSpawn(e.to_string())
            })?;

        *slot = Some(WorkerHandle {
            run_id: run_id.clone(),
            total,
            handle,
            engine,
        });

        Ok(Launch {
            run_id,
            total,
            from: state,
            go,
        })
    }

    /// Freeze the active countdown. Only valid while running.
    pub fn pause(&self) -> bool {
        if !self
            .session
            .control_transition(AutomationState::Running, AutomationState::Paused)
        {
            return false;
        }
        self.session.control().pause();
        info!("automation paused");
        self.observers.emit(&ProgressEvent::StateChanged {
            from: AutomationState::Running,
            to: AutomationState::Paused,
        });
        true
    }

    pub fn resume(&self) -> bool {
        if !self
            .session
            .control_transition(AutomationState::Paused, AutomationState::Running)
        {
            return false;
        }
        self.session.control().resume();
        info!("automation resumed");
        self.observers.emit(&ProgressEvent::StateChanged {
            from: AutomationState::Paused,
            to: AutomationState::Running,
        });
        true
    }

    pub fn toggle_pause(&self) -> bool {
        match self.session.state() {
            AutomationState::Running => self.pause(),
            AutomationState::Paused => self.resume(),
            _ => false,
        }
    }

    /// Request cancellation. The worker observes it within one poll and
    /// moves the run to `Cancelled`; without a live worker the transition
    /// happens here.
    pub fn cancel(&self) -> bool {
        let state = self.session.state();
        if !state.is_active() {
            return false;
        }
        self.session.control().cancel();
        info!(from = %state, "automation cancel requested");
        if !self.worker_alive() {
            publish_transition(&self.session, &self.observers, AutomationState::Cancelled);
        }
        true
    }

    pub fn skip(&self) -> bool {
        if self.session.live_state() != Some(AutomationState::Running) {
            return false;
        }
        self.session.control().request_skip();
        debug!("skip requested");
        true
    }

    pub fn retry(&self) -> bool {
        if self.session.live_state() != Some(AutomationState::Running) {
            return false;
        }
        self.session.control().request_retry();
        debug!("retry requested");
        true
    }

    /// End the current prompt's cycle and move on to the next prompt. Only
    /// valid while running with at least one prompt left after the current.
    pub fn next_prompt(&self) -> bool {
        if self.session.live_state() != Some(AutomationState::Running) {
            return false;
        }
        let (index, total) = self.progress();
        if index + 1 >= total {
            debug!(index, total, "next prompt refused: already at the last prompt");
            return false;
        }
        self.session.control().request_advance();
        info!(index, "next prompt requested");
        true
    }

    /// Cancel, join the worker within the configured timeout, and reset to
    /// `Idle`. A worker that does not exit in time stays registered so no
    /// second worker can start next to it.
    pub fn stop(&self) -> Result<(), AutomationError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        self.session.control().cancel();

        let deadline = Instant::now() + self.config.stop_join_timeout;
        loop {
            {
                let slot = self.worker.lock().unwrap();
                match slot.as_ref() {
                    None => break,
                    Some(worker) if !worker.is_alive() => break,
                    Some(worker) => worker.engine.supersede(),
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    timeout_secs = self.config.stop_join_timeout.as_secs_f64(),
                    "run worker did not exit in time"
                );
                return Err(AutomationError::Liveness {
                    timeout: self.config.stop_join_timeout,
                });
            }
            thread::sleep(self.config.countdown.poll);
        }

        let finished = self.worker.lock().unwrap().take();
        if let Some(worker) = finished {
            if worker.handle.join().is_err() {
                warn!(run_id = %worker.run_id, "run worker panicked");
            }
        }

        publish_transition(&self.session, &self.observers, AutomationState::Idle);
        self.session.reset_display();
        info!("automation stopped");
        Ok(())
    }

    /// Block until the session leaves the active states. Returns `None` on
    /// timeout.
    pub fn wait_for_terminal(&self, timeout: Duration) -> Option<AutomationState> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.session.state();
            if !state.is_active() {
                return Some(state);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(self.config.countdown.poll);
        }
    }

    fn current_run_id(&self) -> Option<String> {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .map(|worker| worker.run_id.clone())
    }
}

impl Supervised for AutomationController {
    fn health_view(&self) -> HealthView {
        // Worker slot stays locked while reading the session so a concurrent
        // start() cannot show up as a raised run_flag without a worker.
        let slot = self.worker.lock().unwrap();
        let worker_alive = slot.as_ref().is_some_and(WorkerHandle::is_alive);
        let view = self.session.view();
        drop(slot);
        HealthView::from_session(&view, worker_alive)
    }

    fn apply_repair(&self, repair: &Repair) {
        match repair {
            Repair::ForceCancel => {
                self.session.control().cancel();
                publish_transition(&self.session, &self.observers, AutomationState::Cancelled);
                self.session.reset_display();
            }
            Repair::ResetIdle => {
                publish_transition(&self.session, &self.observers, AutomationState::Idle);
            }
            Repair::ClampIndex => self.session.set_current_index(0),
            Repair::Resync(control) => self.session.set_control_display(*control),
        }

        self.observers.emit(&ProgressEvent::Repaired {
            check: repair.check(),
            detail: repair.to_string(),
        });
        if let Some(journal) = &self.journal {
            let run_id = self.current_run_id().unwrap_or_default();
            let event = LogEvent::WatchdogRepair {
                check: repair.check().to_string(),
                detail: repair.to_string(),
            };
            if let Err(e) = journal.log(&run_id, event) {
                warn!(error = %e, "failed to write execution log");
            }
        }
    }
}

struct Launch {
    run_id: String,
    total: usize,
    from: AutomationState,
    go: mpsc::Sender<()>,
}

fn publish_transition(session: &SessionState, observers: &Observers, to: AutomationState) {
    let from = session.transition(to);
    if from != to {
        info!(%from, %to, "automation state changed");
        observers.emit(&ProgressEvent::StateChanged { from, to });
    }
}

/// How a phase's countdown let the cycle continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    /// The operator asked for the next prompt.
    Advance,
}

/// Why a run stopped before its last prompt.
enum Halt {
    Cancelled,
    Failed(AutomationError),
}

/// Everything the worker thread owns for one run.
struct RunContext {
    run_id: String,
    session: SessionState,
    snapshot: RunSnapshot,
    driver: Arc<dyn ActionDriver>,
    engine: CountdownEngine,
    observers: Observers,
    journal: Option<Arc<ExecutionLog>>,
    pause_timeout: Duration,
}

impl RunContext {
    fn execute(self) {
        let result = self.drive();
        self.finish(result);
    }

    fn drive(&self) -> Result<(), Halt> {
        if !self
            .session
            .compare_transition(AutomationState::Starting, AutomationState::Running)
        {
            return Err(Halt::Cancelled);
        }
        self.observers.emit(&ProgressEvent::StateChanged {
            from: AutomationState::Starting,
            to: AutomationState::Running,
        });
        self.record(LogEvent::RunStarted {
            prompts: self.snapshot.len(),
        });

        let prompts = self.snapshot.prompts();
        let total = prompts.len();
        let first = prompts.first().map(|p| actions::preview(p, PREVIEW_CHARS));
        let mut abandon_first = self.countdown(
            Phase::StartDelay,
            None,
            START_LABEL,
            first.as_deref().unwrap_or_default(),
            "",
        )? == Step::Advance;

        for (index, prompt) in prompts.iter().enumerate() {
            self.check_cancelled()?;
            if let Some(divergence) = snapshot::divergence(&self.snapshot, &self.session.guarded()) {
                return Err(Halt::Failed(AutomationError::Consistency {
                    field: divergence.field().to_string(),
                }));
            }
            self.publish_index(index, total);

            if abandon_first {
                abandon_first = false;
                self.advanced(index, Phase::StartDelay);
            } else {
                self.cycle(index, prompt, prompts)?;
            }
            self.publish_index(index + 1, total);
        }
        Ok(())
    }

    /// One prompt: get-ready, dispatch, main wait, accept, cooldown. An
    /// advance request ends the cycle after the phase it arrived in.
    fn cycle(&self, index: usize, prompt: &str, prompts: &[String]) -> Result<(), Halt> {
        let total = prompts.len();
        let label = format!("Prompt {} of {}", index + 1, total);
        let current = actions::preview(prompt, PREVIEW_CHARS);
        let previous = index
            .checked_sub(1)
            .map(|i| actions::preview(&prompts[i], PREVIEW_CHARS))
            .unwrap_or_default();
        let upcoming = prompts
            .get(index + 1)
            .map(|p| actions::preview(p, PREVIEW_CHARS))
            .unwrap_or_default();

        if self.countdown(Phase::GetReady, Some(index), &label, &current, &previous)? == Step::Advance {
            self.advanced(index, Phase::GetReady);
            return Ok(());
        }
        self.check_cancelled()?;
        self.dispatch(index, prompt);

        if self.countdown(Phase::MainWait, Some(index), &label, &upcoming, &current)? == Step::Advance {
            self.advanced(index, Phase::MainWait);
            return Ok(());
        }
        self.check_cancelled()?;
        self.accept(index);

        if self.countdown(Phase::Cooldown, Some(index), WAITING_LABEL, &upcoming, &current)? == Step::Advance {
            self.advanced(index, Phase::Cooldown);
        }
        Ok(())
    }

    fn advanced(&self, index: usize, phase: Phase) {
        info!(index, %phase, "moving on to the next prompt");
        self.record(LogEvent::PromptAdvanced { index, phase });
    }

    /// Run one phase's countdown, including the bounded wait when the
    /// countdown hands a still-paused run back to the worker.
    fn countdown(
        &self,
        phase: Phase,
        index: Option<usize>,
        label: &str,
        next_label: &str,
        previous_label: &str,
    ) -> Result<Step, Halt> {
        self.check_cancelled()?;
        let duration = self.snapshot.timers().duration(phase);
        // Requests from before this phase are stale; anything arriving after
        // PhaseStarted is published belongs to it.
        self.engine.control().clear_requests();
        self.session.set_countdown_active(true);

        debug!(%phase, ?index, secs = duration.as_secs_f64(), "phase started");
        self.observers
            .emit(&ProgressEvent::PhaseStarted { phase, index });
        self.record(LogEvent::PhaseStarted {
            phase,
            index,
            secs: duration.as_secs_f64(),
        });

        let outcome = self.run_countdown(duration, label, next_label, previous_label);
        self.session.set_countdown_active(false);
        let outcome = outcome?;

        self.record(LogEvent::PhaseFinished {
            phase,
            index,
            skipped: outcome.skipped,
            retries: outcome.retries,
            elapsed_secs: outcome.elapsed.as_secs_f64(),
        });

        if outcome.timed_out {
            return Err(Halt::Failed(AutomationError::CountdownCeiling {
                label: label.to_string(),
                ceiling: duration + self.engine.config().grace(),
            }));
        }
        if outcome.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        if self.engine.control().take_advance() {
            return Ok(Step::Advance);
        }
        Ok(Step::Continue)
    }

    fn run_countdown(
        &self,
        duration: Duration,
        label: &str,
        next_label: &str,
        previous_label: &str,
    ) -> Result<CountdownOutcome, Halt> {
        let mut outcome = self
            .engine
            .start(duration, label, next_label, previous_label);
        while outcome.paused {
            match self.engine.await_resume(self.pause_timeout) {
                ResumeWait::Resumed => outcome = self.engine.continue_countdown(),
                ResumeWait::Cancelled => return Err(Halt::Cancelled),
                ResumeWait::TimedOut => return Err(self.liveness_failure()),
            }
        }
        Ok(outcome)
    }

    fn liveness_failure(&self) -> Halt {
        warn!(
            timeout_secs = self.pause_timeout.as_secs_f64(),
            "run stayed paused past the timeout; cancelling"
        );
        self.engine.control().cancel();
        let settle = self
            .snapshot
            .timers()
            .duration(Phase::Cooldown)
            .min(self.engine.config().grace());
        thread::sleep(settle);
        Halt::Failed(AutomationError::Liveness {
            timeout: self.pause_timeout,
        })
    }

    fn check_cancelled(&self) -> Result<(), Halt> {
        if self.engine.control().is_cancelled() {
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    /// The first prompt is always announced; later indexes only when they move.
    fn publish_index(&self, index: usize, total: usize) {
        let previous = self.session.current_index();
        self.session.set_current_index(index);
        if previous != index || index == 0 {
            self.observers
                .emit(&ProgressEvent::IndexChanged { index, total });
        }
    }

    /// Focus, paste, then click input and submit. Action failures are logged
    /// and the run carries on to the main wait.
    fn dispatch(&self, index: usize, prompt: &str) {
        if let Err(e) = self.driver.focus_target() {
            warn!(index, error = %e, "failed to focus target window");
        }
        if let Err(e) = self.driver.paste(prompt) {
            warn!(index, error = %e, "failed to paste prompt");
        }
        for role in [Role::Input, Role::Submit] {
            let Some(point) = self.snapshot.coordinates().get(&role).copied() else {
                warn!(index, %role, "no coordinate for click");
                continue;
            };
            if let Err(e) = self.driver.click_at(point, role) {
                warn!(index, %role, error = %e, "click failed");
            }
        }
        info!(
            index,
            preview = %actions::preview(prompt, PREVIEW_CHARS),
            "prompt dispatched"
        );
        self.record(LogEvent::PromptDispatched {
            index,
            chars: prompt.chars().count(),
        });
    }

    fn accept(&self, index: usize) {
        let Some(point) = self.snapshot.coordinates().get(&Role::Accept).copied() else {
            warn!(index, "no accept coordinate");
            return;
        };
        match actions::click_accept_verified(self.driver.as_ref(), point) {
            Ok(AcceptOutcome::Accepted) => {}
            Ok(AcceptOutcome::AcceptedOnRetry) => {
                self.record(LogEvent::AcceptRetried { index });
            }
            Err(e) => {
                warn!(index, error = %e, "accept did not take; continuing");
                self.record(LogEvent::RecoverableFailure {
                    index,
                    detail: e.to_string(),
                });
            }
        }
    }

    fn finish(&self, result: Result<(), Halt>) {
        let target = match result {
            Ok(()) => {
                info!(run_id = %self.run_id, prompts = self.snapshot.len(), "automation completed");
                self.record(LogEvent::RunCompleted {
                    prompts: self.snapshot.len(),
                });
                AutomationState::Completed
            }
            Err(Halt::Cancelled) => {
                info!(run_id = %self.run_id, "automation cancelled");
                self.record(LogEvent::RunCancelled {
                    index: self.session.current_index(),
                });
                AutomationState::Cancelled
            }
            Err(Halt::Failed(err)) => {
                error!(run_id = %self.run_id, class = %err.class(), error = %err, "automation failed");
                self.observers.emit(&ProgressEvent::Failed {
                    class: err.class(),
                    message: err.to_string(),
                });
                self.record(LogEvent::RunFailed {
                    class: err.class(),
                    reason: err.to_string(),
                });
                AutomationState::Cancelled
            }
        };
        publish_transition(&self.session, &self.observers, target);
    }

    fn record(&self, event: LogEvent) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(e) = journal.log(&self.run_id, event) {
            warn!(error = %e, "failed to write execution log");
        }
    }
}
