//! Shared session state.
//!
//! One `SessionState` is shared by exactly three participants: the
//! controlling thread (edits prompts, coordinates and timers at any time), the
//! run's worker thread (reads the guarded fields, writes `current_index` and the
//! lifecycle state), and the watchdog (reads everything, applies repairs).
//! Clones share the same underlying state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::countdown::ControlToken;

/// Target roles the automation clicks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Input,
    Submit,
    Accept,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Input, Role::Submit, Role::Accept];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Input => "input",
            Role::Submit => "submit",
            Role::Accept => "accept",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Screen location in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn is_non_negative(&self) -> bool {
        self.x >= 0 && self.y >= 0
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

pub type Coordinates = BTreeMap<Role, Point>;

/// The four phase durations, in seconds.
///
/// Stored as raw seconds because the controlling thread may write any value;
/// validation happens when a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timers {
    pub start_delay: f64,
    pub get_ready_delay: f64,
    pub main_wait: f64,
    pub cooldown: f64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            start_delay: 5.0,
            get_ready_delay: 2.0,
            main_wait: 300.0,
            cooldown: 0.2,
        }
    }
}

impl Timers {
    pub fn zero() -> Self {
        Self {
            start_delay: 0.0,
            get_ready_delay: 0.0,
            main_wait: 0.0,
            cooldown: 0.0,
        }
    }

    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("start_delay", self.start_delay),
            ("get_ready_delay", self.get_ready_delay),
            ("main_wait", self.main_wait),
            ("cooldown", self.cooldown),
        ]
    }

    /// Duration for a phase. Invalid values collapse to zero; callers validate
    /// before relying on them.
    pub fn duration(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::StartDelay => self.start_delay,
            Phase::GetReady => self.get_ready_delay,
            Phase::MainWait => self.main_wait,
            Phase::Cooldown => self.cooldown,
        };
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

/// Named timed steps of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    StartDelay,
    GetReady,
    MainWait,
    Cooldown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::StartDelay => "start_delay",
            Phase::GetReady => "get_ready",
            Phase::MainWait => "main_wait",
            Phase::Cooldown => "cooldown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one automation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationState {
    Idle,
    Starting,
    Running,
    Paused,
    Cancelled,
    Completed,
}

impl AutomationState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AutomationState::Starting | AutomationState::Running | AutomationState::Paused
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationState::Idle => "idle",
            AutomationState::Starting => "starting",
            AutomationState::Running => "running",
            AutomationState::Paused => "paused",
            AutomationState::Cancelled => "cancelled",
            AutomationState::Completed => "completed",
        }
    }
}

impl fmt::Display for AutomationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the controlling thread's start/stop control currently offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAffordance {
    /// "Not started": the control would start a run.
    Start,
    /// The control would stop the active run.
    Stop,
}

/// One published countdown progress update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickUpdate {
    pub remaining: Duration,
    pub total: Duration,
    pub label: String,
    pub next_label: String,
    pub paused: bool,
}

impl TickUpdate {
    /// Whole seconds left, rounded up so a countdown only shows 0 when done.
    pub fn display_secs(&self) -> u64 {
        self.remaining.as_secs_f64().ceil() as u64
    }
}

/// The three operator-editable fields that a run snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedData {
    pub prompts: Vec<String>,
    pub coordinates: Coordinates,
    pub timers: Timers,
}

/// Read-only copy of the whole session for display or inspection.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub prompts: Vec<String>,
    pub coordinates: Coordinates,
    pub timers: Timers,
    pub current_index: usize,
    pub run_flag: bool,
    pub paused_flag: bool,
    pub cancelled_flag: bool,
    pub state: AutomationState,
    pub last_tick: Option<TickUpdate>,
    pub countdown_active: bool,
    pub countdown_idle_for: Duration,
    pub control: ControlAffordance,
}

#[derive(Debug)]
struct DisplayState {
    last_tick: Option<TickUpdate>,
    countdown_active: bool,
    last_activity: Instant,
    control: ControlAffordance,
}

#[derive(Debug)]
struct SessionInner {
    prompts: Vec<String>,
    coordinates: Coordinates,
    timers: Timers,
    current_index: usize,
    run_flag: bool,
    state: AutomationState,
    control: ControlToken,
    display: DisplayState,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    inner: Arc<Mutex<SessionInner>>,
}

impl SessionState {
    pub fn new(prompts: Vec<String>, coordinates: Coordinates, timers: Timers) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                prompts,
                coordinates,
                timers,
                current_index: 0,
                run_flag: false,
                state: AutomationState::Idle,
                control: ControlToken::new(),
                display: DisplayState {
                    last_tick: None,
                    countdown_active: false,
                    last_activity: Instant::now(),
                    control: ControlAffordance::Start,
                },
            })),
        }
    }

    // ── Operator-editable fields ──

    pub fn prompts(&self) -> Vec<String> {
        self.inner.lock().unwrap().prompts.clone()
    }

    pub fn set_prompts(&self, prompts: Vec<String>) {
        self.inner.lock().unwrap().prompts = prompts;
    }

    pub fn coordinates(&self) -> Coordinates {
        self.inner.lock().unwrap().coordinates.clone()
    }

    pub fn set_coordinate(&self, role: Role, point: Point) {
        self.inner.lock().unwrap().coordinates.insert(role, point);
    }

    pub fn clear_coordinate(&self, role: Role) {
        self.inner.lock().unwrap().coordinates.remove(&role);
    }

    pub fn timers(&self) -> Timers {
        self.inner.lock().unwrap().timers
    }

    pub fn set_timers(&self, timers: Timers) {
        self.inner.lock().unwrap().timers = timers;
    }

    /// Consistent copy of the three guarded fields, taken under one lock.
    pub fn guarded(&self) -> GuardedData {
        let inner = self.inner.lock().unwrap();
        GuardedData {
            prompts: inner.prompts.clone(),
            coordinates: inner.coordinates.clone(),
            timers: inner.timers,
        }
    }

    // ── Run bookkeeping ──

    pub fn current_index(&self) -> usize {
        self.inner.lock().unwrap().current_index
    }

    pub(crate) fn set_current_index(&self, index: usize) {
        self.inner.lock().unwrap().current_index = index;
    }

    pub fn run_flag(&self) -> bool {
        self.inner.lock().unwrap().run_flag
    }

    pub fn state(&self) -> AutomationState {
        self.inner.lock().unwrap().state
    }

    /// Control token of the current (or most recent) run.
    pub fn control(&self) -> ControlToken {
        self.inner.lock().unwrap().control.clone()
    }

    /// Install a fresh control token and raise `run_flag` for a new run.
    pub(crate) fn begin_run(&self, control: ControlToken) {
        let mut inner = self.inner.lock().unwrap();
        inner.control = control;
        inner.run_flag = true;
        inner.current_index = 0;
        inner.state = AutomationState::Starting;
        inner.display.last_tick = None;
        inner.display.countdown_active = false;
        inner.display.last_activity = Instant::now();
        inner.display.control = ControlAffordance::Stop;
    }

    /// Set the lifecycle state. Terminal and idle states also drop `run_flag`
    /// and publish the "not started" control affordance.
    /// Returns the previous state.
    pub(crate) fn transition(&self, state: AutomationState) -> AutomationState {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.state;
        inner.state = state;
        if !state.is_active() {
            inner.run_flag = false;
            inner.display.countdown_active = false;
            inner.display.control = ControlAffordance::Start;
        }
        previous
    }

    /// Move to `state` only if the current state is `expected`.
    pub(crate) fn compare_transition(&self, expected: AutomationState, state: AutomationState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != expected {
            return false;
        }
        inner.state = state;
        true
    }

    /// Like [`compare_transition`](Self::compare_transition), but refuses once
    /// the run's token has been cancelled.
    pub(crate) fn control_transition(&self, expected: AutomationState, state: AutomationState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != expected || inner.control.is_cancelled() {
            return false;
        }
        inner.state = state;
        true
    }

    /// Current state, or `None` once cancellation has been requested.
    pub(crate) fn live_state(&self) -> Option<AutomationState> {
        let inner = self.inner.lock().unwrap();
        (!inner.control.is_cancelled()).then_some(inner.state)
    }

    // ── Display ──

    pub(crate) fn record_tick(&self, update: &TickUpdate) {
        let mut inner = self.inner.lock().unwrap();
        inner.display.last_tick = Some(update.clone());
        inner.display.last_activity = Instant::now();
    }

    pub(crate) fn set_countdown_active(&self, active: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.display.countdown_active = active;
        inner.display.last_activity = Instant::now();
    }

    pub(crate) fn reset_display(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.display.last_tick = None;
        inner.display.countdown_active = false;
        inner.display.last_activity = Instant::now();
    }

    pub fn control_display(&self) -> ControlAffordance {
        self.inner.lock().unwrap().display.control
    }

    /// Called by the display layer when it re-renders its start/stop control.
    pub fn set_control_display(&self, control: ControlAffordance) {
        self.inner.lock().unwrap().display.control = control;
    }

    pub fn view(&self) -> SessionView {
        let inner = self.inner.lock().unwrap();
        SessionView {
            prompts: inner.prompts.clone(),
            coordinates: inner.coordinates.clone(),
            timers: inner.timers,
            current_index: inner.current_index,
            run_flag: inner.run_flag,
            paused_flag: inner.control.is_paused(),
            cancelled_flag: inner.control.is_cancelled(),
            state: inner.state,
            last_tick: inner.display.last_tick.clone(),
            countdown_active: inner.display.countdown_active,
            countdown_idle_for: if inner.display.countdown_active {
                Duration::ZERO
            } else {
                inner.display.last_activity.elapsed()
            },
            control: inner.display.control,
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.display.last_activity = Instant::now() - by;
    }
}

/// All three roles at the screen origin.
#[cfg(test)]
pub(crate) fn origin_coordinates() -> Coordinates {
    Role::ALL.iter().map(|r| (*r, Point::new(0, 0))).collect()
}
