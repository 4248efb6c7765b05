//! Health watchdog: periodic self-repair of inconsistent session state.
//!
//! The watchdog runs on its own thread, independent of any run worker. Each
//! period it takes a [`HealthView`] from its target, evaluates four pure
//! checks, and applies the resulting [`Repair`]s. Repairs are idempotent, so
//! a repair that races with the worker fixing itself is harmless.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::controller::WAITING_LABEL;
use crate::error::AutomationError;
use crate::session::{ControlAffordance, SessionView};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogConfig {
    pub period: Duration,
    /// How long the display may sit on the waiting label with no countdown
    /// before a raised run flag counts as stuck.
    pub stuck_threshold: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            stuck_threshold: Duration::from_secs(10),
        }
    }
}

/// The slice of session state the checks look at.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthView {
    pub run_flag: bool,
    pub worker_alive: bool,
    pub current_index: usize,
    pub prompt_count: usize,
    pub last_label: Option<String>,
    pub countdown_active: bool,
    pub idle_for: Duration,
    pub control: ControlAffordance,
}

impl HealthView {
    pub fn from_session(view: &SessionView, worker_alive: bool) -> Self {
        Self {
            run_flag: view.run_flag,
            worker_alive,
            current_index: view.current_index,
            prompt_count: view.prompts.len(),
            last_label: view.last_tick.as_ref().map(|tick| tick.label.clone()),
            countdown_active: view.countdown_active,
            idle_for: view.countdown_idle_for,
            control: view.control,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Display stuck between prompts with a raised run flag.
    ForceCancel,
    /// Run flag raised but no worker alive.
    ResetIdle,
    ClampIndex,
    /// Re-publish the control affordance matching the run flag.
    Resync(ControlAffordance),
}

impl Repair {
    /// Name of the check that produced this repair.
    pub fn check(&self) -> &'static str {
        match self {
            Repair::ForceCancel => "stuck_display",
            Repair::ResetIdle => "orphaned_worker",
            Repair::ClampIndex => "invalid_index",
            Repair::Resync(_) => "affordance_mismatch",
        }
    }
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repair::ForceCancel => f.write_str("forced cancel of stuck run"),
            Repair::ResetIdle => f.write_str("reset orphaned run to idle"),
            Repair::ClampIndex => f.write_str("clamped out-of-range index to 0"),
            Repair::Resync(ControlAffordance::Start) => f.write_str("re-published start control"),
            Repair::Resync(ControlAffordance::Stop) => f.write_str("re-published stop control"),
        }
    }
}

pub fn stuck_display(view: &HealthView, threshold: Duration) -> bool {
    let idle_label = match view.last_label.as_deref() {
        None => true,
        Some(label) => label == WAITING_LABEL,
    };
    view.run_flag && idle_label && !view.countdown_active && view.idle_for > threshold
}

pub fn orphaned_worker(view: &HealthView) -> bool {
    view.run_flag && !view.worker_alive
}

pub fn invalid_index(view: &HealthView) -> bool {
    view.current_index > view.prompt_count
}

/// The affordance the display should show, if it currently shows the other.
pub fn affordance_mismatch(view: &HealthView) -> Option<ControlAffordance> {
    let expected = if view.run_flag {
        ControlAffordance::Stop
    } else {
        ControlAffordance::Start
    };
    (view.control != expected).then_some(expected)
}

/// Run every check against one view.
///
/// A dead worker takes precedence over a stuck display. Lifecycle repairs
/// re-publish the control themselves, so the affordance check only runs when
/// neither fired.
pub fn evaluate(view: &HealthView, config: &WatchdogConfig) -> Vec<Repair> {
    let mut repairs = Vec::new();

    let lifecycle = if orphaned_worker(view) {
        Some(Repair::ResetIdle)
    } else if stuck_display(view, config.stuck_threshold) {
        Some(Repair::ForceCancel)
    } else {
        None
    };
    repairs.extend(lifecycle);

    if invalid_index(view) {
        repairs.push(Repair::ClampIndex);
    }

    if lifecycle.is_none() {
        if let Some(expected) = affordance_mismatch(view) {
            repairs.push(Repair::Resync(expected));
        }
    }
    repairs
}

/// Something the watchdog can inspect and repair.
pub trait Supervised: Send + Sync + 'static {
    fn health_view(&self) -> HealthView;
    fn apply_repair(&self, repair: &Repair);
}

pub struct Watchdog<T: Supervised> {
    target: Arc<T>,
    config: WatchdogConfig,
}

impl<T: Supervised> Watchdog<T> {
    pub fn new(target: Arc<T>, config: WatchdogConfig) -> Self {
        Self { target, config }
    }

    /// One evaluation pass. Returns the repairs applied.
    pub fn tick(&self) -> Vec<Repair> {
        let view = self.target.health_view();
        let repairs = evaluate(&view, &self.config);
        for repair in &repairs {
            let err = AutomationError::Corruption(repair.to_string());
            warn!(
                check = repair.check(),
                class = %err.class(),
                index = view.current_index,
                "{err}"
            );
            self.target.apply_repair(repair);
        }
        repairs
    }

    /// Run `tick` every period until `stop` is raised.
    pub fn spawn(self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("stacker-watchdog".to_string())
            .spawn(move || {
                debug!(period_secs = self.config.period.as_secs_f64(), "watchdog started");
                let slice = self.config.period.min(Duration::from_millis(100));
                while !stop.load(Ordering::Relaxed) {
                    self.tick();
                    let mut slept = Duration::ZERO;
                    while slept < self.config.period && !stop.load(Ordering::Relaxed) {
                        thread::sleep(slice);
                        slept += slice;
                    }
                }
                debug!("watchdog stopped");
            })
    }
}
