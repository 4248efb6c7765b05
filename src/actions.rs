//! Boundary to the external click/paste/focus primitives.
//!
//! The automation core never talks to a window system directly. Everything
//! goes through an [`ActionDriver`], so the headless CLI can run with a
//! logging driver and tests can record exactly what a run did.

use thiserror::Error;
use tracing::{info, warn};

use crate::error::AutomationError;
use crate::session::{Point, Role};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("target window not found: {0}")]
    TargetNotFound(String),
    #[error("{action} failed: {detail}")]
    Failed { action: String, detail: String },
}

pub trait ActionDriver: Send + Sync + 'static {
    /// Bring the external application to the foreground.
    fn focus_target(&self) -> Result<(), ActionError>;

    /// Deliver text to the current focus target.
    fn paste(&self, text: &str) -> Result<(), ActionError>;

    fn click_at(&self, point: Point, role: Role) -> Result<(), ActionError>;

    /// Whether the element at `point` is still visible and actionable.
    fn accept_visible(&self, point: Point) -> bool;
}

/// Driver that only logs what it would do.
#[derive(Debug, Default, Clone)]
pub struct DryRunDriver {
    pub target: String,
}

impl DryRunDriver {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl ActionDriver for DryRunDriver {
    fn focus_target(&self) -> Result<(), ActionError> {
        info!(target_window = %self.target, "dry-run: focus target");
        Ok(())
    }

    fn paste(&self, text: &str) -> Result<(), ActionError> {
        info!(chars = text.chars().count(), preview = %preview(text, 50), "dry-run: paste");
        Ok(())
    }

    fn click_at(&self, point: Point, role: Role) -> Result<(), ActionError> {
        info!(role = %role, point = %point, "dry-run: click");
        Ok(())
    }

    fn accept_visible(&self, _point: Point) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    AcceptedOnRetry,
}

/// Click `accept` and verify it took; retry exactly once if the element is
/// still actionable or the click itself failed.
pub fn click_accept_verified(
    driver: &dyn ActionDriver,
    point: Point,
) -> Result<AcceptOutcome, AutomationError> {
    let first = driver.click_at(point, Role::Accept);
    if first.is_ok() && !driver.accept_visible(point) {
        return Ok(AcceptOutcome::Accepted);
    }

    let reason = match &first {
        Err(e) => e.to_string(),
        Ok(()) => "accept still visible after click".to_string(),
    };
    warn!(point = %point, reason = %reason, "accept click did not take; retrying once");

    match driver.click_at(point, Role::Accept) {
        Ok(()) if !driver.accept_visible(point) => Ok(AcceptOutcome::AcceptedOnRetry),
        Ok(()) => Err(AutomationError::Recoverable {
            action: "accept click".to_string(),
            detail: "accept still visible after retry".to_string(),
        }),
        Err(e) => Err(AutomationError::Recoverable {
            action: "accept click".to_string(),
            detail: e.to_string(),
        }),
    }
}

/// First `max_chars` characters of `text`, with an ellipsis when truncated.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Action {
        Focus,
        Paste(String),
        Click(Role, Point),
    }

    /// Driver that records every call.
    #[derive(Debug, Default)]
    pub struct RecordingDriver {
        calls: Mutex<Vec<Action>>,
        /// Number of visibility checks that still report accept as visible.
        sticky_accept: AtomicU32,
        fail_focus: bool,
    }

    impl RecordingDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_sticky_accept(checks: u32) -> Self {
            Self {
                sticky_accept: AtomicU32::new(checks),
                ..Self::default()
            }
        }

        pub fn without_target() -> Self {
            Self {
                fail_focus: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<Action> {
            self.calls.lock().unwrap().clone()
        }

        pub fn pasted(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|a| match a {
                    Action::Paste(text) => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    impl ActionDriver for RecordingDriver {
        fn focus_target(&self) -> Result<(), ActionError> {
            self.calls.lock().unwrap().push(Action::Focus);
            if self.fail_focus {
                return Err(ActionError::TargetNotFound("Cursor".to_string()));
            }
            Ok(())
        }

        fn paste(&self, text: &str) -> Result<(), ActionError> {
            self.calls
                .lock()
                .unwrap()
                .push(Action::Paste(text.to_string()));
            Ok(())
        }

        fn click_at(&self, point: Point, role: Role) -> Result<(), ActionError> {
            self.calls.lock().unwrap().push(Action::Click(role, point));
            Ok(())
        }

        fn accept_visible(&self, _point: Point) -> bool {
            self.sticky_accept
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }
}
