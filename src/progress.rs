//! Progress events delivered to the controlling thread.
//!
//! Ticks, lifecycle transitions, index changes and run failures all travel
//! over the same observer channel so a display layer can render a specific
//! message per failure class instead of a generic error.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::warn;

use crate::error::FailureClass;
use crate::session::{AutomationState, Phase, TickUpdate};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Tick(TickUpdate),
    StateChanged {
        from: AutomationState,
        to: AutomationState,
    },
    PhaseStarted {
        phase: Phase,
        index: Option<usize>,
    },
    IndexChanged {
        index: usize,
        total: usize,
    },
    Failed {
        class: FailureClass,
        message: String,
    },
    Repaired {
        check: &'static str,
        detail: String,
    },
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Registered progress observers. Clones share the registration list.
#[derive(Clone, Default)]
pub struct Observers {
    callbacks: Arc<Mutex<Vec<ProgressCallback>>>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.callbacks.lock().unwrap().len())
            .finish()
    }
}

impl Observers {
    pub fn register(&self, callback: ProgressCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Deliver an event to every observer. Callbacks run outside the
    /// registration lock; a panicking observer is logged and skipped.
    pub fn emit(&self, event: &ProgressEvent) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(?event, "progress observer panicked");
            }
        }
    }
}
