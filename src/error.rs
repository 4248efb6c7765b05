//! Failure taxonomy for automation runs.
//!
//! Every failure a run can produce falls into one of five classes. The class
//! decides propagation: validation failures reject `start()`, consistency and
//! liveness failures end the run as cancelled, recoverable failures stay inside
//! the phase that produced them, and corruption is repaired by the watchdog
//! without ever reaching the operator as a run failure.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::session::Role;

/// Coarse failure class, carried on progress events so a display layer can
/// render a specific message instead of a generic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Validation,
    Consistency,
    Liveness,
    Recoverable,
    Corruption,
    /// A countdown exceeded its hard ceiling without being paused.
    Cancellation,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureClass::Validation => "validation",
            FailureClass::Consistency => "consistency",
            FailureClass::Liveness => "liveness",
            FailureClass::Recoverable => "recoverable",
            FailureClass::Corruption => "corruption",
            FailureClass::Cancellation => "cancellation",
        };
        f.write_str(label)
    }
}

/// Precondition violations detected by `start()` before any thread exists.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no prompts loaded")]
    NoPrompts,
    #[error("coordinate for '{0}' is not set")]
    MissingCoordinate(Role),
    #[error("coordinate for '{role}' is negative ({x}, {y})")]
    NegativeCoordinate { role: Role, x: i32, y: i32 },
    #[error("timer '{name}' is not a valid duration ({value})")]
    InvalidTimer { name: &'static str, value: f64 },
    #[error("timer '{name}' is {secs}s, above the {max_secs}s ceiling")]
    TimerTooLarge {
        name: &'static str,
        secs: f64,
        max_secs: u64,
    },
    #[error("automation cannot start from state {0}")]
    NotIdle(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutomationError {
    #[error("cannot start automation: {0}")]
    Validation(#[from] ValidationError),

    #[error("session data changed mid-run ({field} edited); run aborted")]
    Consistency { field: String },

    #[error("run stayed paused longer than {}s; run aborted", timeout.as_secs())]
    Liveness { timeout: Duration },

    #[error("{action} failed after retry: {detail}")]
    Recoverable { action: String, detail: String },

    #[error("inconsistent state repaired: {0}")]
    Corruption(String),

    #[error("countdown '{label}' exceeded its {}s ceiling", ceiling.as_secs())]
    CountdownCeiling { label: String, ceiling: Duration },

    #[error("failed to spawn run worker: {0}")]
    WorkerSpawn(String),
}

impl AutomationError {
    pub fn class(&self) -> FailureClass {
        match self {
            AutomationError::Validation(_) => FailureClass::Validation,
            AutomationError::Consistency { .. } => FailureClass::Consistency,
            AutomationError::Liveness { .. } => FailureClass::Liveness,
            AutomationError::Recoverable { .. } => FailureClass::Recoverable,
            AutomationError::Corruption(_) => FailureClass::Corruption,
            AutomationError::CountdownCeiling { .. } => FailureClass::Cancellation,
            AutomationError::WorkerSpawn(_) => FailureClass::Liveness,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_map_one_to_one() {
        assert_eq!(
            AutomationError::from(ValidationError::NoPrompts).class(),
            FailureClass::Validation
        );
        assert_eq!(
            AutomationError::Consistency {
                field: "timers".to_string()
            }
            .class(),
            FailureClass::Consistency
        );
        assert_eq!(
            AutomationError::Liveness {
                timeout: Duration::from_secs(300)
            }
            .class(),
            FailureClass::Liveness
        );
        assert_eq!(
            AutomationError::Corruption("index".to_string()).class(),
            FailureClass::Corruption
        );
    }

    #[test]
    fn messages_name_the_offending_field() {
        let err = AutomationError::from(ValidationError::MissingCoordinate(Role::Submit));
        assert_eq!(
            err.to_string(),
            "cannot start automation: coordinate for 'submit' is not set"
        );

        let err = AutomationError::Liveness {
            timeout: Duration::from_secs(300),
        };
        assert!(err.to_string().contains("300s"));
    }

    #[test]
    fn failure_class_serializes_snake_case() {
        let json = serde_json::to_string(&FailureClass::Consistency).unwrap();
        assert_eq!(json, "\"consistency\"");
    }
}
