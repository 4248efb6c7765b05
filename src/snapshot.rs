//! Run snapshots and drift detection.
//!
//! A run captures the operator-editable data once, at start, and executes
//! against that copy. Before each prompt the worker re-reads the live session
//! and compares it with the snapshot; any edit aborts the run instead of letting
//! it continue with data the operator no longer wants.

use crate::session::{Coordinates, GuardedData, SessionState, Timers};

/// Immutable copy of prompts, coordinates and timers taken at run start.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    data: GuardedData,
}

/// First field found to differ between a snapshot and the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    Prompts,
    Coordinates,
    Timers,
}

impl Divergence {
    pub fn field(&self) -> &'static str {
        match self {
            Divergence::Prompts => "prompts",
            Divergence::Coordinates => "coordinates",
            Divergence::Timers => "timers",
        }
    }
}

impl RunSnapshot {
    pub fn data(&self) -> &GuardedData {
        &self.data
    }

    pub fn prompts(&self) -> &[String] {
        &self.data.prompts
    }

    pub fn coordinates(&self) -> &Coordinates {
        &self.data.coordinates
    }

    pub fn timers(&self) -> &Timers {
        &self.data.timers
    }

    pub fn len(&self) -> usize {
        self.data.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.prompts.is_empty()
    }
}

/// Deep copy of the session's guarded fields.
pub fn capture(session: &SessionState) -> RunSnapshot {
    RunSnapshot {
        data: session.guarded(),
    }
}

/// Compare field by field; prompts are compared item for item, not by count.
pub fn divergence(snapshot: &RunSnapshot, live: &GuardedData) -> Option<Divergence> {
    if snapshot.data.prompts != live.prompts {
        return Some(Divergence::Prompts);
    }
    if snapshot.data.coordinates != live.coordinates {
        return Some(Divergence::Coordinates);
    }
    if snapshot.data.timers != live.timers {
        return Some(Divergence::Timers);
    }
    None
}

pub fn diverged(snapshot: &RunSnapshot, live: &GuardedData) -> bool {
    divergence(snapshot, live).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Point, Role, origin_coordinates};
    use proptest::prelude::*;

    fn session() -> SessionState {
        SessionState::new(
            vec!["A".to_string(), "B".to_string()],
            origin_coordinates(),
            Timers::zero(),
        )
    }

    #[test]
    fn fresh_snapshot_matches_live_state() {
        let session = session();
        let snapshot = capture(&session);
        assert!(!diverged(&snapshot, &session.guarded()));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_edits() {
        let session = session();
        let snapshot = capture(&session);
        session.set_timers(Timers {
            main_wait: 42.0,
            ..Timers::zero()
        });
        assert_eq!(snapshot.timers().main_wait, 0.0);
        assert_eq!(
            divergence(&snapshot, &session.guarded()),
            Some(Divergence::Timers)
        );
    }

    #[test]
    fn same_count_prompt_edit_is_detected() {
        let session = session();
        let snapshot = capture(&session);
        session.set_prompts(vec!["A".to_string(), "C".to_string()]);
        assert_eq!(
            divergence(&snapshot, &session.guarded()),
            Some(Divergence::Prompts)
        );
    }

    #[test]
    fn coordinate_move_is_detected() {
        let session = session();
        let snapshot = capture(&session);
        session.set_coordinate(Role::Submit, Point::new(10, 0));
        assert_eq!(
            divergence(&snapshot, &session.guarded()).map(|d| d.field()),
            Some("coordinates")
        );
    }

    proptest! {
        #[test]
        fn divergence_matches_structural_inequality(
            prompts in proptest::collection::vec("[a-z]{0,4}", 0..4),
            edited in proptest::collection::vec("[a-z]{0,4}", 0..4),
            wait in 0.0f64..10.0,
            edited_wait in 0.0f64..10.0,
        ) {
            let session = SessionState::new(
                prompts.clone(),
                origin_coordinates(),
                Timers { main_wait: wait, ..Timers::zero() },
            );
            let snapshot = capture(&session);
            session.set_prompts(edited.clone());
            session.set_timers(Timers { main_wait: edited_wait, ..Timers::zero() });

            let expected = prompts != edited || wait != edited_wait;
            prop_assert_eq!(diverged(&snapshot, &session.guarded()), expected);
        }
    }
}
