//! Backtrack detection and trajectory flattening.
//!
//! # Approximation Warning
//!
//! Without an explicit `_direction` on the action, direction is inferred by
//! substring search for a fixed keyword list. Precision and recall of that
//! heuristic are unknown; the list is kept as-is so outputs stay comparable
//! with earlier runs.

use std::fmt;

use crate::trajectory::{Action, Direction, Step, Trajectory};

/// Phrase the search emits when it retracts a decision.
pub const BACKTRACK_PHRASE: &str = "we should take a step back";

/// Literal token of the browser "go back" operation.
pub const GO_BACK_TOKEN: &str = "go_back";

/// Classify an action as forward or backtracking.
pub fn classify(action: &Action) -> Direction {
    if let Some(direction) = action.explicit_direction {
        return direction;
    }
    let text = [&action.raw_prediction, &action.answer]
        .into_iter()
        .flatten()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");
    if text.contains(BACKTRACK_PHRASE) || text.contains(GO_BACK_TOKEN) {
        Direction::Backtrack
    } else {
        Direction::Forward
    }
}

pub fn is_backtrack(action: &Action) -> bool {
    classify(action) == Direction::Backtrack
}

/// Remove every backtracking action together with the state it was issued
/// from. The state reached after the backtrack takes its place, so an
/// alternating trajectory stays alternating.
pub fn flatten(trajectory: &Trajectory) -> Trajectory {
    let mut steps: Vec<Step> = Vec::with_capacity(trajectory.len());
    for step in trajectory.steps() {
        match step {
            Step::Action(action) if is_backtrack(action) => {
                if matches!(steps.last(), Some(Step::State(_))) {
                    steps.pop();
                }
            }
            other => steps.push(other.clone()),
        }
    }
    Trajectory::new(steps)
}

/// Why a flattened trajectory cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlattenReject {
    TooShort,
    LastNotAction,
    NoStateBeforeAction,
    ElementIdMissing(String),
}

impl FlattenReject {
    /// Stable key for reports.
    pub fn key(&self) -> &'static str {
        match self {
            FlattenReject::TooShort => "too_short",
            FlattenReject::LastNotAction => "last_not_action",
            FlattenReject::NoStateBeforeAction => "no_state_before_action",
            FlattenReject::ElementIdMissing(_) => "element_id_missing",
        }
    }
}

impl fmt::Display for FlattenReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlattenReject::ElementIdMissing(id) => {
                write!(f, "element id {} not found in observation", id)
            }
            other => f.write_str(other.key()),
        }
    }
}

/// Check that a flattened trajectory still ends on a grounded action.
pub fn validate_flattened(trajectory: &Trajectory) -> Result<(), FlattenReject> {
    let steps = trajectory.steps();
    if steps.len() < 2 {
        return Err(FlattenReject::TooShort);
    }
    let Some(last) = steps[steps.len() - 1].as_action() else {
        return Err(FlattenReject::LastNotAction);
    };
    let Some(state) = steps[steps.len() - 2].as_state() else {
        return Err(FlattenReject::NoStateBeforeAction);
    };
    if let Some(id) = last.element_id.as_deref().filter(|id| !id.is_empty()) {
        if !state.observation.contains(&format!("[{}]", id)) {
            return Err(FlattenReject::ElementIdMissing(id.to_string()));
        }
    }
    Ok(())
}
