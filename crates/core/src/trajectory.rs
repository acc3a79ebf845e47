//! Data model: trajectories, their steps, task info, and training examples.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Direction of an action within the search that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backtrack,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Some(Direction::Forward),
            "backtrack" => Some(Direction::Backtrack),
            _ => None,
        }
    }
}

/// A recorded webpage observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Text of the accessibility-tree snapshot.
    pub observation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Free-form metadata carried along from the recording.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub info: serde_json::Value,
}

impl State {
    pub fn new(observation: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            url: None,
            info: serde_json::Value::Null,
        }
    }
}

/// An agent decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    /// Text typed by a TYPE action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Final answer carried by a STOP action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Free-text rationale the agent produced; the training label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_prediction: Option<String>,
    /// Direction recorded by the search itself, when it recorded one.
    #[serde(rename = "_direction", default, skip_serializing_if = "Option::is_none")]
    pub explicit_direction: Option<Direction>,
}

impl Action {
    /// Text used both for display and as the assistant label.
    pub fn text(&self) -> Option<&str> {
        [&self.raw_prediction, &self.answer]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|s| !s.trim().is_empty())
    }

    /// Short history entry: the action type and, if present, its target.
    /// An action whose type could not be decoded is written as `Action`.
    pub fn descriptor(&self) -> String {
        let action_type = self.action_type.as_deref().unwrap_or("Action");
        match self.element_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => format!("{} on element [{}]", action_type, id),
            None => action_type.to_string(),
        }
    }
}

/// One item of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Step {
    State(State),
    Action(Action),
}

impl Step {
    pub fn as_state(&self) -> Option<&State> {
        match self {
            Step::State(s) => Some(s),
            Step::Action(_) => None,
        }
    }

    pub fn as_action(&self) -> Option<&Action> {
        match self {
            Step::Action(a) => Some(a),
            Step::State(_) => None,
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(self, Step::State(_))
    }

    pub fn is_action(&self) -> bool {
        matches!(self, Step::Action(_))
    }
}

/// An action paired with the observation it was taken on.
#[derive(Debug, Clone, Copy)]
pub struct StepPair<'a> {
    pub state: &'a State,
    pub action: &'a Action,
    pub text: &'a str,
}

/// Ordered sequence of states and actions for one task attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trajectory(pub Vec<Step>);

impl Trajectory {
    pub fn new(steps: Vec<Step>) -> Self {
        Self(steps)
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.0.iter().filter_map(Step::as_state)
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.0.iter().filter_map(Step::as_action)
    }

    pub fn starts_with_state(&self) -> bool {
        self.0.first().is_some_and(Step::is_state)
    }

    /// True when no two neighbouring steps have the same kind.
    pub fn is_alternating(&self) -> bool {
        self.0
            .windows(2)
            .all(|w| w[0].is_state() != w[1].is_state())
    }

    /// At least two steps, starting with a state and alternating.
    pub fn is_well_formed(&self) -> bool {
        self.len() >= 2 && self.starts_with_state() && self.is_alternating()
    }

    /// The trajectory without its terminal state, if it ends on one.
    pub fn without_trailing_state(&self) -> Trajectory {
        let mut steps = self.0.clone();
        if steps.last().is_some_and(Step::is_state) {
            steps.pop();
        }
        Trajectory(steps)
    }

    /// Pairs every action with the state directly before it.
    ///
    /// A trailing state has no action and is not paired. Actions without a
    /// preceding state, or without any text, are dropped.
    pub fn observation_action_pairs(&self) -> Vec<StepPair<'_>> {
        let mut pairs = Vec::new();
        let mut pending: Option<&State> = None;
        for (idx, step) in self.0.iter().enumerate() {
            match step {
                Step::State(state) => pending = Some(state),
                Step::Action(action) => {
                    let Some(state) = pending.take() else {
                        warn!(step = idx, "action without a preceding state, dropping");
                        continue;
                    };
                    match action.text() {
                        Some(text) => pairs.push(StepPair { state, action, text }),
                        None => warn!(step = idx, "could not extract text for action, dropping"),
                    }
                }
            }
        }
        pairs
    }
}

/// Reference to a task input image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Path(PathBuf),
    Inline(Vec<u8>),
}

/// What the task asked for and how the attempt scored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInfo {
    pub task_id: Option<u64>,
    pub intent: String,
    pub images: Vec<ImageRef>,
    pub score: Option<f64>,
    pub success: Option<bool>,
}

impl TaskInfo {
    pub fn with_intent(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Default::default()
        }
    }

    /// Explicit success flag if recorded, otherwise a positive score.
    pub fn is_success(&self) -> bool {
        self.success
            .unwrap_or_else(|| self.score.is_some_and(|s| s > 0.0))
    }
}

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message of a training example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Annotations written next to each example in the annotated format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExampleMetadata {
    pub task_id: Option<u64>,
    pub env: String,
    pub intent: String,
    pub num_actions: usize,
    /// States in the converted trajectory, including the page reached after
    /// its last action.
    pub num_observations: usize,
    pub token_count: usize,
    /// Number of actions in the prefix, for partial trajectories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_len: Option<usize>,
}

/// A chat-format fine-tuning example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub messages: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExampleMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(kind: &str, id: Option<&str>, text: &str) -> Action {
        Action {
            action_type: Some(kind.to_string()),
            element_id: id.map(str::to_string),
            raw_prediction: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_action_text_fallbacks() {
        let mut a = Action {
            answer: Some("done".into()),
            raw_prediction: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(a.text(), Some("done"));
        a.answer = None;
        assert_eq!(a.text(), None);
    }

    #[test]
    fn test_descriptor() {
        assert_eq!(action("CLICK", Some("42"), "x").descriptor(), "CLICK on element [42]");
        assert_eq!(action("SCROLL", Some(""), "x").descriptor(), "SCROLL");
        assert_eq!(Action::default().descriptor(), "Action");
        let untyped = Action {
            element_id: Some("7".into()),
            ..Default::default()
        };
        assert_eq!(untyped.descriptor(), "Action on element [7]");
    }

    #[test]
    fn test_well_formed() {
        let t = Trajectory::new(vec![
            Step::State(State::new("a")),
            Step::Action(action("CLICK", None, "go")),
            Step::State(State::new("b")),
        ]);
        assert!(t.is_well_formed());

        let bad = Trajectory::new(vec![
            Step::State(State::new("a")),
            Step::State(State::new("b")),
        ]);
        assert!(!bad.is_alternating());
        assert!(!bad.is_well_formed());
        assert!(!Trajectory::new(vec![Step::State(State::new("a"))]).is_well_formed());
    }

    #[test]
    fn test_pairs_skip_trailing_state_and_textless_actions() {
        let t = Trajectory::new(vec![
            Step::State(State::new("s0")),
            Step::Action(action("CLICK", Some("1"), "first")),
            Step::State(State::new("s1")),
            Step::Action(Action::default()),
            Step::State(State::new("s2")),
            Step::Action(action("STOP", None, "done")),
            Step::State(State::new("s3")),
        ]);
        let pairs = t.observation_action_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].state.observation, "s0");
        assert_eq!(pairs[0].text, "first");
        assert_eq!(pairs[1].state.observation, "s2");
        assert_eq!(pairs[1].text, "done");
    }

    #[test]
    fn test_task_success() {
        let mut info = TaskInfo::with_intent("x");
        assert!(!info.is_success());
        info.score = Some(1.0);
        assert!(info.is_success());
        info.success = Some(false);
        assert!(!info.is_success());
    }

    #[test]
    fn test_step_serde_tag() {
        let step = Step::Action(action("CLICK", Some("7"), "click it"));
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"], "action");
        let back: Step = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }
}
