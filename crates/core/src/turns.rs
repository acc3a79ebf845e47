//! Turn builder: converts paired observations and actions into chat turns.

use std::fmt;

use crate::trajectory::{Role, StepPair, Turn};

/// Phrases in a final assistant turn that mark a failed grounding.
pub const ERROR_KEYWORDS: &[&str] = &[
    "no matching element found",
    "element not found",
    "could not find element",
    "element not visible",
    "no such element",
];

/// Phrases that mark a backtracking label, rejected in strict mode.
pub const BACKTRACK_INDICATORS: &[&str] =
    &["go_back", "take a step back", "try a different approach"];

pub fn contains_error_keyword(content: &str) -> bool {
    let lower = content.to_lowercase();
    ERROR_KEYWORDS.iter().any(|k| lower.contains(k))
}

pub fn contains_backtrack_indicator(content: &str) -> bool {
    let lower = content.to_lowercase();
    BACKTRACK_INDICATORS.iter().any(|k| lower.contains(k))
}

/// Options controlling how turn lists are produced.
#[derive(Debug, Clone)]
pub struct TurnOptions<'a> {
    pub system_prompt: &'a str,
    pub strict: bool,
    /// Emit one list per action prefix instead of a single full list.
    pub partial: bool,
    pub max_partial_actions: usize,
}

/// A turn list that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub turns: Vec<Turn>,
    pub num_actions: usize,
    /// Prefix length when produced in partial mode.
    pub partial_len: Option<usize>,
}

/// Why a turn list was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnReject {
    TooFewTurns,
    RepeatedRole,
    LastNotAssistant,
    EmptyFinal,
    ErrorKeyword,
    Backtracking,
}

impl TurnReject {
    pub fn key(&self) -> &'static str {
        match self {
            TurnReject::TooFewTurns => "too_few_turns",
            TurnReject::RepeatedRole => "repeated_role",
            TurnReject::LastNotAssistant => "last_not_assistant",
            TurnReject::EmptyFinal => "empty_final",
            TurnReject::ErrorKeyword => "error_keyword",
            TurnReject::Backtracking => "backtracking",
        }
    }
}

impl fmt::Display for TurnReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Prefix the intent with captions of the task's input images.
pub fn intent_with_captions(intent: &str, captions: &[String]) -> String {
    if captions.is_empty() {
        return intent.to_string();
    }
    let mut prefix = String::new();
    for (i, caption) in captions.iter().enumerate() {
        let label = if i == 0 { "Input" } else { "input" };
        prefix.push_str(&format!("{} image {}: \"{}\"", label, i + 1, caption));
        if captions.len() > 1 {
            prefix.push_str(", ");
        }
    }
    format!("{}\nIntent: {}", prefix, intent)
}

/// Build the full turn list for the given pairs.
///
/// The list opens with the system turn and the task, then alternates
/// assistant labels with the observation that followed each of them.
pub fn build_turns(pairs: &[StepPair<'_>], intent: &str, system_prompt: &str) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(2 + 2 * pairs.len());
    turns.push(Turn::system(system_prompt));

    let Some(first) = pairs.first() else {
        return turns;
    };

    let mut history = vec!["None".to_string()];
    let mut initial = format!("Task: {}\n\n", intent);
    if !first.state.observation.is_empty() {
        initial.push_str(&format!("Current webpage:\n{}\n\n", first.state.observation));
    }
    initial.push_str(&format!("Action history: {}", history.join(", ")));
    turns.push(Turn::user(initial));
    turns.push(Turn::assistant(first.text));
    history.push(first.action.descriptor());

    for pair in &pairs[1..] {
        turns.push(Turn::user(format!(
            "Current webpage:\n{}\n\nAction history: {}",
            pair.state.observation,
            history.join(", ")
        )));
        turns.push(Turn::assistant(pair.text));
        history.push(pair.action.descriptor());
    }
    turns
}

/// Build and validate the turn lists for one trajectory.
pub fn build_candidates(
    pairs: &[StepPair<'_>],
    intent: &str,
    opts: &TurnOptions<'_>,
) -> Vec<Result<Candidate, TurnReject>> {
    let validate = |turns: Vec<Turn>, num_actions: usize, partial_len: Option<usize>| {
        filter_messages(&turns, opts.strict).map(|()| Candidate {
            turns,
            num_actions,
            partial_len,
        })
    };

    if opts.partial {
        let limit = pairs.len().min(opts.max_partial_actions);
        (1..=limit)
            .map(|end| {
                let turns = build_turns(&pairs[..end], intent, opts.system_prompt);
                validate(turns, end, Some(end))
            })
            .collect()
    } else {
        vec![validate(
            build_turns(pairs, intent, opts.system_prompt),
            pairs.len(),
            None,
        )]
    }
}

/// Quality gate applied to every turn list before it is emitted.
pub fn filter_messages(turns: &[Turn], strict: bool) -> Result<(), TurnReject> {
    if turns.len() < 3 {
        return Err(TurnReject::TooFewTurns);
    }
    if turns.windows(2).any(|w| w[0].role == w[1].role) {
        return Err(TurnReject::RepeatedRole);
    }
    let last = &turns[turns.len() - 1];
    if last.role != Role::Assistant {
        return Err(TurnReject::LastNotAssistant);
    }
    if last.content.trim().is_empty() {
        return Err(TurnReject::EmptyFinal);
    }
    if contains_error_keyword(&last.content) {
        return Err(TurnReject::ErrorKeyword);
    }
    if strict && contains_backtrack_indicator(&last.content) {
        return Err(TurnReject::Backtracking);
    }
    Ok(())
}
