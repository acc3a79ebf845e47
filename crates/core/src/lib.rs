//! Core serialization logic for recorded web-agent trajectories.
//!
//! This crate loads trajectories (alternating webpage states and agent
//! actions) from pickled or JSON containers, strips backtracking actions,
//! and turns what remains into chat-format examples suitable for supervised
//! fine-tuning. It also provides read-only statistics over the same inputs.

/// Trait for tokenization operations.
///
/// Implementors provide token counting and truncation capabilities.
/// For exact budgets, use a real tokenizer.
/// For approximate budgets, use character-based estimation.
pub trait Tokenizer {
    /// Count the number of tokens in the given text.
    fn count_tokens(&self, text: &str) -> usize;

    /// Truncate text to at most `max_tokens` tokens.
    /// Returns the truncated text.
    fn truncate_to_max_tokens(&self, text: &str, max_tokens: usize) -> String;
}

// Blanket implementation for references to Tokenizers
impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn count_tokens(&self, text: &str) -> usize {
        (*self).count_tokens(text)
    }

    fn truncate_to_max_tokens(&self, text: &str, max_tokens: usize) -> String {
        (*self).truncate_to_max_tokens(text, max_tokens)
    }
}

/// Character-based approximate tokenizer (~4 chars per token).
///
/// Used whenever no exact tokenizer was requested or could be loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharApproxTokenizer;

impl Tokenizer for CharApproxTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count() / CHARS_PER_TOKEN
    }

    fn truncate_to_max_tokens(&self, text: &str, max_tokens: usize) -> String {
        text.chars().take(max_tokens * CHARS_PER_TOKEN).collect()
    }
}

pub mod backtrack;
pub mod caption;
mod error;
pub mod loader;
pub mod pipeline;
pub mod sanitize;
pub mod stats;
pub mod trajectory;
pub mod turns;

pub use backtrack::{classify, flatten, validate_flattened, FlattenReject};
pub use caption::{CaptionCache, Captioner};
pub use error::{Error, Result};
pub use loader::{
    discover_inputs, load_bundle, load_trajectory_file, task_id_from_name, InputSource,
    LoadedTrajectory, NativePickleDecoder, PickleDecoder,
};
pub use pipeline::{
    process_batch, read_jsonl, write_outputs, BatchResult, OutputPaths, PipelineConfig,
    SkipReason, TaskFilter, TokenStats,
};
pub use sanitize::{postprocess_turns, trim_to_budget};
pub use stats::{analyze_performance_dir, analyze_processed_file, analyze_trajectory, BatchReport};
pub use trajectory::{
    Action, Direction, ExampleMetadata, ImageRef, Role, State, Step, TaskInfo, TrainingExample,
    Trajectory, Turn,
};
pub use turns::{build_turns, filter_messages, TurnReject};

/// Characters per token assumed by [`CharApproxTokenizer`].
pub const CHARS_PER_TOKEN: usize = 4;

/// Default total token budget per training example.
pub const MAX_TOKENS_PER_EXAMPLE: usize = 16_000;

/// Default cap on the characters of any single turn field.
pub const MAX_FIELD_CHARS: usize = 12_000;

/// Default cap on the number of actions in a partial trajectory.
pub const MAX_PARTIAL_ACTIONS: usize = 8;

/// Intent used when neither the container nor a sidecar provides one.
pub const NO_INTENT: &str = "No intent available";

/// Fixed instruction preamble used as the `system` turn.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful web assistant that completes tasks \
in a web browser. You will be given a task to complete and observations of the current webpage. \
Your goal is to complete the task by taking the most appropriate action.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_approx_tokenizer() {
        let tok = CharApproxTokenizer;
        assert_eq!(tok.count_tokens("abcdefgh"), 2);
        assert_eq!(tok.count_tokens("abc"), 0);
        // counts characters, not bytes
        assert_eq!(tok.count_tokens("ééééé"), 1);
        assert_eq!(tok.truncate_to_max_tokens("abcdefghij", 2), "abcdefgh");
    }

    #[test]
    fn test_tokenizer_through_reference() {
        fn count<T: Tokenizer>(t: T) -> usize {
            t.count_tokens("12345678")
        }
        let tok = CharApproxTokenizer;
        assert_eq!(count(&tok), 2);
    }
}
