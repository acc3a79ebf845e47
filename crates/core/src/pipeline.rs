//! Pipeline for turning trajectory files into fine-tuning examples.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backtrack::{flatten, validate_flattened};
use crate::caption::{caption_images, CaptionCache, Captioner};
use crate::error::{Error, Result};
use crate::loader::{
    bundle_entries, extract_trajectory, is_bundle, load_payload, InputSource, LoadedTrajectory,
    PickleDecoder, Sidecars,
};
use crate::sanitize::{postprocess_turns, trim_to_budget, SanitizeOptions};
use crate::trajectory::{ExampleMetadata, TaskInfo, TrainingExample, Turn};
use crate::turns::{
    build_candidates, filter_messages, intent_with_captions, TurnOptions, TurnReject,
};
use crate::{
    Tokenizer, DEFAULT_SYSTEM_PROMPT, MAX_FIELD_CHARS, MAX_PARTIAL_ACTIONS, MAX_TOKENS_PER_EXAMPLE,
};

/// Configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Environment name used in output file names and metadata.
    pub env_name: String,
    /// Reject final assistant turns that still read like backtracking.
    pub strict_mode: bool,
    /// Keep trajectories whose task did not succeed.
    pub lenient: bool,
    pub partial_trajectories: bool,
    pub max_partial_actions: usize,
    pub flatten_backtracks: bool,
    /// Run the text sanitizer over every turn.
    pub apply_filters: bool,
    pub max_tokens: usize,
    pub max_field_chars: usize,
    /// Tokenizer name or `tokenizer.json` path for exact token counts; token
    /// counts are estimated when unset.
    pub model: Option<String>,
    /// Stop once this many examples have been produced.
    pub max_samples: Option<usize>,
    /// Deterministically sample down to this many examples before writing.
    pub max_output_samples: Option<usize>,
    pub system_prompt: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            env_name: "gitlab".to_string(),
            strict_mode: true,
            lenient: false,
            partial_trajectories: false,
            max_partial_actions: MAX_PARTIAL_ACTIONS,
            flatten_backtracks: true,
            apply_filters: true,
            max_tokens: MAX_TOKENS_PER_EXAMPLE,
            max_field_chars: MAX_FIELD_CHARS,
            model: None,
            max_samples: None,
            max_output_samples: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Task ids to include or exclude.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub include: Option<BTreeSet<u64>>,
    pub exclude: BTreeSet<u64>,
}

impl TaskFilter {
    /// Read a JSON array of ids, numeric strings, or `{"task_id": ..}` objects.
    pub fn read_ids(path: &Path) -> Result<BTreeSet<u64>> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        let items = value
            .as_array()
            .ok_or_else(|| Error::format(path, "task list is not a JSON array"))?;
        Ok(items
            .iter()
            .filter_map(|item| {
                let id = item.get("task_id").unwrap_or(item);
                id.as_u64()
                    .or_else(|| id.as_str().and_then(|s| s.trim().parse().ok()))
            })
            .collect())
    }

    pub fn from_files(include: Option<&Path>, exclude: Option<&Path>) -> Result<Self> {
        Ok(Self {
            include: include.map(Self::read_ids).transpose()?,
            exclude: exclude.map(Self::read_ids).transpose()?.unwrap_or_default(),
        })
    }

    pub fn allows(&self, task_id: Option<u64>) -> bool {
        match task_id {
            Some(id) => {
                !self.exclude.contains(&id)
                    && self.include.as_ref().map_or(true, |set| set.contains(&id))
            }
            None => self.include.is_none(),
        }
    }
}

/// Why an input produced no examples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    LoadError,
    FormatError,
    NotSuccessful,
    FilteredTask,
    NoActions,
    NoObservations,
    InvalidAfterFlatten,
    CaptionFailed,
    NoValidExamples,
}

impl SkipReason {
    pub fn key(&self) -> &'static str {
        match self {
            SkipReason::LoadError => "load_error",
            SkipReason::FormatError => "format_error",
            SkipReason::NotSuccessful => "not_successful",
            SkipReason::FilteredTask => "filtered_task",
            SkipReason::NoActions => "no_actions",
            SkipReason::NoObservations => "no_observations",
            SkipReason::InvalidAfterFlatten => "invalid_after_flatten",
            SkipReason::CaptionFailed => "caption_failed",
            SkipReason::NoValidExamples => "no_valid_examples",
        }
    }

    fn from_error(err: &Error) -> Self {
        match err {
            Error::Format { .. } => SkipReason::FormatError,
            _ => SkipReason::LoadError,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A skipped input with the reason and a human-readable detail.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub source: String,
    pub task_id: Option<u64>,
    pub reason: SkipReason,
    pub detail: String,
}

/// Token statistics across the emitted examples.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenStats {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub avg: f64,
    pub total: usize,
}

impl TokenStats {
    pub fn record(&mut self, tokens: usize) {
        self.min = if self.count == 0 { tokens } else { self.min.min(tokens) };
        self.max = self.max.max(tokens);
        self.count += 1;
        self.total += tokens;
        self.avg = self.total as f64 / self.count as f64;
    }
}

/// Image captioning resources for one batch.
pub struct Captioning<'a> {
    pub cache: &'a mut CaptionCache,
    pub captioner: &'a dyn Captioner,
}

/// Result of processing all inputs.
#[derive(Debug, Default, Serialize)]
pub struct BatchResult {
    #[serde(skip)]
    pub examples: Vec<TrainingExample>,
    pub total_inputs: usize,
    pub converted_trajectories: usize,
    pub skipped: Vec<SkippedItem>,
    pub skip_reasons: BTreeMap<SkipReason, usize>,
    /// Rejected turn lists by [`TurnReject::key`]. In partial mode one
    /// trajectory can contribute several.
    pub turn_rejects: BTreeMap<&'static str, usize>,
    /// Actions whose type could not be decoded.
    pub untyped_actions: usize,
    pub token_stats: TokenStats,
}

impl BatchResult {
    fn skip(
        &mut self,
        source: &Path,
        task_id: Option<u64>,
        reason: SkipReason,
        detail: impl ToString,
    ) {
        let detail = detail.to_string();
        debug!(source = %source.display(), ?task_id, %reason, %detail, "skipping");
        *self.skip_reasons.entry(reason).or_insert(0) += 1;
        self.skipped.push(SkippedItem {
            source: source.display().to_string(),
            task_id,
            reason,
            detail,
        });
    }

    /// Skip counts keyed by their stable names.
    pub fn skip_counts(&self) -> BTreeMap<&'static str, usize> {
        self.skip_reasons.iter().map(|(r, n)| (r.key(), *n)).collect()
    }
}

/// Convert one loaded trajectory into examples.
///
/// Every rejected turn list is counted into `turn_rejects`, whether or not
/// the trajectory ends up producing examples.
pub fn process_trajectory<T: Tokenizer>(
    loaded: &LoadedTrajectory,
    info: &TaskInfo,
    tokenizer: &T,
    config: &PipelineConfig,
    captioning: Option<&mut Captioning<'_>>,
    turn_rejects: &mut BTreeMap<&'static str, usize>,
) -> std::result::Result<Vec<TrainingExample>, (SkipReason, String)> {
    if !config.lenient && !info.is_success() {
        return Err((SkipReason::NotSuccessful, format!("score {:?}", info.score)));
    }

    let raw = &loaded.trajectory;
    if raw.states().next().is_none() {
        return Err((SkipReason::NoObservations, "no states".into()));
    }

    let trajectory = if config.flatten_backtracks {
        let flat = flatten(raw);
        debug!(before = raw.len(), after = flat.len(), "flattened trajectory");
        flat
    } else {
        raw.clone()
    };
    if trajectory.actions().next().is_none() {
        return Err((SkipReason::NoActions, "no actions".into()));
    }
    if config.flatten_backtracks {
        validate_flattened(&trajectory.without_trailing_state())
            .map_err(|reject| (SkipReason::InvalidAfterFlatten, reject.to_string()))?;
    }

    let pairs = trajectory.observation_action_pairs();
    if pairs.is_empty() {
        return Err((SkipReason::NoActions, "no observation/action pairs".into()));
    }

    let intent = match captioning {
        Some(c) if !info.images.is_empty() => {
            let captions = caption_images(&info.images, c.cache, c.captioner)
                .map_err(|e| (SkipReason::CaptionFailed, e.to_string()))?;
            intent_with_captions(&info.intent, &captions)
        }
        _ => info.intent.clone(),
    };

    let opts = TurnOptions {
        system_prompt: &config.system_prompt,
        strict: config.strict_mode,
        partial: config.partial_trajectories,
        max_partial_actions: config.max_partial_actions,
    };
    let sanitize = SanitizeOptions {
        max_tokens: config.max_tokens,
        max_field_chars: config.max_field_chars,
    };

    let num_observations = trajectory.states().count();
    let mut reject = |why: TurnReject| {
        debug!(reject = %why, "turn list rejected");
        *turn_rejects.entry(why.key()).or_insert(0) += 1;
    };

    let mut examples = Vec::new();
    for candidate in build_candidates(&pairs, &intent, &opts) {
        let candidate = match candidate {
            Ok(c) => c,
            Err(r) => {
                reject(r);
                continue;
            }
        };
        let turns: Vec<Turn> = if config.apply_filters {
            match postprocess_turns(&candidate.turns, tokenizer, &sanitize) {
                Some(turns) => turns,
                None => {
                    reject(TurnReject::ErrorKeyword);
                    continue;
                }
            }
        } else {
            candidate.turns
        };
        let (turns, token_count) = trim_to_budget(turns, tokenizer, config.max_tokens);
        if let Err(r) = filter_messages(&turns, config.strict_mode) {
            reject(r);
            continue;
        }
        examples.push(TrainingExample {
            messages: turns,
            metadata: Some(ExampleMetadata {
                task_id: info.task_id,
                env: config.env_name.clone(),
                intent: info.intent.clone(),
                num_actions: candidate.num_actions,
                num_observations,
                token_count,
                partial_len: candidate.partial_len,
            }),
        });
    }

    if examples.is_empty() {
        return Err((SkipReason::NoValidExamples, "every turn list was rejected".into()));
    }
    Ok(examples)
}

/// Process all inputs sequentially, in the order given.
pub fn process_batch<D, T>(
    inputs: &[InputSource],
    decoder: &D,
    tokenizer: &T,
    config: &PipelineConfig,
    filter: &TaskFilter,
    mut captioning: Option<Captioning<'_>>,
) -> BatchResult
where
    D: PickleDecoder + ?Sized,
    T: Tokenizer,
{
    let mut result = BatchResult {
        total_inputs: inputs.len(),
        ..Default::default()
    };

    for (idx, input) in inputs.iter().enumerate() {
        if config.max_samples.is_some_and(|cap| result.examples.len() >= cap) {
            info!(cap = ?config.max_samples, "sample cap reached, stopping");
            break;
        }
        if input.task_id.is_some() && !filter.allows(input.task_id) {
            result.skip(&input.path, input.task_id, SkipReason::FilteredTask, "task filter");
            continue;
        }

        let payload = match load_payload(&input.path, decoder) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(path = %input.path.display(), error = %e, "failed to load");
                result.skip(&input.path, input.task_id, SkipReason::from_error(&e), e);
                continue;
            }
        };

        let entries: Vec<(Option<u64>, Result<LoadedTrajectory>)> = if is_bundle(&payload) {
            match bundle_entries(&input.path, &payload) {
                Ok(entries) => entries,
                Err(e) => {
                    result.skip(&input.path, input.task_id, SkipReason::from_error(&e), e);
                    continue;
                }
            }
        } else {
            vec![(input.task_id, extract_trajectory(&input.path, &payload))]
        };

        for (task_id, loaded) in entries {
            if !filter.allows(task_id) {
                result.skip(&input.path, task_id, SkipReason::FilteredTask, "task filter");
                continue;
            }
            let loaded = match loaded {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(path = %input.path.display(), ?task_id, error = %e, "unusable container");
                    result.skip(&input.path, task_id, SkipReason::from_error(&e), e);
                    continue;
                }
            };
            let untyped = loaded
                .trajectory
                .actions()
                .filter(|a| a.action_type.is_none())
                .count();
            if untyped > 0 {
                debug!(?task_id, untyped, "actions without a decodable type");
                result.untyped_actions += untyped;
            }
            let sidecars = Sidecars::resolve(&input.sidecar_dirs, task_id);
            let info = loaded.resolve_task_info(task_id, &sidecars);

            let converted = process_trajectory(
                &loaded,
                &info,
                tokenizer,
                config,
                captioning.as_mut(),
                &mut result.turn_rejects,
            );
            match converted {
                Ok(examples) => {
                    debug!(?task_id, count = examples.len(), "converted trajectory");
                    result.converted_trajectories += 1;
                    for example in examples {
                        if let Some(meta) = &example.metadata {
                            result.token_stats.record(meta.token_count);
                        }
                        result.examples.push(example);
                    }
                }
                Err((reason, detail)) => result.skip(&input.path, task_id, reason, detail),
            }
        }

        let done = idx + 1;
        if done % 100 == 0 || done == inputs.len() {
            info!("Processed {}/{} inputs...", done, inputs.len());
        }
    }

    if let Some(cap) = config.max_samples {
        result.examples.truncate(cap);
    }
    if let Some(cap) = config.max_output_samples {
        result.examples = sample_examples(std::mem::take(&mut result.examples), cap);
    }
    if let Some(c) = captioning.as_mut() {
        if let Err(e) = c.cache.flush() {
            warn!(error = %e, "failed to save caption cache");
        }
    }
    result
}

/// Deterministic shuffle by index hash, then keep the first `cap`.
pub fn sample_examples(examples: Vec<TrainingExample>, cap: usize) -> Vec<TrainingExample> {
    if examples.len() <= cap {
        return examples;
    }
    let mut indexed: Vec<_> = examples.into_iter().enumerate().collect();
    indexed.sort_by_key(|(i, _)| ((*i as u64 * 2654435761) % 1000, *i));
    indexed.into_iter().take(cap).map(|(_, e)| e).collect()
}

/// Files written by [`write_outputs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputPaths {
    pub json: PathBuf,
    pub jsonl: PathBuf,
    pub openai: PathBuf,
    pub summary: PathBuf,
}

impl OutputPaths {
    pub fn new(output_dir: &Path, env_name: &str) -> Self {
        Self {
            json: output_dir.join(format!("{}_training_data.json", env_name)),
            jsonl: output_dir.join(format!("{}_training_data.jsonl", env_name)),
            openai: output_dir.join(format!("openai_fine_tuning_{}.jsonl", env_name)),
            summary: output_dir.join(format!("{}_training_summary.json", env_name)),
        }
    }
}

#[derive(Serialize)]
struct MessagesOnly<'a> {
    messages: &'a [Turn],
}

/// Write examples as a JSON array, annotated JSONL, and messages-only JSONL.
pub fn write_outputs(
    examples: &[TrainingExample],
    output_dir: &Path,
    env_name: &str,
) -> Result<OutputPaths> {
    std::fs::create_dir_all(output_dir)?;
    let paths = OutputPaths::new(output_dir, env_name);

    let mut json_file = BufWriter::new(File::create(&paths.json)?);
    serde_json::to_writer_pretty(&mut json_file, examples)?;
    json_file.flush()?;

    let mut jsonl_file = BufWriter::new(File::create(&paths.jsonl)?);
    let mut openai_file = BufWriter::new(File::create(&paths.openai)?);
    for example in examples {
        writeln!(jsonl_file, "{}", serde_json::to_string(example)?)?;
        let record = MessagesOnly {
            messages: &example.messages,
        };
        writeln!(openai_file, "{}", serde_json::to_string(&record)?)?;
    }
    jsonl_file.flush()?;
    openai_file.flush()?;

    info!(count = examples.len(), dir = %output_dir.display(), "wrote training data");
    Ok(paths)
}

/// Read back either JSONL format written by [`write_outputs`].
pub fn read_jsonl(path: &Path) -> Result<Vec<TrainingExample>> {
    let reader = BufReader::new(File::open(path)?);
    let mut examples = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let example = serde_json::from_str(&line)
            .map_err(|e| Error::format(path, format!("line {}: {}", lineno + 1, e)))?;
        examples.push(example);
    }
    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{ImageRef, Role};
    use crate::CharApproxTokenizer;
    use serde_json::json;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn steps(n: usize, backtrack_at: Option<usize>) -> Value {
        let mut items = Vec::new();
        for i in 0..n {
            items.push(json!({"observation": {"text": format!("[{}] link 'Page {}'", i, i)}}));
            let text = if Some(i) == backtrack_at {
                "We should take a step back.".to_string()
            } else {
                format!("click [{}]", i)
            };
            items.push(json!({
                "action_type": "CLICK",
                "element_id": i.to_string(),
                "raw_prediction": text,
            }));
        }
        items.push(json!({"observation": {"text": "final page"}}));
        Value::Array(items)
    }

    fn write_task(dir: &Path, id: u64, body: &Value) -> InputSource {
        let path = dir.join(format!("task_{}.json", id));
        std::fs::write(&path, body.to_string()).unwrap();
        InputSource {
            path,
            task_id: Some(id),
            sidecar_dirs: vec![dir.to_path_buf()],
        }
    }

    fn run(inputs: &[InputSource], config: &PipelineConfig) -> BatchResult {
        process_batch(
            inputs,
            &crate::NativePickleDecoder,
            &CharApproxTokenizer,
            config,
            &TaskFilter::default(),
            None,
        )
    }

    #[test]
    fn test_config_defaults_and_partial_file() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_tokens, 16_000);
        assert!(config.strict_mode);
        assert!(!config.lenient);
        assert_eq!(config.model, None);

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"env_name": "shopping", "lenient": true, "model": "Qwen/Qwen2.5-7B-Instruct"}"#,
        )
        .unwrap();
        let loaded = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.env_name, "shopping");
        assert_eq!(loaded.model.as_deref(), Some("Qwen/Qwen2.5-7B-Instruct"));
        assert!(loaded.lenient);
        assert_eq!(loaded.max_field_chars, 12_000);
    }

    #[test]
    fn test_successful_trajectory_converts() {
        let temp = TempDir::new().unwrap();
        let body = json!({
            "trajectory": steps(3, Some(1)),
            "task_info": {"intent": "Open page 2"},
            "score": 1.0,
        });
        let input = write_task(temp.path(), 4, &body);

        let result = run(&[input], &PipelineConfig::default());
        assert_eq!(result.examples.len(), 1);
        assert_eq!(result.converted_trajectories, 1);

        let example = &result.examples[0];
        assert_eq!(example.messages[0].role, Role::System);
        assert!(example.messages[1].content.starts_with("Task: Open page 2"));
        assert!(example
            .messages
            .iter()
            .all(|t| !t.content.contains("step back")));
        let meta = example.metadata.as_ref().unwrap();
        assert_eq!(meta.task_id, Some(4));
        assert_eq!(meta.num_actions, 2);
        assert_eq!(meta.num_observations, 3);
        assert_eq!(result.token_stats.count, 1);
        assert!(result.turn_rejects.is_empty());
        assert_eq!(result.untyped_actions, 0);
    }

    #[test]
    fn test_unsuccessful_skipped_unless_lenient() {
        let temp = TempDir::new().unwrap();
        let body = json!({"trajectory": steps(2, None), "score": 0.0});
        let input = write_task(temp.path(), 1, &body);

        let strict = run(&[input.clone()], &PipelineConfig::default());
        assert!(strict.examples.is_empty());
        assert_eq!(strict.skip_counts().get("not_successful"), Some(&1));

        let lenient = run(
            &[input],
            &PipelineConfig {
                lenient: true,
                ..Default::default()
            },
        );
        assert_eq!(lenient.examples.len(), 1);
        assert_eq!(lenient.examples[0].metadata.as_ref().unwrap().intent, crate::NO_INTENT);
    }

    #[test]
    fn test_bad_files_are_tallied_not_fatal() {
        let temp = TempDir::new().unwrap();
        let corrupt = temp.path().join("task_1.pkl.xz");
        std::fs::write(&corrupt, b"garbage").unwrap();
        let inputs = vec![
            InputSource {
                path: corrupt,
                task_id: Some(1),
                sidecar_dirs: vec![],
            },
            write_task(temp.path(), 2, &json!({"unrelated": 1})),
            write_task(temp.path(), 3, &json!({"trajectory": steps(2, None), "score": 1})),
        ];
        let result = run(&inputs, &PipelineConfig::default());
        assert_eq!(result.examples.len(), 1);
        let counts = result.skip_counts();
        assert_eq!(counts.get("load_error"), Some(&1));
        assert_eq!(counts.get("format_error"), Some(&1));
        assert_eq!(result.skipped.len(), 2);
    }

    #[test]
    fn test_partial_mode_and_output_cap() {
        let temp = TempDir::new().unwrap();
        let input = write_task(temp.path(), 7, &json!({"trajectory": steps(10, None), "score": 1}));
        let config = PipelineConfig {
            partial_trajectories: true,
            ..Default::default()
        };
        let result = run(&[input.clone()], &config);
        assert_eq!(result.examples.len(), 8);

        let capped = run(
            &[input],
            &PipelineConfig {
                max_output_samples: Some(3),
                ..config
            },
        );
        assert_eq!(capped.examples.len(), 3);
        let lens: BTreeSet<_> = capped
            .examples
            .iter()
            .map(|e| e.metadata.as_ref().unwrap().partial_len)
            .collect();
        assert_eq!(lens.len(), 3);
    }

    #[test]
    fn test_task_filter() {
        let temp = TempDir::new().unwrap();
        let ids = temp.path().join("ids.json");
        std::fs::write(&ids, r#"[1, "2", {"task_id": 3}]"#).unwrap();
        let filter = TaskFilter::from_files(None, Some(&ids)).unwrap();
        assert!(!filter.allows(Some(2)));
        assert!(filter.allows(Some(4)));
        assert!(filter.allows(None));

        let include = TaskFilter::from_files(Some(&ids), None).unwrap();
        assert!(include.allows(Some(3)));
        assert!(!include.allows(Some(4)));
        assert!(!include.allows(None));
    }

    #[test]
    fn test_write_and_read_back() {
        let temp = TempDir::new().unwrap();
        let input = write_task(temp.path(), 9, &json!({"trajectory": steps(2, None), "score": 1}));
        let result = run(&[input], &PipelineConfig::default());

        let out = temp.path().join("out");
        let paths = write_outputs(&result.examples, &out, "gitlab").unwrap();
        assert!(paths.json.ends_with("gitlab_training_data.json"));
        assert!(paths.openai.ends_with("openai_fine_tuning_gitlab.jsonl"));

        let annotated = read_jsonl(&paths.jsonl).unwrap();
        assert_eq!(annotated, result.examples);

        let plain = read_jsonl(&paths.openai).unwrap();
        assert_eq!(plain.len(), 1);
        assert!(plain[0].metadata.is_none());
        assert_eq!(plain[0].messages, result.examples[0].messages);
    }

    #[test]
    fn test_caption_failure_skips_item() {
        struct Failing(Cell<usize>);
        impl Captioner for Failing {
            fn caption(&self, _image: &[u8]) -> Result<String> {
                self.0.set(self.0.get() + 1);
                Err(Error::ExternalCall("timeout".into()))
            }
        }

        let loaded = LoadedTrajectory {
            trajectory: crate::loader::decode_steps(steps(2, None).as_array().unwrap()),
            ..Default::default()
        };
        let info = TaskInfo {
            intent: "buy".into(),
            images: vec![ImageRef::Inline(vec![1, 2])],
            success: Some(true),
            ..Default::default()
        };
        let captioner = Failing(Cell::new(0));
        let mut cache = CaptionCache::in_memory();
        let mut captioning = Captioning {
            cache: &mut cache,
            captioner: &captioner,
        };
        let err = process_trajectory(
            &loaded,
            &info,
            &CharApproxTokenizer,
            &PipelineConfig::default(),
            Some(&mut captioning),
            &mut BTreeMap::new(),
        )
        .unwrap_err();
        assert_eq!(err.0, SkipReason::CaptionFailed);
        assert_eq!(captioner.0.get(), 1);
    }

    #[test]
    fn test_kept_backtracks_without_flattening() {
        let temp = TempDir::new().unwrap();
        let body = json!({"trajectory": steps(3, Some(1)), "score": 1});
        let input = write_task(temp.path(), 5, &body);
        let config = PipelineConfig {
            flatten_backtracks: false,
            ..Default::default()
        };

        let result = run(&[input], &config);
        assert_eq!(result.examples.len(), 1);
        let example = &result.examples[0];
        let meta = example.metadata.as_ref().unwrap();
        assert_eq!(meta.num_actions, 3);
        assert_eq!(meta.num_observations, 4);
        assert!(example
            .messages
            .iter()
            .any(|t| t.role == Role::Assistant && t.content.contains("step back")));
        assert_eq!(example.messages.last().unwrap().content, "click [2]");
    }

    #[test]
    fn test_ungrounded_final_action_is_invalid_after_flatten() {
        let temp = TempDir::new().unwrap();
        let body = json!({
            "trajectory": [
                {"observation": {"text": "[1] link 'Home'"}},
                {"action_type": "CLICK", "element_id": "9", "raw_prediction": "click [9]"},
                {"observation": {"text": "done"}},
            ],
            "score": 1,
        });
        let input = write_task(temp.path(), 6, &body);

        let result = run(&[input.clone()], &PipelineConfig::default());
        assert!(result.examples.is_empty());
        assert_eq!(result.skip_counts().get("invalid_after_flatten"), Some(&1));
        assert!(result.skipped[0].detail.contains("element id 9"));

        let unflattened = run(
            &[input],
            &PipelineConfig {
                flatten_backtracks: false,
                ..Default::default()
            },
        );
        assert_eq!(unflattened.examples.len(), 1);
        assert!(unflattened.skipped.is_empty());
    }

    #[test]
    fn test_max_samples_stops_early() {
        let temp = TempDir::new().unwrap();
        let inputs: Vec<_> = (1..=3)
            .map(|id| {
                let body = json!({"trajectory": steps(2, None), "score": 1});
                write_task(temp.path(), id, &body)
            })
            .collect();
        let config = PipelineConfig {
            max_samples: Some(1),
            ..Default::default()
        };

        let result = run(&inputs, &config);
        assert_eq!(result.examples.len(), 1);
        assert_eq!(result.converted_trajectories, 1);
        assert_eq!(result.total_inputs, 3);
        assert!(result.skipped.is_empty());
        assert_eq!(result.examples[0].metadata.as_ref().unwrap().task_id, Some(1));
    }

    #[test]
    fn test_filters_toggle_sanitizer() {
        let temp = TempDir::new().unwrap();
        let body = json!({
            "trajectory": [
                {"observation": {"text": "[3] link 'Docs' https://gitlab.example.com/help"}},
                {"action_type": "CLICK", "element_id": "3", "raw_prediction": "click [3]"},
            ],
            "score": 1,
        });
        let input = write_task(temp.path(), 8, &body);
        let observation = |result: &BatchResult| result.examples[0].messages[1].content.clone();

        let filtered = run(&[input.clone()], &PipelineConfig::default());
        assert!(observation(&filtered).contains("[URL]"));
        assert!(!observation(&filtered).contains("https://"));

        let raw = run(
            &[input],
            &PipelineConfig {
                apply_filters: false,
                ..Default::default()
            },
        );
        assert!(observation(&raw).contains("https://gitlab.example.com/help"));
        assert!(!observation(&raw).contains("[URL]"));
    }

    #[test]
    fn test_partial_prefix_rejections_are_tallied() {
        let temp = TempDir::new().unwrap();
        let body = json!({"trajectory": steps(3, Some(1)), "score": 1});
        let input = write_task(temp.path(), 12, &body);
        let config = PipelineConfig {
            partial_trajectories: true,
            flatten_backtracks: false,
            ..Default::default()
        };

        let result = run(&[input], &config);
        assert_eq!(result.examples.len(), 2);
        assert_eq!(result.converted_trajectories, 1);
        assert_eq!(result.turn_rejects.get("backtracking"), Some(&1));
        assert_eq!(result.turn_rejects.len(), 1);
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn test_untyped_actions_are_counted() {
        let temp = TempDir::new().unwrap();
        let body = json!({
            "trajectory": [
                {"observation": {"text": "[2] button 'Save'"}},
                {"action_type": null, "element_id": "2", "raw_prediction": "Saving now."},
            ],
            "score": 1,
        });
        let input = write_task(temp.path(), 13, &body);

        let result = run(&[input], &PipelineConfig::default());
        assert_eq!(result.untyped_actions, 1);
        assert_eq!(result.examples.len(), 1);
    }

    #[test]
    fn test_sample_examples_is_deterministic() {
        let make = |n: usize| -> Vec<TrainingExample> {
            (0..n)
                .map(|i| TrainingExample {
                    messages: vec![Turn::assistant(i.to_string())],
                    metadata: None,
                })
                .collect()
        };
        let a = sample_examples(make(20), 5);
        let b = sample_examples(make(20), 5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert_eq!(sample_examples(make(3), 5).len(), 3);
    }
}
