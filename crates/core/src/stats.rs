//! Read-only statistics over trajectories, performance records, and
//! processed training files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backtrack::{classify, flatten, validate_flattened};
use crate::error::Result;
use crate::loader::{
    bundle_entries, extract_trajectory, is_bundle, load_payload, InputSource, PerformanceRecord,
    PickleDecoder, Sidecars,
};
use crate::pipeline::read_jsonl;
use crate::trajectory::{Direction, Role, TaskInfo, Trajectory};
use crate::turns::contains_backtrack_indicator;

/// Shape and content counts for one trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrajectoryStats {
    pub total_steps: usize,
    pub states: usize,
    pub actions: usize,
    pub forward: usize,
    pub backtrack: usize,
    pub alternating: bool,
    pub starts_with_state: bool,
    pub flattened_len: usize,
    pub flattened_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flatten_reject: Option<String>,
    pub action_types: BTreeMap<String, usize>,
}

pub fn analyze_trajectory(trajectory: &Trajectory) -> TrajectoryStats {
    let mut stats = TrajectoryStats {
        total_steps: trajectory.len(),
        states: trajectory.states().count(),
        alternating: trajectory.is_alternating(),
        starts_with_state: trajectory.starts_with_state(),
        ..Default::default()
    };
    for action in trajectory.actions() {
        stats.actions += 1;
        match classify(action) {
            Direction::Forward => stats.forward += 1,
            Direction::Backtrack => stats.backtrack += 1,
        }
        let kind = action.action_type.clone().unwrap_or_else(|| "unknown".to_string());
        *stats.action_types.entry(kind).or_insert(0) += 1;
    }

    let flat = flatten(trajectory);
    stats.flattened_len = flat.len();
    match validate_flattened(&flat.without_trailing_state()) {
        Ok(()) => stats.flattened_valid = true,
        Err(reject) => stats.flatten_reject = Some(reject.to_string()),
    }
    stats
}

/// Mean, min and max of a count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CountSummary {
    pub mean: f64,
    pub min: usize,
    pub max: usize,
}

impl CountSummary {
    /// Summary after adding `value`, given the running `sum` of `total` values.
    fn with(summary: Option<Self>, value: usize, sum: usize, total: usize) -> Self {
        let mean = sum as f64 / total as f64;
        match summary {
            Some(s) => Self {
                mean,
                min: s.min.min(value),
                max: s.max.max(value),
            },
            None => Self {
                mean,
                min: value,
                max: value,
            },
        }
    }
}

/// Per-task line of a [`BatchReport`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task_id: Option<u64>,
    pub source: String,
    pub success: bool,
    pub score: Option<f64>,
    pub intent: String,
    #[serde(flatten)]
    pub stats: TrajectoryStats,
}

/// Aggregate statistics over a batch of trajectories.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage of tasks that succeeded.
    pub success_rate: f64,
    pub action_counts: Option<CountSummary>,
    pub action_types: BTreeMap<String, usize>,
    /// Number of tasks per count of backtracking actions.
    pub backtrack_histogram: BTreeMap<usize, usize>,
    pub all_backtrack_tasks: Vec<Option<u64>>,
    pub no_backtrack_tasks: Vec<Option<u64>>,
    pub invalid_after_flatten: usize,
    pub errors: Vec<(String, String)>,
    pub tasks: Vec<TaskDetail>,
    #[serde(skip)]
    action_sum: usize,
}

impl BatchReport {
    pub fn add(&mut self, source: &Path, info: &TaskInfo, stats: TrajectoryStats) {
        let success = info.is_success();
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.success_rate = self.successful as f64 / self.total as f64 * 100.0;
        self.action_sum += stats.actions;
        self.action_counts = Some(CountSummary::with(
            self.action_counts,
            stats.actions,
            self.action_sum,
            self.total,
        ));
        for (kind, n) in &stats.action_types {
            *self.action_types.entry(kind.clone()).or_insert(0) += n;
        }
        *self.backtrack_histogram.entry(stats.backtrack).or_insert(0) += 1;
        if stats.actions > 0 && stats.backtrack == stats.actions {
            self.all_backtrack_tasks.push(info.task_id);
        }
        if stats.backtrack == 0 {
            self.no_backtrack_tasks.push(info.task_id);
        }
        if !stats.flattened_valid {
            self.invalid_after_flatten += 1;
        }
        self.tasks.push(TaskDetail {
            task_id: info.task_id,
            source: source.display().to_string(),
            success,
            score: info.score,
            intent: info.intent.clone(),
            stats,
        });
    }

    pub fn record_error(&mut self, source: &Path, error: impl ToString) {
        self.errors.push((source.display().to_string(), error.to_string()));
    }
}

/// Load every input and build a report, logging and recording bad files.
pub fn analyze_inputs<D: PickleDecoder + ?Sized>(
    inputs: &[InputSource],
    decoder: &D,
) -> BatchReport {
    let mut report = BatchReport::default();
    for input in inputs {
        let payload = match load_payload(&input.path, decoder) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %input.path.display(), error = %e, "failed to load");
                report.record_error(&input.path, e);
                continue;
            }
        };
        let entries = if is_bundle(&payload) {
            match bundle_entries(&input.path, &payload) {
                Ok(entries) => entries,
                Err(e) => {
                    report.record_error(&input.path, e);
                    continue;
                }
            }
        } else {
            vec![(input.task_id, extract_trajectory(&input.path, &payload))]
        };
        for (task_id, loaded) in entries {
            match loaded {
                Ok(loaded) => {
                    let sidecars = Sidecars::resolve(&input.sidecar_dirs, task_id);
                    let info = loaded.resolve_task_info(task_id, &sidecars);
                    report.add(&input.path, &info, analyze_trajectory(&loaded.trajectory));
                }
                Err(e) => report.record_error(&input.path, e),
            }
        }
    }
    report
}

/// Success summary over a directory of `performance_<id>.json` files.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceReport {
    pub total: usize,
    pub successful: usize,
    pub success_rate: f64,
    /// Successful task ids with the indicators that marked them.
    pub successful_tasks: BTreeMap<u64, Vec<String>>,
    pub times: Option<f64>,
    pub errors: Vec<(String, String)>,
}

/// Scan `dir` recursively for performance records and tally success.
pub fn analyze_performance_dir(dir: &Path) -> Result<PerformanceReport> {
    if !dir.is_dir() {
        return Err(crate::Error::load(dir, "not a directory"));
    }
    let mut report = PerformanceReport::default();
    let mut total_time = 0.0;
    let mut timed = 0usize;

    let files = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with("performance_") && n.ends_with(".json"))
        });

    for entry in files {
        let path = entry.path();
        let record = match PerformanceRecord::read(path) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable performance file");
                report.errors.push((path.display().to_string(), e.to_string()));
                continue;
            }
        };
        report.total += 1;
        if let Some(t) = record.time() {
            total_time += t;
            timed += 1;
        }
        if record.is_success() {
            report.successful += 1;
            let name = entry.file_name().to_string_lossy();
            match crate::task_id_from_name(&name) {
                Some(id) => {
                    report.successful_tasks.insert(id, record.reasons());
                }
                None => debug!(file = %name, "successful record without a task id"),
            }
        }
    }

    if report.total > 0 {
        report.success_rate = report.successful as f64 / report.total as f64 * 100.0;
    }
    if timed > 0 {
        report.times = Some(total_time / timed as f64);
    }
    Ok(report)
}

/// Backtracking residue in an already processed training file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessedReport {
    pub examples: usize,
    pub assistant_turns: usize,
    pub examples_with_backtracking: usize,
    /// Number of examples per count of backtracking assistant turns.
    pub backtrack_histogram: BTreeMap<usize, usize>,
}

pub fn analyze_processed_file(path: &Path) -> Result<ProcessedReport> {
    let examples = read_jsonl(path)?;
    let mut report = ProcessedReport {
        examples: examples.len(),
        ..Default::default()
    };
    for example in &examples {
        let assistant: Vec<_> = example
            .messages
            .iter()
            .filter(|t| t.role == Role::Assistant)
            .collect();
        report.assistant_turns += assistant.len();
        let backtracks = assistant
            .iter()
            .filter(|t| contains_backtrack_indicator(&t.content))
            .count();
        if backtracks > 0 {
            report.examples_with_backtracking += 1;
        }
        *report.backtrack_histogram.entry(backtracks).or_insert(0) += 1;
    }
    Ok(report)
}
