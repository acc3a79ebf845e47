//! Loading trajectories from pickled or JSON containers.
//!
//! Every payload is first decoded into a `serde_json::Value` tree, then steps
//! are discriminated structurally into [`Step::State`] / [`Step::Action`]
//! exactly once. Nothing downstream inspects raw payloads again.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::trajectory::{Action, Direction, ImageRef, State, Step, TaskInfo, Trajectory};
use crate::NO_INTENT;

/// Keys whose presence marks a mapping as an action record.
const ACTION_KEYS: &[&str] = &["action_type", "raw_prediction", "answer"];

/// File names that sit next to trajectories but are not trajectories.
const SIDECAR_PREFIXES: &[&str] = &["performance_", "config", "task_info_", "caption_cache"];

/// Shorter strings are always treated as paths, even if they happen to be valid base64.
const MIN_INLINE_IMAGE_LEN: usize = 64;

type DecodeError = Box<dyn std::error::Error + Send + Sync>;

/// Turns raw pickle bytes into a JSON-like value tree.
pub trait PickleDecoder {
    fn decode(&self, bytes: &[u8]) -> std::result::Result<Value, DecodeError>;
}

impl<T: PickleDecoder + ?Sized> PickleDecoder for &T {
    fn decode(&self, bytes: &[u8]) -> std::result::Result<Value, DecodeError> {
        (*self).decode(bytes)
    }
}

/// Pure-Rust pickle decoding.
///
/// Globals that cannot be resolved (custom classes) decode as `None`, so
/// pickles of arbitrary Python objects lose those objects. Pickles of plain
/// lists and dicts decode fully.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePickleDecoder;

impl PickleDecoder for NativePickleDecoder {
    fn decode(&self, bytes: &[u8]) -> std::result::Result<Value, DecodeError> {
        let options = serde_pickle::DeOptions::new().replace_unresolved_globals();
        let value = serde_pickle::value_from_slice(bytes, options)?;
        Ok(pickle_to_json(value))
    }
}

fn pickle_key(key: serde_pickle::HashableValue) -> String {
    match key {
        serde_pickle::HashableValue::String(s) => s,
        other => match pickle_to_json(other.into_value()) {
            Value::String(s) => s,
            v => v.to_string(),
        },
    }
}

/// Convert a decoded pickle value into the equivalent JSON value.
///
/// Byte strings become `data:` URIs so image payloads survive the trip.
pub fn pickle_to_json(value: serde_pickle::Value) -> Value {
    use serde_pickle::Value as P;
    match value {
        P::None => Value::Null,
        P::Bool(b) => Value::Bool(b),
        P::I64(i) => Value::from(i),
        P::Int(big) => {
            let text = big.to_string();
            text.parse::<u64>()
                .map(Value::from)
                .unwrap_or(Value::String(text))
        }
        P::F64(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        P::Bytes(bytes) => Value::String(format!(
            "data:application/octet-stream;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )),
        P::String(s) => Value::String(s),
        P::List(items) | P::Tuple(items) => {
            Value::Array(items.into_iter().map(pickle_to_json).collect())
        }
        P::Set(items) | P::FrozenSet(items) => Value::Array(
            items
                .into_iter()
                .map(|h| pickle_to_json(h.into_value()))
                .collect(),
        ),
        P::Dict(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (pickle_key(k), pickle_to_json(v)))
                .collect(),
        ),
    }
}

/// Container encoding, inferred from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Pickle { compressed: bool },
    Json { compressed: bool },
}

impl ContainerFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".json.xz") {
            Some(ContainerFormat::Json { compressed: true })
        } else if name.ends_with(".json") {
            Some(ContainerFormat::Json { compressed: false })
        } else if name.ends_with(".xz") {
            Some(ContainerFormat::Pickle { compressed: true })
        } else if name.ends_with(".pkl") || name.ends_with(".pickle") {
            Some(ContainerFormat::Pickle { compressed: false })
        } else {
            None
        }
    }

    fn compressed(self) -> bool {
        match self {
            ContainerFormat::Pickle { compressed } | ContainerFormat::Json { compressed } => {
                compressed
            }
        }
    }
}

/// Read, decompress and decode a container into a value tree.
pub fn load_payload<D: PickleDecoder + ?Sized>(path: &Path, decoder: &D) -> Result<Value> {
    let format = ContainerFormat::from_path(path)
        .ok_or_else(|| Error::load(path, "unrecognized file extension"))?;

    let file = File::open(path).map_err(|e| Error::load(path, e))?;
    let mut bytes = Vec::new();
    if format.compressed() {
        xz2::read::XzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::load(path, format!("xz: {}", e)))?;
    } else {
        let mut file = file;
        file.read_to_end(&mut bytes).map_err(|e| Error::load(path, e))?;
    }

    match format {
        ContainerFormat::Json { .. } => {
            serde_json::from_slice(&bytes).map_err(|e| Error::load(path, format!("json: {}", e)))
        }
        ContainerFormat::Pickle { .. } => decoder
            .decode(&bytes)
            .map_err(|e| Error::load(path, format!("pickle: {}", e))),
    }
}

fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numeric score from a number, a boolean, or the first number of a list.
fn as_score(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Array(items) => items.iter().find_map(Value::as_f64),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

fn decode_state(map: &Map<String, Value>) -> State {
    let observation = match map.get("observation") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obs)) => match obs.get("text") {
            Some(Value::String(s)) => s.clone(),
            _ => {
                warn!("could not extract text from observation");
                String::new()
            }
        },
        _ => {
            warn!("observation is neither text nor a mapping");
            String::new()
        }
    };
    let info = map.get("info").cloned().unwrap_or(Value::Null);
    let url = scalar_string(map.get("url"))
        .or_else(|| scalar_string(info.pointer("/page/url")));
    State {
        observation,
        url,
        info,
    }
}

fn decode_action(map: &Map<String, Value>) -> Action {
    let text = |key: &str| match map.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    let raw_prediction = text("raw_prediction");
    let action_type = scalar_string(map.get("action_type"))
        .or_else(|| scalar_string(map.get("type")))
        .or_else(|| raw_prediction.as_deref().and_then(action_type_from_prediction));
    Action {
        action_type,
        element_id: scalar_string(map.get("element_id")),
        value: scalar_string(map.get("value")),
        answer: text("answer"),
        raw_prediction,
        explicit_direction: map
            .get("_direction")
            .and_then(Value::as_str)
            .and_then(Direction::parse),
    }
}

/// Upper-cased operation name of the last fenced command in a prediction,
/// e.g. `CLICK` for "... I will perform is ```click [12]```".
///
/// Enum members pickled by the agent decode to null without an interpreter,
/// and the prediction text is the only other place the type is recorded.
fn action_type_from_prediction(prediction: &str) -> Option<String> {
    let command = prediction.split("```").skip(1).step_by(2).last()?;
    let name = command
        .split(|c: char| c.is_whitespace() || c == '[')
        .find(|s| !s.is_empty())?;
    if !name.chars().all(|c| c.is_ascii_alphabetic() || c == '_') {
        return None;
    }
    Some(name.to_ascii_uppercase())
}

/// Discriminate one raw item into a state or an action.
pub fn decode_step(value: &Value) -> Option<Step> {
    let map = value.as_object()?;
    if map.len() == 1 {
        if let Some(Value::Object(inner)) = map.get("action") {
            return Some(Step::Action(decode_action(inner)));
        }
    }
    if map.contains_key("observation") {
        return Some(Step::State(decode_state(map)));
    }
    if ACTION_KEYS.iter().any(|k| map.contains_key(*k)) {
        return Some(Step::Action(decode_action(map)));
    }
    None
}

/// Decode a list of raw items, dropping unrecognized ones.
pub fn decode_steps(items: &[Value]) -> Trajectory {
    let mut steps = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match decode_step(item) {
            Some(step) => steps.push(step),
            None => warn!(step = idx, kind = value_kind(item), "unknown trajectory item, dropping"),
        }
    }
    Trajectory::new(steps)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

fn image_ref(entry: &Value, base_dir: &Path) -> Option<ImageRef> {
    let s = entry.as_str()?;
    if let Some(rest) = s.strip_prefix("data:") {
        let (_, payload) = rest.split_once("base64,")?;
        return base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .ok()
            .map(ImageRef::Inline);
    }
    let path = base_dir.join(s);
    if !path.exists() && s.len() >= MIN_INLINE_IMAGE_LEN {
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(s.trim()) {
            return Some(ImageRef::Inline(bytes));
        }
    }
    Some(ImageRef::Path(path))
}

/// Decode a task-info mapping; images are resolved relative to `base_dir`.
pub fn decode_task_info(value: &Value, base_dir: &Path) -> TaskInfo {
    let intent = value
        .get("intent")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let images = value
        .get("images")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|i| image_ref(i, base_dir)).collect())
        .unwrap_or_default();
    TaskInfo {
        task_id: value
            .get("task_id")
            .and_then(|v| scalar_string(Some(v)))
            .and_then(|s| s.parse().ok()),
        intent,
        images,
        score: as_score(value.get("score")),
        success: value.get("success").map(truthy),
    }
}

/// A decoded trajectory with whatever task metadata travelled with it.
#[derive(Debug, Clone, Default)]
pub struct LoadedTrajectory {
    pub trajectory: Trajectory,
    pub task_info: Option<TaskInfo>,
    pub score: Option<f64>,
}

fn intent_only(map: &Map<String, Value>) -> Option<TaskInfo> {
    map.get("intent")
        .and_then(Value::as_str)
        .map(TaskInfo::with_intent)
}

/// Pull the trajectory out of any of the supported container shapes.
pub fn extract_trajectory(path: &Path, root: &Value) -> Result<LoadedTrajectory> {
    let base_dir = path.parent().unwrap_or(Path::new("."));
    let map = match root {
        Value::Array(items) => {
            return non_empty(path, LoadedTrajectory {
                trajectory: decode_steps(items),
                ..Default::default()
            });
        }
        Value::Object(map) => map,
        other => {
            let reason = format!("top-level {} is not a container", value_kind(other));
            return Err(Error::format(path, reason));
        }
    };
    let score = as_score(map.get("score"));

    if let Some(raw) = map.get("trajectory") {
        let items = raw
            .as_array()
            .ok_or_else(|| Error::format(path, "`trajectory` is not a list"))?;
        let task_info = map
            .get("task_info")
            .filter(|v| v.is_object())
            .map(|v| decode_task_info(v, base_dir))
            .or_else(|| intent_only(map));
        debug!(path = %path.display(), "trajectory container");
        return non_empty(path, LoadedTrajectory {
            trajectory: decode_steps(items),
            task_info,
            score,
        });
    }

    if let Some(items) = root.pointer("/task_data/trajectory").and_then(Value::as_array) {
        debug!(path = %path.display(), "task_data container");
        return non_empty(path, LoadedTrajectory {
            trajectory: decode_steps(items),
            task_info: intent_only(map),
            score,
        });
    }

    if let Some(items) = map.values().filter_map(Value::as_array).find(|a| !a.is_empty()) {
        debug!(path = %path.display(), "first list value used as trajectory");
        return non_empty(path, LoadedTrajectory {
            trajectory: decode_steps(items),
            task_info: intent_only(map),
            score,
        });
    }

    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    Err(Error::format(path, format!("no trajectory found among keys {:?}", keys)))
}

fn non_empty(path: &Path, loaded: LoadedTrajectory) -> Result<LoadedTrajectory> {
    if loaded.trajectory.is_empty() {
        return Err(Error::format(path, "no recognizable states or actions"));
    }
    Ok(loaded)
}

/// Load a single trajectory file.
pub fn load_trajectory_file<D: PickleDecoder + ?Sized>(
    path: &Path,
    decoder: &D,
) -> Result<LoadedTrajectory> {
    let payload = load_payload(path, decoder)?;
    extract_trajectory(path, &payload)
}

/// True for exported bundles holding many trajectories keyed by task id.
pub fn is_bundle(payload: &Value) -> bool {
    payload.get("trajectories").is_some_and(Value::is_object)
}

/// Entries of an exported bundle, in task-id order.
pub fn bundle_entries(
    path: &Path,
    payload: &Value,
) -> Result<Vec<(Option<u64>, Result<LoadedTrajectory>)>> {
    let trajectories = payload
        .get("trajectories")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::format(path, "bundle without a `trajectories` mapping"))?;
    let infos = payload.get("task_info").and_then(Value::as_object);
    let base_dir = path.parent().unwrap_or(Path::new("."));

    let mut entries: Vec<(Option<u64>, Result<LoadedTrajectory>)> = trajectories
        .iter()
        .map(|(key, raw)| {
            let task_id = key.trim().parse::<u64>().ok();
            let task_info = infos
                .and_then(|m| m.get(key))
                .map(|v| decode_task_info(v, base_dir));
            let loaded = match raw.as_array() {
                Some(items) => non_empty(path, LoadedTrajectory {
                    trajectory: decode_steps(items),
                    task_info,
                    score: None,
                }),
                None => extract_trajectory(path, raw).map(|mut l| {
                    l.task_info = task_info.or(l.task_info);
                    l
                }),
            };
            (task_id, loaded)
        })
        .collect();
    entries.sort_by_key(|(id, _)| *id);
    Ok(entries)
}

/// Load every trajectory of an exported bundle file.
pub fn load_bundle<D: PickleDecoder + ?Sized>(
    path: &Path,
    decoder: &D,
) -> Result<Vec<(Option<u64>, Result<LoadedTrajectory>)>> {
    let payload = load_payload(path, decoder)?;
    bundle_entries(path, &payload)
}

fn leading_digits(s: &str) -> Option<u64> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Extract the numeric task id embedded in a file or directory name.
pub fn task_id_from_name(name: &str) -> Option<u64> {
    if let Some((_, rest)) = name.split_once("_task_") {
        return leading_digits(rest);
    }
    if let Some((_, rest)) = name.split_once("task_") {
        return leading_digits(rest);
    }
    let stem = name.split('.').next().unwrap_or(name);
    stem.rsplit(|c: char| !c.is_ascii_digit())
        .find(|run| !run.is_empty())
        .and_then(|run| run.parse().ok())
}

/// Success metadata written by the evaluation harness.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PerformanceRecord {
    #[serde(default)]
    pub success: Option<Value>,
    #[serde(default)]
    pub is_success: Option<Value>,
    #[serde(default)]
    pub completed: Option<Value>,
    #[serde(default)]
    pub score: Option<Value>,
    #[serde(default)]
    pub scores: Option<Value>,
    #[serde(default)]
    pub times: Option<Value>,
}

impl PerformanceRecord {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn score(&self) -> Option<f64> {
        as_score(self.scores.as_ref()).or_else(|| as_score(self.score.as_ref()))
    }

    /// Flags are checked in order with the last present one winning; a
    /// positive score marks success regardless.
    pub fn is_success(&self) -> bool {
        let flag = [&self.success, &self.is_success, &self.completed]
            .into_iter()
            .flatten()
            .last()
            .is_some_and(truthy);
        flag || self.score().is_some_and(|s| s > 0.0)
    }

    /// Names of the indicators that marked this record successful.
    pub fn reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        for (name, value) in [
            ("success", &self.success),
            ("is_success", &self.is_success),
            ("completed", &self.completed),
        ] {
            if value.as_ref().is_some_and(truthy) {
                reasons.push(format!("{}=True", name));
            }
        }
        if let Some(score) = self.score().filter(|s| *s > 0.0) {
            reasons.push(format!("score={}", score));
        }
        reasons
    }

    pub fn time(&self) -> Option<f64> {
        as_score(self.times.as_ref())
    }
}

/// Metadata found in files next to a trajectory.
#[derive(Debug, Clone, Default)]
pub struct Sidecars {
    pub intent: Option<String>,
    pub performance: Option<PerformanceRecord>,
}

impl Sidecars {
    /// Look for config and performance files for `task_id` in `dirs`.
    pub fn resolve(dirs: &[PathBuf], task_id: Option<u64>) -> Self {
        let mut sidecars = Sidecars::default();
        for dir in dirs {
            let mut config_names = vec!["config.json".to_string()];
            if let Some(id) = task_id {
                config_names.insert(0, format!("config_{}.json", id));
                config_names.insert(1, format!("task_info_{}.json", id));
                config_names.push(format!("task_{}/config.json", id));
            }
            if sidecars.intent.is_none() {
                sidecars.intent = config_names
                    .iter()
                    .map(|name| dir.join(name))
                    .filter(|p| p.is_file())
                    .find_map(|p| read_intent(&p));
            }

            if let Some(id) = task_id.filter(|_| sidecars.performance.is_none()) {
                let name = format!("performance_{}.json", id);
                sidecars.performance = [dir.join(&name), dir.join("performances").join(&name)]
                    .into_iter()
                    .filter(|p| p.is_file())
                    .find_map(|p| match PerformanceRecord::read(&p) {
                        Ok(record) => Some(record),
                        Err(e) => {
                            warn!(path = %p.display(), error = %e, "unreadable performance file");
                            None
                        }
                    });
            }
        }
        sidecars
    }
}

fn read_intent(path: &Path) -> Option<String> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable config file");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(v) => v.get("intent").and_then(Value::as_str).map(str::to_string),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file");
            None
        }
    }
}

impl LoadedTrajectory {
    /// Final task info: container values first, sidecars fill the gaps.
    pub fn resolve_task_info(&self, task_id: Option<u64>, sidecars: &Sidecars) -> TaskInfo {
        let mut info = self.task_info.clone().unwrap_or_default();
        info.task_id = info.task_id.or(task_id);
        if info.intent.trim().is_empty() || info.intent == NO_INTENT {
            info.intent = sidecars
                .intent
                .clone()
                .unwrap_or_else(|| NO_INTENT.to_string());
        }
        info.score = info.score.or(self.score);
        if let Some(perf) = &sidecars.performance {
            info.score = info.score.or_else(|| perf.score());
            if info.success.is_none() && info.score.is_none() {
                info.success = Some(perf.is_success());
            }
        }
        info
    }
}

/// One trajectory file to process, with the directories to search for sidecars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    pub path: PathBuf,
    pub task_id: Option<u64>,
    pub sidecar_dirs: Vec<PathBuf>,
}

fn is_trajectory_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    ContainerFormat::from_path(path).is_some()
        && !SIDECAR_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn task_dir_trajectory(task_dir: &Path, dir_name: &str) -> Option<PathBuf> {
    ["pkl.xz", "pkl", "json", "json.xz"]
        .iter()
        .map(|ext| task_dir.join("trajectories").join(format!("{}.{}", dir_name, ext)))
        .find(|p| p.is_file())
}

/// Enumerate the trajectory files under `root`, sorted by path.
///
/// `root` may be a single file, a directory of `task_<id>/` directories, or
/// a flat directory of trajectory files named with their task id.
pub fn discover_inputs(root: &Path) -> Result<Vec<InputSource>> {
    if root.is_file() {
        let parent = root.parent().unwrap_or(Path::new(".")).to_path_buf();
        let task_id = root
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(task_id_from_name);
        return Ok(vec![InputSource {
            path: root.to_path_buf(),
            task_id,
            sidecar_dirs: vec![parent],
        }]);
    }
    if !root.is_dir() {
        return Err(Error::load(root, "input path does not exist"));
    }

    let entries: Vec<_> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .collect();

    let task_dirs: Vec<_> = entries
        .iter()
        .filter(|e| e.file_type().is_dir())
        .filter(|e| e.file_name().to_str().is_some_and(|n| n.starts_with("task_")))
        .collect();

    let mut inputs = Vec::new();
    if !task_dirs.is_empty() {
        debug!(count = task_dirs.len(), "found task directories");
        for entry in task_dirs {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(path) = task_dir_trajectory(entry.path(), &name) else {
                warn!(dir = %entry.path().display(), "no trajectory file found");
                continue;
            };
            inputs.push(InputSource {
                path,
                task_id: task_id_from_name(&name),
                sidecar_dirs: vec![entry.path().to_path_buf(), root.to_path_buf()],
            });
        }
        return Ok(inputs);
    }

    for entry in entries.iter().filter(|e| e.file_type().is_file()) {
        if !is_trajectory_file(entry.path()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Some(task_id) = task_id_from_name(&name) else {
            debug!(file = %name, "no task id in file name, skipping");
            continue;
        };
        inputs.push(InputSource {
            path: entry.path().to_path_buf(),
            task_id: Some(task_id),
            sidecar_dirs: vec![root.to_path_buf()],
        });
    }
    Ok(inputs)
}
