use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde_json::json;
use tempfile::TempDir;
use trajectory_serializer_core::pipeline::Captioning;
use trajectory_serializer_core::stats::analyze_inputs;
use trajectory_serializer_core::{
    discover_inputs, process_batch, read_jsonl, write_outputs, CaptionCache, Captioner,
    CharApproxTokenizer, NativePickleDecoder, PipelineConfig, Role, TaskFilter,
};

fn trajectory_json(actions: &[(&str, &str)]) -> serde_json::Value {
    let mut items = Vec::new();
    for (id, text) in actions {
        let observation = format!("[{}] link 'Item {}'\n[99] button 'Back'", id, id);
        items.push(json!({"observation": {"text": observation}}));
        items.push(json!({"action_type": "CLICK", "element_id": id, "raw_prediction": text}));
    }
    items.push(json!({"observation": {"text": "done"}}));
    serde_json::Value::Array(items)
}

fn write_xz_json(path: &Path, value: &serde_json::Value) {
    let mut encoder = xz2::write::XzEncoder::new(File::create(path).unwrap(), 6);
    encoder.write_all(value.to_string().as_bytes()).unwrap();
    encoder.finish().unwrap();
}

fn write_task_dir(root: &Path, id: u64, trajectory: serde_json::Value, intent: &str, score: f64) {
    let task_dir = root.join(format!("task_{}", id));
    std::fs::create_dir_all(task_dir.join("trajectories")).unwrap();
    std::fs::create_dir_all(task_dir.join("performances")).unwrap();
    write_xz_json(
        &task_dir.join(format!("trajectories/task_{}.json.xz", id)),
        &json!({"trajectory": trajectory}),
    );
    std::fs::write(task_dir.join("config.json"), json!({"intent": intent}).to_string()).unwrap();
    std::fs::write(
        task_dir.join(format!("performances/performance_{}.json", id)),
        json!({"scores": score}).to_string(),
    )
    .unwrap();
}

#[test]
fn test_directory_to_training_files() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("runs");
    write_task_dir(
        &input,
        10,
        trajectory_json(&[
            ("1", "click [1]"),
            ("2", "we should take a step back"),
            ("3", "click [3]"),
        ]),
        "Find the open issues",
        1.0,
    );
    write_task_dir(&input, 11, trajectory_json(&[("4", "click [4]")]), "Star the repo", 0.0);
    std::fs::create_dir_all(input.join("task_12/trajectories")).unwrap();
    std::fs::write(input.join("task_12/trajectories/task_12.json"), "{ broken").unwrap();

    let inputs = discover_inputs(&input).unwrap();
    assert_eq!(inputs.len(), 3);

    let config = PipelineConfig::default();
    let result = process_batch(
        &inputs,
        &NativePickleDecoder,
        &CharApproxTokenizer,
        &config,
        &TaskFilter::default(),
        None,
    );

    assert_eq!(result.examples.len(), 1);
    let counts = result.skip_counts();
    assert_eq!(counts.get("not_successful"), Some(&1));
    assert_eq!(counts.get("load_error"), Some(&1));

    let example = &result.examples[0];
    assert!(example.messages[1].content.starts_with("Task: Find the open issues"));
    assert!(example.messages.windows(2).all(|w| w[0].role != w[1].role));
    assert_eq!(example.messages.last().unwrap().role, Role::Assistant);
    assert_eq!(example.messages.last().unwrap().content, "click [3]");

    let out = temp.path().join("out");
    let paths = write_outputs(&result.examples, &out, &config.env_name).unwrap();
    let read_back = read_jsonl(&paths.openai).unwrap();
    assert_eq!(read_back.len(), 1);
    assert_eq!(read_back[0].messages, example.messages);

    let report = analyze_inputs(&inputs, &NativePickleDecoder);
    assert_eq!(report.total, 2);
    assert_eq!(report.success_rate, 50.0);
    assert_eq!(report.errors.len(), 1);
}

struct EchoCaptioner;

impl Captioner for EchoCaptioner {
    fn caption(&self, image: &[u8]) -> trajectory_serializer_core::Result<String> {
        Ok(format!("image of {} bytes", image.len()))
    }
}

#[test]
fn test_captions_prefix_intent_and_persist() {
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("shoe.png");
    std::fs::write(&image, [0u8; 16]).unwrap();
    let body = json!({
        "trajectory": trajectory_json(&[("5", "click [5]")]),
        "task_info": {"intent": "Buy this shoe", "images": ["shoe.png"]},
        "score": 1.0
    });
    std::fs::write(temp.path().join("task_5.json"), body.to_string()).unwrap();

    let inputs = discover_inputs(temp.path()).unwrap();
    assert_eq!(inputs.len(), 1);

    let cache_path = temp.path().join("cache/captions.json");
    let mut cache = CaptionCache::open(&cache_path).unwrap();
    let result = process_batch(
        &inputs,
        &NativePickleDecoder,
        &CharApproxTokenizer,
        &PipelineConfig::default(),
        &TaskFilter::default(),
        Some(Captioning {
            cache: &mut cache,
            captioner: &EchoCaptioner,
        }),
    );

    assert_eq!(result.examples.len(), 1);
    assert!(result.examples[0].messages[1]
        .content
        .starts_with("Task: Input image 1: \"image of 16 bytes\"\nIntent: Buy this shoe"));

    let reopened = CaptionCache::open(&cache_path).unwrap();
    assert_eq!(reopened.len(), 1);
}
