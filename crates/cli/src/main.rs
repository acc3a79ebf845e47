//! CLI tool for turning recorded web-agent trajectories into fine-tuning data.
//!
//! `convert` builds chat-format examples; `analyze`, `success` and `inspect`
//! are read-only reports over the same inputs. Exact token counts use the
//! HuggingFace tokenizers Rust library.

mod captioner;
#[cfg(feature = "python")]
mod python;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trajectory_serializer_core::caption::default_cache_path;
use trajectory_serializer_core::pipeline::Captioning;
use trajectory_serializer_core::stats::{analyze_inputs, BatchReport};
use trajectory_serializer_core::{
    analyze_performance_dir, analyze_processed_file, analyze_trajectory, discover_inputs,
    load_trajectory_file, process_batch, write_outputs, CaptionCache, CharApproxTokenizer,
    NativePickleDecoder, PickleDecoder, PipelineConfig, Step, TaskFilter, Tokenizer,
};

use crate::captioner::{OpenAiCaptioner, DEFAULT_API_BASE};

/// Serialize web-agent trajectories into chat-format fine-tuning data.
#[derive(Parser, Debug)]
#[command(name = "trajectory-serialize")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Decode pickles with the embedded Python interpreter
    #[arg(long, global = true)]
    python_unpickler: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert trajectories into training files.
    Convert(ConvertArgs),
    /// Report success rate, action and backtracking statistics.
    Analyze {
        /// Trajectory file or directory
        #[arg(long)]
        input: Option<PathBuf>,

        /// Extra directory holding performance_<id>.json files
        #[arg(long)]
        performance_dir: Option<PathBuf>,

        /// Processed JSONL file to scan for leftover backtracking
        #[arg(long)]
        processed: Option<PathBuf>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Success rate over a directory of performance records.
    Success {
        dir: PathBuf,

        #[arg(long)]
        json: bool,
    },
    /// Print the steps of a single trajectory file.
    Inspect {
        file: PathBuf,

        /// Characters of each observation to show
        #[arg(long, default_value = "200")]
        preview: usize,
    },
}

#[derive(clap::Args, Debug)]
struct ConvertArgs {
    /// Trajectory file, bundle, or directory of trajectories
    #[arg(long)]
    input: PathBuf,

    /// Output directory for training files
    #[arg(long)]
    output_dir: PathBuf,

    /// JSON pipeline config; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Environment name used in output file names
    #[arg(long)]
    env_name: Option<String>,

    /// Keep trajectories whose task did not succeed
    #[arg(long)]
    lenient: bool,

    /// Allow backtracking language in final assistant turns
    #[arg(long)]
    no_strict: bool,

    /// Emit one example per action prefix
    #[arg(long)]
    partial: bool,

    #[arg(long)]
    max_partial_actions: Option<usize>,

    /// Keep backtracking actions in the trajectory
    #[arg(long)]
    no_flatten: bool,

    /// Skip text sanitization
    #[arg(long)]
    no_filters: bool,

    /// Token budget per example
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Character cap per turn field
    #[arg(long)]
    max_field_chars: Option<usize>,

    /// HuggingFace tokenizer model name or tokenizer.json path, overriding
    /// the config file's `model`; without either tokens are estimated at
    /// ~4 chars each
    #[arg(long)]
    tokenizer: Option<String>,

    /// Stop after this many examples
    #[arg(long)]
    max_samples: Option<usize>,

    /// Deterministically sample down to this many examples
    #[arg(long)]
    max_output_samples: Option<usize>,

    /// Custom system prompt (optional)
    #[arg(long)]
    system_prompt: Option<String>,

    /// Extra directory holding performance_<id>.json files
    #[arg(long)]
    performance_dir: Option<PathBuf>,

    /// JSON list of task ids to keep
    #[arg(long)]
    include_tasks: Option<PathBuf>,

    /// JSON list of task ids to drop
    #[arg(long)]
    exclude_tasks: Option<PathBuf>,

    /// Caption task input images and prefix them to the intent
    #[arg(long)]
    caption_images: bool,

    #[arg(long, default_value = "gpt-4o")]
    caption_model: String,

    /// Caption cache file (defaults to <output-dir>/caption_cache.json)
    #[arg(long)]
    caption_cache: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,
}

impl ConvertArgs {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(env_name) = &self.env_name {
            config.env_name = env_name.clone();
        }
        if self.lenient {
            config.lenient = true;
        }
        if self.no_strict {
            config.strict_mode = false;
        }
        if self.partial {
            config.partial_trajectories = true;
        }
        if self.no_flatten {
            config.flatten_backtracks = false;
        }
        if self.no_filters {
            config.apply_filters = false;
        }
        if let Some(n) = self.max_partial_actions {
            config.max_partial_actions = n;
        }
        if let Some(n) = self.max_tokens {
            config.max_tokens = n;
        }
        if let Some(n) = self.max_field_chars {
            config.max_field_chars = n;
        }
        if let Some(model) = &self.tokenizer {
            config.model = Some(model.clone());
        }
        if self.max_samples.is_some() {
            config.max_samples = self.max_samples;
        }
        if self.max_output_samples.is_some() {
            config.max_output_samples = self.max_output_samples;
        }
        if let Some(prompt) = &self.system_prompt {
            config.system_prompt = prompt.clone();
        }
        Ok(config)
    }
}

/// Wrapper around HuggingFace tokenizers for token counting and truncation.
struct RustTokenizer {
    inner: HfTokenizer,
}

impl RustTokenizer {
    /// Load from a local `tokenizer.json`, or by model name from the hub.
    fn load(model: &str) -> Result<Self> {
        let inner = if Path::new(model).is_file() {
            HfTokenizer::from_file(model)
        } else {
            HfTokenizer::from_pretrained(model, None)
        }
        .map_err(|e| anyhow!("failed to load tokenizer {}: {}", model, e))?;
        Ok(Self { inner })
    }
}

impl Tokenizer for RustTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(e) => {
                warn!(error = %e, "tokenizer failed, estimating");
                CharApproxTokenizer.count_tokens(text)
            }
        }
    }

    fn truncate_to_max_tokens(&self, text: &str, max_tokens: usize) -> String {
        let encoding = match self.inner.encode(text, false) {
            Ok(encoding) => encoding,
            Err(e) => {
                warn!(error = %e, "tokenizer failed, estimating");
                return CharApproxTokenizer.truncate_to_max_tokens(text, max_tokens);
            }
        };
        let ids = encoding.get_ids();
        if ids.len() <= max_tokens {
            return text.to_string();
        }
        self.inner
            .decode(&ids[..max_tokens], true)
            .unwrap_or_else(|_| CharApproxTokenizer.truncate_to_max_tokens(text, max_tokens))
    }
}

/// Exact tokenizer when one was loaded, otherwise the character estimate.
enum CliTokenizer {
    Exact(RustTokenizer),
    Approx(CharApproxTokenizer),
}

impl CliTokenizer {
    fn resolve(model: Option<&str>) -> Self {
        let Some(model) = model else {
            return CliTokenizer::Approx(CharApproxTokenizer);
        };
        println!("Loading tokenizer from {}...", model);
        match RustTokenizer::load(model) {
            Ok(tokenizer) => CliTokenizer::Exact(tokenizer),
            Err(e) => {
                warn!(error = %e, "falling back to approximate token counts");
                CliTokenizer::Approx(CharApproxTokenizer)
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CliTokenizer::Exact(_) => "exact",
            CliTokenizer::Approx(_) => "approximate",
        }
    }
}

impl Tokenizer for CliTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        match self {
            CliTokenizer::Exact(t) => t.count_tokens(text),
            CliTokenizer::Approx(t) => t.count_tokens(text),
        }
    }

    fn truncate_to_max_tokens(&self, text: &str, max_tokens: usize) -> String {
        match self {
            CliTokenizer::Exact(t) => t.truncate_to_max_tokens(text, max_tokens),
            CliTokenizer::Approx(t) => t.truncate_to_max_tokens(text, max_tokens),
        }
    }
}

fn pickle_decoder(python: bool) -> Result<Box<dyn PickleDecoder>> {
    if !python {
        return Ok(Box::new(NativePickleDecoder));
    }
    #[cfg(feature = "python")]
    {
        Ok(Box::new(crate::python::PyPickleDecoder))
    }
    #[cfg(not(feature = "python"))]
    {
        bail!("--python-unpickler requires building with the `python` feature")
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let decoder = pickle_decoder(cli.python_unpickler)?;

    match cli.command {
        Command::Convert(args) => run_convert(&args, decoder.as_ref(), cli.python_unpickler),
        Command::Analyze {
            input,
            performance_dir,
            processed,
            json,
        } => run_analyze(
            input.as_deref(),
            performance_dir,
            processed.as_deref(),
            json,
            decoder.as_ref(),
        ),
        Command::Success { dir, json } => run_success(&dir, json),
        Command::Inspect { file, preview } => run_inspect(&file, preview, decoder.as_ref()),
    }
}

fn run_convert(
    args: &ConvertArgs,
    decoder: &dyn PickleDecoder,
    python_unpickler: bool,
) -> Result<()> {
    let config = args.pipeline_config()?;
    let filter =
        TaskFilter::from_files(args.include_tasks.as_deref(), args.exclude_tasks.as_deref())
            .context("Failed to read task filter")?;

    let mut inputs = discover_inputs(&args.input)
        .with_context(|| format!("Failed to read input {}", args.input.display()))?;
    if inputs.is_empty() {
        bail!("No trajectory files found under {}", args.input.display());
    }
    if let Some(dir) = &args.performance_dir {
        for input in &mut inputs {
            input.sidecar_dirs.push(dir.clone());
        }
    }

    let tokenizer = CliTokenizer::resolve(config.model.as_deref());

    let captioner = if args.caption_images {
        Some(OpenAiCaptioner::from_env(&args.caption_model, &args.api_base)?)
    } else {
        None
    };
    let cache_path = args
        .caption_cache
        .clone()
        .unwrap_or_else(|| default_cache_path(&args.output_dir));
    let mut cache = match &captioner {
        Some(_) => CaptionCache::open(&cache_path)
            .with_context(|| format!("Failed to open caption cache {}", cache_path.display()))?,
        None => CaptionCache::in_memory(),
    };
    let captioning = captioner.as_ref().map(|c| Captioning {
        cache: &mut cache,
        captioner: c,
    });

    println!("Processing {} trajectory files from {:?}...", inputs.len(), args.input);
    let result = process_batch(&inputs, decoder, &tokenizer, &config, &filter, captioning);
    if result.untyped_actions > 0 && !python_unpickler {
        warn!(
            count = result.untyped_actions,
            "actions decoded without a type; pickled enums need --python-unpickler"
        );
    }

    println!("Writing output to {:?}...", args.output_dir);
    let paths = write_outputs(&result.examples, &args.output_dir, &config.env_name)?;

    let avg_messages = if result.examples.is_empty() {
        0.0
    } else {
        result.examples.iter().map(|e| e.messages.len()).sum::<usize>() as f64
            / result.examples.len() as f64
    };
    let summary = serde_json::json!({
        "config": config,
        "input": args.input.to_string_lossy(),
        "tokenizer": tokenizer.name(),
        "counts": {
            "total_inputs": result.total_inputs,
            "converted_trajectories": result.converted_trajectories,
            "examples": result.examples.len(),
            "skipped": result.skipped.len(),
        },
        "skip_reasons": result.skip_counts(),
        "turn_rejects": result.turn_rejects,
        "untyped_actions": result.untyped_actions,
        "token_stats": result.token_stats,
        "avg_messages_per_example": avg_messages,
        "skipped": result.skipped,
        "files": paths,
    });
    std::fs::write(&paths.summary, serde_json::to_string_pretty(&summary)?)?;

    println!("\n[summary]");
    println!("  Inputs processed: {}", result.total_inputs);
    println!("  Trajectories converted: {}", result.converted_trajectories);
    println!("  Training examples: {}", result.examples.len());
    for (reason, count) in result.skip_counts() {
        println!("  Skipped ({}): {}", reason, count);
    }
    for (reason, count) in &result.turn_rejects {
        println!("  Rejected turn lists ({}): {}", reason, count);
    }
    if result.token_stats.count > 0 {
        println!(
            "  Tokens: min {} / max {} / avg {:.1} / total {}",
            result.token_stats.min,
            result.token_stats.max,
            result.token_stats.avg,
            result.token_stats.total
        );
    }
    println!("  Output: {:?}", paths.jsonl);
    println!("  OpenAI format: {:?}", paths.openai);
    println!("  Summary: {:?}", paths.summary);

    Ok(())
}

fn print_batch_report(report: &BatchReport) {
    println!("\n[trajectories]");
    println!("  Total: {}", report.total);
    println!(
        "  Successful: {} / Failed: {} ({:.2}% success)",
        report.successful, report.failed, report.success_rate
    );
    if let Some(counts) = report.action_counts {
        println!(
            "  Actions per task: mean {:.2}, min {}, max {}",
            counts.mean, counts.min, counts.max
        );
    }
    println!("  Action types:");
    let mut types: Vec<_> = report.action_types.iter().collect();
    types.sort_by(|a, b| b.1.cmp(a.1));
    for (kind, count) in types {
        println!("    {}: {}", kind, count);
    }
    println!("  Backtracking actions per task:");
    for (backtracks, tasks) in &report.backtrack_histogram {
        println!("    {}: {} tasks", backtracks, tasks);
    }
    println!("  Tasks with only backtracking: {}", report.all_backtrack_tasks.len());
    println!("  Tasks without backtracking: {}", report.no_backtrack_tasks.len());
    println!("  Invalid after flattening: {}", report.invalid_after_flatten);
    for (source, error) in &report.errors {
        println!("  Error in {}: {}", source, error);
    }
}

fn run_analyze(
    input: Option<&Path>,
    performance_dir: Option<PathBuf>,
    processed: Option<&Path>,
    json: bool,
    decoder: &dyn PickleDecoder,
) -> Result<()> {
    if input.is_none() && processed.is_none() {
        bail!("analyze needs --input and/or --processed");
    }
    let mut output = serde_json::Map::new();

    if let Some(input) = input {
        let mut inputs = discover_inputs(input)
            .with_context(|| format!("Failed to read input {}", input.display()))?;
        if let Some(dir) = &performance_dir {
            for source in &mut inputs {
                source.sidecar_dirs.push(dir.clone());
            }
        }
        info!(count = inputs.len(), "analyzing trajectories");
        let report = analyze_inputs(&inputs, decoder);
        if json {
            output.insert("trajectories".into(), serde_json::to_value(&report)?);
        } else {
            print_batch_report(&report);
        }
    }

    if let Some(path) = processed {
        let report = analyze_processed_file(path)
            .with_context(|| format!("Failed to read processed file {}", path.display()))?;
        if json {
            output.insert("processed".into(), serde_json::to_value(&report)?);
        } else {
            println!("\n[processed]");
            println!("  Examples: {}", report.examples);
            println!("  Assistant turns: {}", report.assistant_turns);
            println!("  Examples with backtracking: {}", report.examples_with_backtracking);
            for (backtracks, examples) in &report.backtrack_histogram {
                println!("    {} backtracking turns: {} examples", backtracks, examples);
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

fn run_success(dir: &Path, json: bool) -> Result<()> {
    let report = analyze_performance_dir(dir)
        .with_context(|| format!("Failed to analyze {}", dir.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("\n[success]");
    println!("  Performance files: {}", report.total);
    println!("  Successful: {}", report.successful);
    println!("  Success rate: {:.2}%", report.success_rate);
    if let Some(t) = report.times {
        println!("  Average time: {:.2}s", t);
    }
    for (task_id, reasons) in &report.successful_tasks {
        println!("    task {}: {}", task_id, reasons.join(", "));
    }
    for (path, error) in &report.errors {
        println!("  Error in {}: {}", path, error);
    }
    Ok(())
}

fn run_inspect(file: &Path, preview: usize, decoder: &dyn PickleDecoder) -> Result<()> {
    let loaded = load_trajectory_file(file, decoder)?;
    if let Some(info) = &loaded.task_info {
        println!("Intent: {}", info.intent);
    }
    if let Some(score) = loaded.score {
        println!("Score: {}", score);
    }

    for (idx, step) in loaded.trajectory.steps().iter().enumerate() {
        match step {
            Step::State(state) => {
                let text: String = state.observation.chars().take(preview).collect();
                println!(
                    "[{}] state {}: {}",
                    idx,
                    state.url.as_deref().unwrap_or(""),
                    text.replace('\n', " ")
                );
            }
            Step::Action(action) => {
                println!(
                    "[{}] action {} ({:?}): {}",
                    idx,
                    action.descriptor(),
                    trajectory_serializer_core::classify(action),
                    action.text().unwrap_or("<no text>")
                );
            }
        }
    }

    let stats = analyze_trajectory(&loaded.trajectory);
    println!("\n{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
