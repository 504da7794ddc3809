//! Distill CLI - persona distillation from the command line
//!
//! Provides a `distill` command that runs each pipeline stage (prepare,
//! generate, train, evaluate, metrics) on its own or all of them in sequence.

mod commands;
mod progress;
mod services;

use clap::{Parser, Subcommand};
use distill_training::DistillConfig;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{evaluate, generate, metrics, pipeline, prepare, train};

/// Distill - compress a persona prompt into a student model's weights
#[derive(Parser, Debug)]
#[command(
    name = "distill",
    author,
    version,
    about = "Persona prompt distillation pipeline",
    long_about = "Distill trains a small student model to answer in a persona without the persona \
                  prompt.\nIt prepares teacher data, fine-tunes on a remote training service, \
                  and measures quality retained and tokens saved."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Path to distill.toml (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert raw teacher records into train/val conversation files
    Prepare {
        /// JSONL file of {question, response} or {prompt, output} records
        #[arg(long)]
        input: PathBuf,

        /// Directory for train.jsonl and val.jsonl (overrides data.train_file/val_file)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sample teacher responses for a question list (resumable)
    Generate {
        /// File with one question per line
        #[arg(long)]
        questions: PathBuf,

        /// Number of items to generate
        #[arg(long)]
        count: usize,

        /// Output JSONL (overrides generation.output_file)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fine-tune the student on data.train_file
    Train {
        /// Override training.num_steps
        #[arg(long)]
        steps: Option<u64>,

        /// Checkpoint to resume from, or "latest" for the newest periodic checkpoint
        #[arg(long)]
        resume_from: Option<String>,

        /// Step the resume checkpoint was saved at (parsed from the name when omitted)
        #[arg(long, requires = "resume_from")]
        start_step: Option<u64>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare a trained checkpoint against the teacher on data.val_file
    Evaluate {
        /// Checkpoint name saved by `train`
        #[arg(long)]
        checkpoint: String,

        /// Held-out examples to evaluate (overrides evaluation.num_samples)
        #[arg(long)]
        num_samples: Option<usize>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarize evaluation results into quality and cost figures
    Metrics {
        /// Evaluation results file (overrides evaluation.results_file)
        #[arg(long)]
        results: Option<PathBuf>,

        /// Dollars per million prompt tokens (overrides evaluation.price_per_million_tokens)
        #[arg(long)]
        price_per_million: Option<f64>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run prepare, train, evaluate and metrics in one process
    Pipeline {
        /// JSONL file of raw teacher records
        #[arg(long)]
        input: PathBuf,

        /// Override training.num_steps
        #[arg(long)]
        steps: Option<u64>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(log_level: &str, json: bool) -> anyhow::Result<()> {
    let level = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => log_level,
        _ => "info",
    };
    // RUST_LOG wins over --log-level when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so `--json` output on stdout stays parseable.
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json)?;

    let config = DistillConfig::load_or_default(args.config.as_deref())?;

    match args.command {
        Command::Prepare { input, out_dir, json } => {
            prepare::execute(config, &input, out_dir, json)
        }
        Command::Generate { questions, count, output, json } => {
            generate::execute(config, &questions, count, output, json).await
        }
        Command::Train { steps, resume_from, start_step, json } => {
            train::execute(config, steps, resume_from, start_step, json).await
        }
        Command::Evaluate { checkpoint, num_samples, json } => {
            evaluate::execute(config, &checkpoint, num_samples, json).await
        }
        Command::Metrics { results, price_per_million, json } => {
            metrics::execute(&config, results, price_per_million, json)
        }
        Command::Pipeline { input, steps, json } => {
            pipeline::execute(config, &input, steps, json).await
        }
    }
}
