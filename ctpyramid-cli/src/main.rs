use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use ctpyramid::{build_pyramid, BuildOptions, Callbacks, LogLevel};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Builds a level-of-detail pyramid from a directory of ordered CT slices.
#[derive(Parser, Debug)]
#[command(author, version, about = "CT slice-stack LoD pyramid builder")]
struct Cli {
    /// Directory holding the level-0 slice sequence.
    source_dir: PathBuf,

    /// Stop building further levels once min(width, height) <= this.
    #[arg(long, default_value_t = 512)]
    max_thumbnail_size: u32,

    /// Skip loading the smallest level into memory on completion.
    #[arg(long)]
    no_retain_smallest: bool,

    /// Tasks sampled per ETA stage (clamped to 1..100).
    #[arg(long, default_value_t = 20)]
    sample_size: u32,

    /// Worker pool size; defaults to min(logical_cores, 8).
    #[arg(long)]
    workers: Option<u32>,

    /// Enable debug-level tracing output.
    #[arg(long)]
    verbose: bool,

    /// Print the result as JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Summary {
    cancelled: bool,
    levels: Vec<LevelSummary>,
}

#[derive(Serialize)]
struct LevelSummary {
    level_index: u32,
    width: u32,
    height: u32,
    slice_count: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::from_default_env() };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let opts = BuildOptions {
        max_thumbnail_size: cli.max_thumbnail_size,
        retain_smallest: !cli.no_retain_smallest,
        sample_size: cli.sample_size,
        worker_count: cli.workers,
        seeded_speed: None,
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_handler = interrupted.clone();
    ctrlc::set_handler(move || interrupted_handler.store(true, Ordering::SeqCst))?;

    let interrupted_poll = interrupted.clone();
    let callbacks = Callbacks {
        on_progress: Some(Box::new(move |pct| {
            if !cli.json {
                eprint!("\r{pct:5.1}%");
            }
            !interrupted_poll.load(Ordering::SeqCst)
        })),
        on_detail: if cli.json {
            None
        } else {
            Some(Box::new(|detail: &str| eprintln!("\n{detail}")))
        },
        on_log: Some(Box::new(|level: LogLevel, message: &str| {
            let label = match level {
                LogLevel::Debug => "debug",
                LogLevel::Info => "info",
                LogLevel::Warn => "warn",
                LogLevel::Error => "error",
            };
            eprintln!("[{label}] {message}");
        })),
    };

    let result = build_pyramid(&cli.source_dir, &opts, callbacks)?;
    if !cli.json {
        eprintln!();
    }

    let summary = Summary {
        cancelled: result.cancelled,
        levels: result
            .levels
            .iter()
            .map(|l| LevelSummary { level_index: l.level_index, width: l.width, height: l.height, slice_count: l.slice_count })
            .collect(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for level in &summary.levels {
            println!("level {}: {}x{} ({} slices)", level.level_index, level.width, level.height, level.slice_count);
        }
        if summary.cancelled {
            println!("build cancelled");
        }
    }

    if result.cancelled {
        std::process::exit(130);
    }
    Ok(())
}
