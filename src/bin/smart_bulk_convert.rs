//! `smart-bulk-convert` — the Scheduler entry point: queues every media
//! file under the given directories and runs the adaptive worker pool
//! until the queue drains or a shutdown signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mediabox::config::default_config_path;
use mediabox::logging::{self, LogLevel};
use mediabox::scheduler;
use mediabox::AppConfig;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "smart-bulk-convert", about = "Adaptive bulk media transcode scheduler")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long = "max-jobs")]
    max_jobs: Option<usize>,
    #[arg(long)]
    interval: Option<u64>,
    #[arg(long = "cpu-limit")]
    cpu_limit: Option<f32>,
    #[arg(long = "memory-limit")]
    memory_limit: Option<f32>,
    #[arg(long = "load-limit")]
    load_limit: Option<f32>,
    #[arg(long)]
    force_stereo: bool,
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    #[arg(long)]
    log_json: bool,
    #[arg(required = false)]
    dirs: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_level, args.log_json);

    let config_path = args.config.or_else(|| Some(default_config_path()));
    let mut cfg = match AppConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load config");
            return ExitCode::from(1);
        }
    };

    if let Some(max_jobs) = args.max_jobs {
        cfg.max_parallel_jobs = max_jobs;
    }
    if let Some(interval) = args.interval {
        cfg.check_interval = interval;
    }
    if let Some(cpu_limit) = args.cpu_limit {
        cfg.max_cpu_percent = cpu_limit;
    }
    if let Some(memory_limit) = args.memory_limit {
        cfg.max_memory_percent = memory_limit;
    }
    if let Some(load_limit) = args.load_limit {
        cfg.max_load_average = load_limit;
    }
    if !args.dirs.is_empty() {
        cfg.target_directories = args.dirs.iter().map(|d| d.to_string_lossy().into_owned()).collect();
    }

    if cfg.target_directories.is_empty() {
        error!("no target directories configured: pass DIR arguments or set target_directories in config");
        return ExitCode::from(1);
    }

    let flags = mediabox::decision::DecisionFlags {
        force_stereo: args.force_stereo,
        downgrade_resolution: false,
        scope: mediabox::decision::TargetScope::Both,
    };

    let stats_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let stats = scheduler::run(cfg, flags, &stats_dir);

    let summary = serde_json::to_string(&stats).unwrap_or_default();
    println!("{summary}");
    info!(
        scanned = stats.files_scanned,
        transcoded = stats.files_transcoded,
        skipped = stats.files_skipped,
        failed = stats.files_failed,
        "bulk run complete"
    );

    if stats.files_failed > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
