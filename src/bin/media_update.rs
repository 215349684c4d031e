//! `media-update` — the Decision/Transcode entry point: runs the full
//! per-file pipeline against a single file or every media file under a
//! directory.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use mediabox::logging::{self, LogLevel};
use mediabox::runner::{self, RunOutcome, RunnerConfig};
use mediabox::{AppConfig, DecisionFlags};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetType {
    Video,
    Audio,
    Both,
}

#[derive(Debug, Parser)]
#[command(name = "media-update", about = "Decide and run media transcodes")]
struct Args {
    #[arg(long, conflicts_with = "dir")]
    file: Option<PathBuf>,
    #[arg(long, conflicts_with = "file")]
    dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = TargetType::Both)]
    r#type: TargetType,
    #[arg(long)]
    force_stereo: bool,
    #[arg(long)]
    downgrade_resolution: bool,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    #[arg(long)]
    log_json: bool,
}

fn collect_targets(file: Option<PathBuf>, dir: Option<PathBuf>) -> Result<Vec<PathBuf>, String> {
    if let Some(file) = file {
        return Ok(vec![file]);
    }
    let dir = dir.ok_or_else(|| "one of --file or --dir is required".to_string())?;
    let mut out = Vec::new();
    walk(&dir, &mut out);
    Ok(out)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "mkv" | "mp4" | "avi" | "mov" | "ts" | "m2ts" | "webm"))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_level, args.log_json);

    let config_path = args.config.or_else(|| Some(mediabox::config::default_config_path()));
    let app_config = match AppConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load config");
            return ExitCode::from(1);
        }
    };

    let targets = match collect_targets(args.file, args.dir) {
        Ok(t) => t,
        Err(msg) => {
            error!("{msg}");
            return ExitCode::from(1);
        }
    };

    let runner_cfg = RunnerConfig {
        flags: DecisionFlags {
            force_stereo: args.force_stereo,
            downgrade_resolution: args.downgrade_resolution,
            scope: match args.r#type {
                TargetType::Video => mediabox::decision::TargetScope::Video,
                TargetType::Audio => mediabox::decision::TargetScope::Audio,
                TargetType::Both => mediabox::decision::TargetScope::Both,
            },
        },
        app_config,
        ..RunnerConfig::default()
    };

    let mut worst_exit = 0i32;
    for path in &targets {
        match runner::run_one(path, &runner_cfg) {
            Ok(RunOutcome::Skipped { action }) => {
                info!(file = %path.display(), ?action, "skipped");
            }
            Ok(RunOutcome::Transcoded { new_path }) => {
                info!(file = %path.display(), new_file = %new_path.display(), "transcoded");
            }
            Err(err) => {
                let code = err.exit_code();
                error!(file = %path.display(), error = %err, exit_code = code, "run failed");
                worst_exit = worst_exit.max(code);
            }
        }
    }

    ExitCode::from(worst_exit as u8)
}
