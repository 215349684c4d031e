//! `build-media-database` — populates (or refreshes) the per-directory
//! `.mediabox_cache.json` files under a directory tree without performing
//! any transcodes: probe + decide only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use mediabox::cache::{CacheEntry, DirectoryCache};
use mediabox::decision::{self, Action, DecisionFlags};
use mediabox::fingerprint::Fingerprint;
use mediabox::logging::{self, LogLevel};
use mediabox::probe;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "build-media-database", about = "Populate the per-directory media cache")]
struct Args {
    #[arg(long = "scan")]
    scan: PathBuf,
    #[arg(long)]
    force: bool,
    #[arg(long)]
    cleanup: bool,
    #[arg(long)]
    stats: bool,
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    #[arg(long)]
    log_json: bool,
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

fn build_one(path: &Path, force: bool) -> anyhow::Result<Action> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let meta = std::fs::metadata(path)?;
    let size = meta.len();
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs_f64();
    let fingerprint = Fingerprint::for_path(path)?;

    let mut cache = DirectoryCache::load(dir)?;
    if !force {
        if let Some(existing) = cache.0.get(&fingerprint.to_hex()) {
            if existing.processing_version == mediabox::cache::PROCESSING_VERSION {
                return Ok(existing.action);
            }
        }
    }

    let ffprobe_path = probe::default_ffprobe_path();
    let summary = probe::probe(&ffprobe_path, path)?;
    let action = match decision::decide(&summary, DecisionFlags::default()) {
        Ok(plan) => plan.dominant_action(),
        Err(_) => Action::SkipNoEnglish,
    };

    let entry = CacheEntry::from_probe(fingerprint, path, size, mtime, &summary, action, None);
    cache.put(fingerprint, entry);
    cache.save(dir)?;
    Ok(action)
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_level, args.log_json);

    if args.cleanup {
        let mut dirs = Vec::new();
        walk(&args.scan, &mut dirs);
        let mut seen = std::collections::HashSet::new();
        for file in &dirs {
            let dir = file.parent().unwrap_or(Path::new(".")).to_path_buf();
            if seen.insert(dir.clone()) {
                match DirectoryCache::cleanup(&dir, chrono::Duration::days(30)) {
                    Ok(removed) => info!(dir = %dir.display(), removed, "cleaned stale cache entries"),
                    Err(err) => warn!(dir = %dir.display(), error = %err, "cleanup failed"),
                }
            }
        }
    }

    let mut files = Vec::new();
    walk(&args.scan, &mut files);
    info!(count = files.len(), dir = %args.scan.display(), "scanning for media files");

    let mut counts: HashMap<Action, u64> = HashMap::new();
    let mut failures = 0u64;
    for file in &files {
        match build_one(file, args.force) {
            Ok(action) => {
                *counts.entry(action).or_insert(0) += 1;
            }
            Err(err) => {
                error!(file = %file.display(), error = %err, "probe/decide failed");
                failures += 1;
            }
        }
    }

    if args.stats {
        let summary: HashMap<String, u64> = counts
            .iter()
            .map(|(action, count)| (format!("{action:?}"), *count))
            .collect();
        println!("{}", serde_json::to_string(&summary).unwrap_or_default());
    }

    if failures > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
