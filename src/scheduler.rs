//! Smart Bulk Scheduler (C7): walks configured library directories, queues
//! files that need work, and runs a thread-per-worker pool sized
//! adaptively against live system load. Each worker still spawns `ffmpeg`
//! as its own child process (`runner::run_one`), so killing a worker's
//! current job is a process kill, not a cooperative-cancellation dance —
//! the pool itself is a fixed set of named threads pulling from a
//! condvar-guarded queue, with a periodically-resampled concurrency
//! ceiling instead of a static one.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{info, warn};

use crate::cache::DirectoryCache;
use crate::config::AppConfig;
use crate::decision::Action;
use crate::fingerprint::Fingerprint;
use crate::runner::{self, RunOutcome, RunnerConfig};
use crate::sync_ext::{CondvarExt, MutexExt};

const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "ts", "m2ts", "webm"];
pub const STATS_FILE_NAME: &str = ".mediabox_scheduler_stats.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub files_scanned: u64,
    pub files_skipped: u64,
    pub files_transcoded: u64,
    pub files_failed: u64,
}

impl SchedulerStats {
    fn new() -> Self {
        SchedulerStats {
            started_at: Utc::now(),
            finished_at: None,
            files_scanned: 0,
            files_skipped: 0,
            files_transcoded: 0,
            files_failed: 0,
        }
    }

    /// Atomic write, same pattern as `DirectoryCache::save`.
    pub fn flush(&self, dir: &Path) -> std::io::Result<()> {
        let path = dir.join(STATS_FILE_NAME);
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(self).unwrap_or_default();
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &path)
    }
}

fn walk_media_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_media_files(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| MEDIA_EXTENSIONS.iter().any(|m| m.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
}

/// A file is pre-filtered out of the queue when its directory cache already
/// marks it `skip`/`skip_no_english` under the current fingerprint — avoids
/// taking the lock and re-probing files that were already decided on a
/// previous pass.
fn already_settled(path: &Path) -> bool {
    let Ok(fingerprint) = Fingerprint::for_path(path) else {
        return false;
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let Ok(cache) = DirectoryCache::load(dir) else {
        return false;
    };
    cache
        .0
        .get(&fingerprint.to_hex())
        .map(|e| {
            e.processing_version == crate::cache::PROCESSING_VERSION
                && matches!(e.action, Action::Skip | Action::SkipNoEnglish)
        })
        .unwrap_or(false)
}

/// Builds the work queue from `AppConfig::target_directories`.
pub fn build_queue(cfg: &AppConfig) -> VecDeque<PathBuf> {
    let mut all = Vec::new();
    for dir in &cfg.target_directories {
        walk_media_files(Path::new(dir), &mut all);
    }
    all.retain(|p| !already_settled(p));
    all.into_iter().collect()
}

struct Sampler {
    system: System,
}

impl Sampler {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_processes();
        Sampler { system }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_processes();
    }

    fn cpu_percent(&self) -> f32 {
        self.system.global_cpu_info().cpu_usage()
    }

    fn memory_percent(&self) -> f32 {
        if self.system.total_memory() == 0 {
            return 0.0;
        }
        (self.system.used_memory() as f64 / self.system.total_memory() as f64 * 100.0) as f32
    }

    fn available_memory_gb(&self) -> f32 {
        let available = self.system.total_memory().saturating_sub(self.system.used_memory());
        available as f32 / (1024.0 * 1024.0 * 1024.0)
    }

    fn load_average(&self) -> f32 {
        System::load_average().one as f32
    }

    fn priority_process_running(&self, names: &[String]) -> bool {
        if names.is_empty() {
            return false;
        }
        self.system.processes().values().any(|p| {
            let pname = p.name().to_ascii_lowercase();
            names.iter().any(|n| pname.contains(&n.to_ascii_lowercase()))
        })
    }
}

fn any_threshold_exceeded(sampler: &Sampler, cfg: &AppConfig) -> bool {
    sampler.cpu_percent() > cfg.max_cpu_percent
        || sampler.memory_percent() > cfg.max_memory_percent
        || sampler.load_average() > cfg.max_load_average
}

/// Computes how many worker slots should be active right now
/// ("adaptive worker sizing"). The result is a running counter, not a
/// ceiling recomputed from scratch each sample: starting at 1, any
/// threshold breach this sample knocks it down by exactly one, regardless
/// of how many individual thresholds are over. A hard pause (`0`) wins over
/// every other consideration; a detected priority process halves whatever
/// remains.
fn desired_workers(sampler: &Sampler, cfg: &AppConfig, current_target: usize) -> usize {
    if sampler.available_memory_gb() < cfg.min_available_memory_gb {
        return 0;
    }

    let mut target = if any_threshold_exceeded(sampler, cfg) {
        current_target.saturating_sub(1)
    } else {
        current_target
    };

    let priority_active = (cfg.plex_priority || cfg.download_priority)
        && sampler.priority_process_running(&cfg.pause_for_processes);
    if priority_active {
        target = (target / 2).max(if target > 0 { 1 } else { 0 });
    }

    target.min(cfg.max_parallel_jobs)
}

struct SharedState {
    queue: Mutex<VecDeque<PathBuf>>,
    cv: Condvar,
    shutdown: AtomicBool,
    allowed_workers: AtomicUsize,
    stats: Mutex<SchedulerStats>,
}

/// Runs the bulk conversion pass to completion (or until a shutdown signal
/// arrives), returning the final stats. Installs a `ctrlc` handler so a
/// `SIGINT`/`SIGTERM` drains in-flight jobs and flushes stats instead of
/// leaving partial `.tmp.mp4` files and stale locks behind.
pub fn run(cfg: AppConfig, flags: crate::decision::DecisionFlags, stats_dir: &Path) -> SchedulerStats {
    let queue = build_queue(&cfg);
    let files_scanned = queue.len() as u64;
    info!(count = files_scanned, "queued files for bulk conversion");

    let shared = Arc::new(SharedState {
        queue: Mutex::new(queue),
        cv: Condvar::new(),
        shutdown: AtomicBool::new(false),
        allowed_workers: AtomicUsize::new(1),
        stats: Mutex::new(SchedulerStats {
            files_scanned,
            ..SchedulerStats::new()
        }),
    });

    {
        let shared_for_signal = shared.clone();
        let _ = ctrlc::set_handler(move || {
            warn!("shutdown signal received, draining in-flight workers");
            shared_for_signal.shutdown.store(true, Ordering::SeqCst);
            shared_for_signal.cv.notify_all();
        });
    }

    let pool_size = cfg.max_parallel_jobs.max(1);
    let app_cfg = Arc::new(cfg);
    let mut handles = Vec::with_capacity(pool_size);
    for slot in 0..pool_size {
        let shared = shared.clone();
        let app_cfg = app_cfg.clone();
        let handle = thread::Builder::new()
            .name(format!("mediabox-worker-{slot}"))
            .spawn(move || worker_loop(slot, shared, app_cfg, flags))
            .expect("failed to spawn worker thread");
        handles.push(handle);
    }

    let sampler_shared = shared.clone();
    let sampler_cfg = app_cfg.clone();
    let sampler_handle = thread::Builder::new()
        .name("mediabox-sampler".to_string())
        .spawn(move || sampler_loop(sampler_shared, sampler_cfg))
        .expect("failed to spawn sampler thread");

    for handle in handles {
        let _ = handle.join();
    }
    shared.shutdown.store(true, Ordering::SeqCst);
    shared.cv.notify_all();
    let _ = sampler_handle.join();

    let mut stats = shared.stats.lock_unpoisoned().clone();
    stats.finished_at = Some(Utc::now());
    if let Err(err) = stats.flush(stats_dir) {
        warn!(error = %err, "failed to flush scheduler stats");
    }
    stats
}

fn sampler_loop(shared: Arc<SharedState>, cfg: Arc<AppConfig>) {
    let mut sampler = Sampler::new();
    let interval = Duration::from_secs(cfg.check_interval.max(1));
    let ramp_up_interval = Duration::from_secs(cfg.ramp_up_interval.max(1));
    let mut last_increase = Instant::now() - ramp_up_interval;

    while !shared.shutdown.load(Ordering::SeqCst) {
        sampler.refresh();
        let current = shared.allowed_workers.load(Ordering::SeqCst);
        let target = desired_workers(&sampler, &cfg, current);

        if target < current {
            // Ramp down immediately — load pressure is already present.
            shared.allowed_workers.store(target, Ordering::SeqCst);
            last_increase = Instant::now();
        } else if current < cfg.max_parallel_jobs && last_increase.elapsed() >= ramp_up_interval {
            shared.allowed_workers.store(current + 1, Ordering::SeqCst);
            last_increase = Instant::now();
        }
        shared.cv.notify_all();
        thread::sleep(interval);
    }
}

fn worker_loop(
    slot: usize,
    shared: Arc<SharedState>,
    cfg: Arc<AppConfig>,
    flags: crate::decision::DecisionFlags,
) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if slot >= shared.allowed_workers.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(500));
            continue;
        }

        let path = {
            let mut queue = shared.queue.lock_unpoisoned();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(path) = queue.pop_front() {
                    break Some(path);
                }
                if queue.is_empty() {
                    break None;
                }
                queue = shared.cv.wait_unpoisoned(queue);
            }
        };

        let Some(path) = path else {
            return;
        };

        let runner_cfg = RunnerConfig {
            flags,
            app_config: (*cfg).clone(),
            ..RunnerConfig::default()
        };

        match runner::run_one(&path, &runner_cfg) {
            Ok(RunOutcome::Skipped { .. }) => {
                shared.stats.lock_unpoisoned().files_skipped += 1;
            }
            Ok(RunOutcome::Transcoded { new_path }) => {
                info!(file = %new_path.display(), "transcode complete");
                shared.stats.lock_unpoisoned().files_transcoded += 1;
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "transcode failed");
                shared.stats.lock_unpoisoned().files_failed += 1;
            }
        }
    }
}
