//! Transcode Runner (C6): the single-file pipeline — lock, fingerprint,
//! probe, decide, extract, transcode, validate, replace, update cache,
//! notify. Every step before the actual `ffmpeg` invocation can bail out
//! early with a cheap, lock-released `RunOutcome::Skipped`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cache::{CacheEntry, DirectoryCache};
use crate::config::AppConfig;
use crate::decision::{self, Action, DecisionFlags, TransformPlan};
use crate::error::{EngineError, TranscodeError};
use crate::filtergraph::{self, tmp_output_path};
use crate::fingerprint::Fingerprint;
use crate::lock::{self, Lock};
use crate::notifier;
use crate::probe::{self, ProbeSummary};

const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
const MIN_TIMEOUT_SECS: u64 = 1800;
const TIMEOUT_MULTIPLIER: f64 = 4.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Skipped { action: Action },
    Transcoded { new_path: PathBuf },
}

pub struct RunnerConfig {
    pub ffprobe_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub lock_stale_after: Duration,
    pub flags: DecisionFlags,
    pub app_config: AppConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            ffprobe_path: probe::default_ffprobe_path(),
            ffmpeg_path: default_ffmpeg_path(),
            lock_stale_after: Duration::from_secs(1800),
            flags: DecisionFlags::default(),
            app_config: AppConfig::default(),
        }
    }
}

pub fn default_ffmpeg_path() -> PathBuf {
    std::env::var("FFMPEG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ffmpeg"))
}

fn file_metadata(path: &Path) -> Result<(u64, f64), EngineError> {
    let meta = std::fs::metadata(path).map_err(|e| EngineError::Input(e.to_string()))?;
    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok((size, mtime))
}

/// Runs the full per-file pipeline under an exclusive lock, releasing it on
/// every exit path (`Lock`'s `Drop`), including the early skip paths.
pub fn run_one(path: &Path, cfg: &RunnerConfig) -> Result<RunOutcome, EngineError> {
    let lock: Lock = lock::acquire(path, cfg.lock_stale_after)?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let (size, mtime) = file_metadata(path)?;
    let fingerprint = Fingerprint::for_path(path).map_err(|e| EngineError::Input(e.to_string()))?;

    let mut cache = DirectoryCache::load(dir)?;
    if let Some(existing) = cache.0.get(&fingerprint.to_hex()) {
        if existing.processing_version == crate::cache::PROCESSING_VERSION
            && matches!(existing.action, Action::Skip | Action::SkipNoEnglish)
        {
            info!(file = %path.display(), "cache hit, skipping");
            drop(lock);
            return Ok(RunOutcome::Skipped {
                action: existing.action,
            });
        }
    }

    let probe_summary = probe::probe(&cfg.ffprobe_path, path)?;

    let plan = match decision::decide(&probe_summary, cfg.flags) {
        Ok(plan) => plan,
        Err(err) => {
            let entry = CacheEntry::from_probe(
                fingerprint,
                path,
                size,
                mtime,
                &probe_summary,
                Action::SkipNoEnglish,
                None,
            );
            cache.put(fingerprint, entry);
            cache.save(dir)?;
            drop(lock);
            return Err(EngineError::Decision(err));
        }
    };

    if plan.is_empty() {
        let entry = CacheEntry::from_probe(
            fingerprint,
            path,
            size,
            mtime,
            &probe_summary,
            Action::Skip,
            None,
        );
        cache.put(fingerprint, entry);
        cache.save(dir)?;
        drop(lock);
        return Ok(RunOutcome::Skipped { action: Action::Skip });
    }

    let action = plan.dominant_action();
    extract_subtitles(&cfg.ffmpeg_path, path, &plan)?;

    let new_path = match transcode(&cfg.ffmpeg_path, &cfg.ffprobe_path, path, &probe_summary, &plan) {
        Ok(p) => p,
        Err(err) => {
            let mut entry = CacheEntry::from_probe(
                fingerprint,
                path,
                size,
                mtime,
                &probe_summary,
                action,
                None,
            );
            entry.last_conversion_error = Some(err.to_string());
            cache.put(fingerprint, entry);
            cache.save(dir)?;
            drop(lock);
            return Err(EngineError::Transcode(err));
        }
    };

    let (new_size, new_mtime) = file_metadata(&new_path)?;
    let new_fingerprint =
        Fingerprint::for_path(&new_path).map_err(|e| EngineError::Input(e.to_string()))?;
    let post_probe = probe::probe(&cfg.ffprobe_path, &new_path).ok();
    let mut new_entry = CacheEntry::from_probe(
        new_fingerprint,
        &new_path,
        new_size,
        new_mtime,
        post_probe.as_ref().unwrap_or(&probe_summary),
        Action::Skip,
        Some(format!("{action:?}")),
    );
    new_entry.conversion_count = cache
        .0
        .get(&fingerprint.to_hex())
        .map(|e| e.conversion_count + 1)
        .unwrap_or(1);
    cache.update_after(fingerprint, new_fingerprint, new_entry);
    cache.save(dir)?;

    drop(lock);

    if let Err(err) = notifier::notify_rescan(&cfg.app_config, &new_path) {
        warn!(file = %new_path.display(), error = %err, "rescan notification failed, continuing");
    }

    Ok(RunOutcome::Transcoded { new_path })
}

fn extract_subtitles(
    ffmpeg_path: &Path,
    input: &Path,
    plan: &TransformPlan,
) -> Result<(), TranscodeError> {
    let dir = input.parent().unwrap_or_else(|| Path::new("."));
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    for sub in &plan.subtitle_extract {
        let out_path = dir.join(format!("{stem}{}", sub.out_path_suffix));
        let mut cmd = Command::new(ffmpeg_path);
        cmd.arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-map")
            .arg(format!("0:s:{}", sub.relative_index))
            .arg("-c:s")
            .arg("copy")
            .arg(&out_path);
        let (status, timed_out, stderr) =
            run_command_with_timeout_capture_stderr(cmd, Duration::from_secs(300), STDERR_CAPTURE_LIMIT)
                .map_err(TranscodeError::Io)?;
        if timed_out {
            return Err(TranscodeError::TimedOut { elapsed_secs: 300 });
        }
        if !status.success() {
            return Err(TranscodeError::FfmpegFailed {
                status: status.code().unwrap_or(-1),
                log_excerpt: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
    }
    Ok(())
}

fn transcode_timeout(probe: &ProbeSummary) -> Duration {
    let scaled = (probe.duration * TIMEOUT_MULTIPLIER) as u64;
    Duration::from_secs(scaled.max(MIN_TIMEOUT_SECS))
}

fn transcode(
    ffmpeg_path: &Path,
    ffprobe_path: &Path,
    input: &Path,
    probe: &ProbeSummary,
    plan: &TransformPlan,
) -> Result<PathBuf, TranscodeError> {
    let final_path = input.with_extension(plan.container_target);
    let tmp_path = PathBuf::from(tmp_output_path(&final_path));

    let args = filtergraph::build_ffmpeg_args(input, &final_path, plan);
    let mut cmd = Command::new(ffmpeg_path);
    cmd.args(&args);

    let timeout = transcode_timeout(probe);
    let (status, timed_out, stderr) =
        run_command_with_timeout_capture_stderr(cmd, timeout, STDERR_CAPTURE_LIMIT)
            .map_err(TranscodeError::Io)?;

    let log_path = input.with_extension("mediabox.log");
    if timed_out {
        let _ = std::fs::write(&log_path, &stderr);
        let _ = std::fs::remove_file(&tmp_path);
        return Err(TranscodeError::TimedOut {
            elapsed_secs: timeout.as_secs(),
        });
    }
    if !status.success() {
        let _ = std::fs::write(&log_path, &stderr);
        let _ = std::fs::remove_file(&tmp_path);
        return Err(TranscodeError::FfmpegFailed {
            status: status.code().unwrap_or(-1),
            log_excerpt: String::from_utf8_lossy(&stderr).into_owned(),
        });
    }
    let _ = std::fs::remove_file(&log_path);

    validate_output(ffprobe_path, &tmp_path)?;
    atomic_replace(input, &final_path, &tmp_path)?;
    Ok(final_path)
}

/// Re-probes the freshly produced file: an `ffmpeg` exit code of 0 does not
/// guarantee a playable container.
fn validate_output(ffprobe_path: &Path, tmp_path: &Path) -> Result<(), TranscodeError> {
    match probe::probe(ffprobe_path, tmp_path) {
        Ok(summary) if summary.video.is_empty() && summary.audio.is_empty() => {
            Err(TranscodeError::ValidationFailed {
                reason: "produced file has no video or audio streams".to_string(),
            })
        }
        Ok(_) => Ok(()),
        Err(err) => Err(TranscodeError::ValidationFailed {
            reason: err.to_string(),
        }),
    }
}

/// Rename old-to-`.old`, tmp-to-final, then delete `.old` — never a window
/// where neither the original nor the new file exists at `final_path`.
fn atomic_replace(original: &Path, final_path: &Path, tmp_path: &Path) -> Result<(), TranscodeError> {
    let old_path = original.with_extension("mediabox.old");
    std::fs::rename(original, &old_path)?;
    if let Err(err) = std::fs::rename(tmp_path, final_path) {
        let _ = std::fs::rename(&old_path, original);
        return Err(TranscodeError::Io(err));
    }
    let _ = std::fs::remove_file(&old_path);
    Ok(())
}

/// A background thread drains stderr so the pipe never backpressures the
/// child while the main thread polls for exit or timeout.
fn run_command_with_timeout_capture_stderr(
    mut cmd: Command,
    timeout: Duration,
    stderr_capture_limit: usize,
) -> Result<(ExitStatus, bool, Vec<u8>), std::io::Error> {
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let mut stderr = child.stderr.take();
    let stderr_handle = std::thread::spawn(move || {
        let Some(mut stderr) = stderr.take() else {
            return Vec::<u8>::new();
        };
        let mut captured = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if captured.len() < stderr_capture_limit {
                let remaining = stderr_capture_limit - captured.len();
                let to_copy = remaining.min(n);
                captured.extend_from_slice(&buf[..to_copy]);
            }
        }
        captured
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            drop(child.kill());
            break child.wait()?;
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let stderr_bytes = stderr_handle.join().unwrap_or_default();
    Ok((status, timed_out, stderr_bytes))
}
