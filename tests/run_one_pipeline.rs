//! End-to-end exercises of `runner::run_one` against the mock ffmpeg/ffprobe
//! binary, driven entirely through `CARGO_BIN_EXE_mediabox-mock-ffmpeg` so
//! no real ffmpeg/ffprobe installation is required to run the suite.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use mediabox::cache::DirectoryCache;
use mediabox::decision::{Action, DecisionFlags, TargetScope};
use mediabox::runner::{self, RunOutcome, RunnerConfig};
use mediabox::AppConfig;

/// `ENABLE_PLEX_NOTIFICATIONS`/`MEDIABOX_MOCK_*` are read from the process
/// environment by every worker thread; serialize the whole suite so one
/// test's env vars can't bleed into another's.
static ENV_GUARD: Mutex<()> = Mutex::new(());

fn mock_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mediabox-mock-ffmpeg"))
}

fn runner_config(dir: &Path) -> RunnerConfig {
    RunnerConfig {
        ffprobe_path: mock_binary(),
        ffmpeg_path: mock_binary(),
        lock_stale_after: Duration::from_secs(1800),
        flags: DecisionFlags::default(),
        app_config: AppConfig {
            target_directories: vec![dir.to_string_lossy().into_owned()],
            ..AppConfig::default()
        },
    }
}

fn hevc_hdr_probe_json() -> &'static str {
    r#"{"streams":[
        {"index":0,"codec_type":"video","codec_name":"hevc","width":3840,"height":2160,
         "pix_fmt":"yuv420p10le","color_transfer":"smpte2084","color_primaries":"bt2020",
         "disposition":{"default":1,"forced":0}},
        {"index":1,"codec_type":"audio","codec_name":"truehd","channels":8,
         "channel_layout":"7.1","tags":{"language":"eng"},"disposition":{"default":1,"forced":0}}
    ],"format":{"format_name":"matroska,webm","duration":"3600.0","bit_rate":"20000000"}}"#
}

fn foreign_only_audio_probe_json() -> &'static str {
    r#"{"streams":[
        {"index":0,"codec_type":"video","codec_name":"h264","width":1920,"height":1080,
         "pix_fmt":"yuv420p","disposition":{"default":1,"forced":0}},
        {"index":1,"codec_type":"audio","codec_name":"aac","channels":2,
         "channel_layout":"stereo","tags":{"language":"fre"},"disposition":{"default":1,"forced":0}}
    ],"format":{"format_name":"mov,mp4,m4a,3gp,3g2,mj2","duration":"90.0","bit_rate":"900000"}}"#
}

fn already_compliant_probe_json() -> &'static str {
    r#"{"streams":[
        {"index":0,"codec_type":"video","codec_name":"h264","width":1920,"height":1080,
         "pix_fmt":"yuv420p","disposition":{"default":1,"forced":0}},
        {"index":1,"codec_type":"audio","codec_name":"aac","channels":2,
         "channel_layout":"stereo","tags":{"language":"eng"},"disposition":{"default":1,"forced":0}}
    ],"format":{"format_name":"mov,mp4,m4a,3gp,3g2,mj2","duration":"120.0","bit_rate":"1000000"}}"#
}

fn write_sample(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"not a real container, just a fixture").unwrap();
    path
}

#[test]
fn transcodes_hdr_surround_file_and_populates_cache() {
    let _guard = ENV_GUARD.lock().unwrap();
    unsafe { std::env::set_var("MEDIABOX_MOCK_PROBE_JSON", hevc_hdr_probe_json()); }
    unsafe { std::env::remove_var("MEDIABOX_MOCK_FFMPEG_EXIT_CODE"); }

    let dir = tempfile::tempdir().unwrap();
    let input = write_sample(dir.path(), "movie.mkv");
    let cfg = runner_config(dir.path());

    let outcome = runner::run_one(&input, &cfg).expect("run_one should succeed");
    match outcome {
        RunOutcome::Transcoded { new_path } => {
            assert!(new_path.exists(), "transcoded output should exist");
            assert_eq!(new_path.extension().unwrap(), "mp4");
        }
        RunOutcome::Skipped { .. } => panic!("expected a transcode, got a skip"),
    }

    let cache = DirectoryCache::load(dir.path()).unwrap();
    assert_eq!(cache.0.len(), 1, "exactly one cache entry should be recorded");
    let entry = cache.0.values().next().unwrap();
    assert!(entry.is_hdr);
    assert_eq!(entry.action, Action::Skip, "post-conversion entries are recorded as settled");

    unsafe { std::env::remove_var("MEDIABOX_MOCK_PROBE_JSON"); }
}

#[test]
fn second_run_is_a_cache_hit_and_never_invokes_ffmpeg() {
    let _guard = ENV_GUARD.lock().unwrap();
    unsafe { std::env::set_var("MEDIABOX_MOCK_PROBE_JSON", hevc_hdr_probe_json()); }

    let dir = tempfile::tempdir().unwrap();
    let input = write_sample(dir.path(), "movie.mkv");
    let cfg = runner_config(dir.path());

    let first = runner::run_one(&input, &cfg).unwrap();
    let RunOutcome::Transcoded { new_path } = first else {
        panic!("first run should transcode");
    };

    let second = runner::run_one(&new_path, &cfg).expect("second run should see a settled cache entry");
    assert!(matches!(second, RunOutcome::Skipped { action: Action::Skip }));

    unsafe { std::env::remove_var("MEDIABOX_MOCK_PROBE_JSON"); }
}

#[test]
fn foreign_only_audio_is_recorded_as_skip_no_english() {
    let _guard = ENV_GUARD.lock().unwrap();
    unsafe { std::env::set_var("MEDIABOX_MOCK_PROBE_JSON", foreign_only_audio_probe_json()); }

    let dir = tempfile::tempdir().unwrap();
    let input = write_sample(dir.path(), "foreign.mkv");
    let cfg = runner_config(dir.path());

    let err = runner::run_one(&input, &cfg).expect_err("no qualifying audio should be an error");
    assert!(matches!(err, mediabox::EngineError::Decision(_)));

    let cache = DirectoryCache::load(dir.path()).unwrap();
    let entry = cache.0.values().next().unwrap();
    assert_eq!(entry.action, Action::SkipNoEnglish);

    unsafe { std::env::remove_var("MEDIABOX_MOCK_PROBE_JSON"); }
}

#[test]
fn already_compliant_file_is_skipped_without_running_ffmpeg() {
    let _guard = ENV_GUARD.lock().unwrap();
    unsafe { std::env::set_var("MEDIABOX_MOCK_PROBE_JSON", already_compliant_probe_json()); }

    let dir = tempfile::tempdir().unwrap();
    let input = write_sample(dir.path(), "already_good.mp4");
    let cfg = runner_config(dir.path());

    let outcome = runner::run_one(&input, &cfg).unwrap();
    assert!(matches!(outcome, RunOutcome::Skipped { action: Action::Skip }));
    assert!(input.exists(), "no-op plan must never touch the original file");

    unsafe { std::env::remove_var("MEDIABOX_MOCK_PROBE_JSON"); }
}

#[test]
fn video_only_scope_transcodes_without_requiring_english_audio() {
    let _guard = ENV_GUARD.lock().unwrap();
    unsafe { std::env::set_var("MEDIABOX_MOCK_PROBE_JSON", hevc_hdr_probe_json()); }

    let dir = tempfile::tempdir().unwrap();
    let input = write_sample(dir.path(), "movie.mkv");
    let mut cfg = runner_config(dir.path());
    cfg.flags = DecisionFlags {
        scope: TargetScope::Video,
        ..DecisionFlags::default()
    };

    let outcome = runner::run_one(&input, &cfg).expect("video-only scope should still transcode");
    assert!(matches!(outcome, RunOutcome::Transcoded { .. }));

    unsafe { std::env::remove_var("MEDIABOX_MOCK_PROBE_JSON"); }
}

#[test]
fn ffmpeg_failure_is_recorded_with_a_conversion_error_and_leaves_original_intact() {
    let _guard = ENV_GUARD.lock().unwrap();
    unsafe { std::env::set_var("MEDIABOX_MOCK_PROBE_JSON", hevc_hdr_probe_json()); }
    unsafe { std::env::set_var("MEDIABOX_MOCK_FFMPEG_EXIT_CODE", "1"); }
    unsafe { std::env::set_var("MEDIABOX_MOCK_FFMPEG_STDERR", "synthetic encoder failure"); }

    let dir = tempfile::tempdir().unwrap();
    let input = write_sample(dir.path(), "movie.mkv");
    let cfg = runner_config(dir.path());

    let err = runner::run_one(&input, &cfg).expect_err("nonzero ffmpeg exit should surface as an error");
    assert!(matches!(err, mediabox::EngineError::Transcode(_)));
    assert!(input.exists(), "failed transcode must never disturb the original");

    let cache = DirectoryCache::load(dir.path()).unwrap();
    let entry = cache.0.values().next().unwrap();
    assert!(entry.last_conversion_error.is_some());

    unsafe { std::env::remove_var("MEDIABOX_MOCK_PROBE_JSON"); }
    unsafe { std::env::remove_var("MEDIABOX_MOCK_FFMPEG_EXIT_CODE"); }
    unsafe { std::env::remove_var("MEDIABOX_MOCK_FFMPEG_STDERR"); }
}

#[test]
fn held_lock_prevents_concurrent_processing_of_the_same_file() {
    let _guard = ENV_GUARD.lock().unwrap();
    unsafe { std::env::set_var("MEDIABOX_MOCK_PROBE_JSON", hevc_hdr_probe_json()); }

    let dir = tempfile::tempdir().unwrap();
    let input = write_sample(dir.path(), "locked.mkv");
    let cfg = runner_config(dir.path());

    let held = mediabox::lock::acquire(&input, Duration::from_secs(1800)).unwrap();
    let err = runner::run_one(&input, &cfg).expect_err("a held lock must block the runner");
    assert!(matches!(err, mediabox::EngineError::Lock(_)));
    drop(held);

    unsafe { std::env::remove_var("MEDIABOX_MOCK_PROBE_JSON"); }
}
