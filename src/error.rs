//! Error taxonomy for the engine. Each component that callers must branch on
//! gets a `thiserror` enum; leaf-level fallible helpers keep using
//! `anyhow::Result` with `.context()`, keeping domain errors separate from
//! call-site plumbing.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe exited with status {status} for {path}: {stderr}")]
    NonZeroExit {
        path: PathBuf,
        status: i32,
        stderr: String,
    },
    #[error("ffprobe produced unparseable JSON for {path}: {source}")]
    Unparseable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("ffprobe returned no streams for {path}")]
    EmptyStreams { path: PathBuf },
    #[error("failed to launch ffprobe for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("locked by {hostname} (pid {pid}, {age_secs}s ago)")]
    HeldBy {
        hostname: String,
        pid: u32,
        age_secs: u64,
    },
    #[error("lock unavailable for {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse cache file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write cache file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("no English or unlabeled audio")]
    NoEnglishAudio,
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("ffmpeg exited with status {status}: {log_excerpt}")]
    FfmpegFailed { status: i32, log_excerpt: String },
    #[error("ffmpeg timed out after {elapsed_secs}s")]
    TimedOut { elapsed_secs: u64 },
    #[error("validation failed for transcoded output: {reason}")]
    ValidationFailed { reason: String },
    #[error("io error during transcode: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error a CLI entry point matches on to pick an exit code.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input error: {0}")]
    Input(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}

impl EngineError {
    /// Maps an error onto its process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Input(_) | EngineError::Probe(_) | EngineError::Cache(_) => 1,
            EngineError::Transcode(_) => 2,
            EngineError::Decision(DecisionError::NoEnglishAudio) => 3,
            EngineError::Lock(_) => 4,
        }
    }
}
