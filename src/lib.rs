//! Media transcoding decision & execution engine, split into modular
//! components (`probe`, `cache`, `lock`, `decision`, `filtergraph`, `runner`,
//! `scheduler`, `notifier`) matching the responsibilities laid out for the
//! Engine: decide which ffmpeg transforms a file needs, build one correct
//! invocation realizing them, and persist the outcome in a per-directory
//! cache.

pub mod cache;
pub mod config;
pub mod decision;
pub mod error;
pub mod filtergraph;
pub mod fingerprint;
pub mod lock;
pub mod logging;
pub mod notifier;
pub mod probe;
pub mod runner;
pub mod scheduler;
mod sync_ext;

pub use cache::{CacheEntry, DirectoryCache};
pub use config::AppConfig;
pub use decision::{AudioStreamPlan, DecisionFlags, TransformPlan, decide};
pub use error::{CacheError, DecisionError, EngineError, LockError, ProbeError, TranscodeError};
pub use fingerprint::Fingerprint;
pub use probe::ProbeSummary;
