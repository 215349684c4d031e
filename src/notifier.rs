//! Rescan Notifier (C8): best-effort HTTP nudge to a media server after a
//! successful transcode, so a renamed/replaced file is picked back up
//! without waiting for the server's own library scan interval. Built on
//! `reqwest`'s blocking client — there is no async runtime anywhere in this
//! crate, so the client is used directly rather than wrapping a single POST
//! in one just for this.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::config::AppConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

fn build_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client for rescan notification")
}

/// Maps a local file path onto the Plex-facing path, rewriting any
/// configured network-mount prefix (`plex_integration.path_mappings`).
fn remap_path(cfg: &AppConfig, path: &Path) -> String {
    let local = path.to_string_lossy().into_owned();
    for (from, to) in &cfg.plex_integration.path_mappings {
        if let Some(rest) = local.strip_prefix(from.as_str()) {
            return format!("{to}{rest}");
        }
    }
    local
}

/// Determines which configured library directory `path` falls under, so the
/// request can be scoped to that library section rather than triggering a
/// full-server rescan. Returns `None` when `path` isn't under any configured
/// directory, in which case notification is skipped entirely.
fn resolve_library_prefix<'a>(cfg: &'a AppConfig, path: &Path) -> Option<(&'static str, &'a str)> {
    let dirs = cfg.library_dirs.as_ref()?;
    let candidates: [(&'static str, &Option<String>); 4] = [
        ("tv", &dirs.tv),
        ("movies", &dirs.movies),
        ("music", &dirs.music),
        ("misc", &dirs.misc),
    ];
    candidates.into_iter().find_map(|(name, dir)| {
        let dir = dir.as_deref()?;
        path.starts_with(dir).then_some((name, dir))
    })
}

/// Sends the rescan request. No-ops (returns `Ok(())`) when notifications
/// are disabled or no URL is configured — this path must never block a
/// transcode's success on a media server being reachable.
pub fn notify_rescan(cfg: &AppConfig, path: &Path) -> Result<()> {
    if !cfg.notifications_enabled() {
        debug!("rescan notifications disabled, skipping");
        return Ok(());
    }

    let Some(url) = cfg.plex_integration.url.as_deref() else {
        debug!("no plex_integration.url configured, skipping rescan notification");
        return Ok(());
    };

    let Some((section, _)) = resolve_library_prefix(cfg, path) else {
        debug!(file = %path.display(), "path is outside configured library_dirs, skipping");
        return Ok(());
    };

    let remapped = remap_path(cfg, path);
    let client = build_client()?;

    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        let mut req = client.post(url).query(&[("section", section), ("path", &remapped)]);
        if let Some(token) = cfg.plex_integration.token.as_deref() {
            req = req.header("X-Plex-Token", token);
        }
        match req.send() {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                last_err = Some(format!("server returned status {}", resp.status()));
            }
            Err(err) => {
                last_err = Some(err.to_string());
            }
        }
        if attempt < MAX_ATTEMPTS {
            warn!(attempt, "rescan notification attempt failed, retrying");
            std::thread::sleep(Duration::from_millis(250 * attempt as u64));
        }
    }

    bail!(
        "rescan notification failed after {MAX_ATTEMPTS} attempts: {}",
        last_err.unwrap_or_default()
    )
}
