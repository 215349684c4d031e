//! Fingerprint & Cache Store (C2): a per-directory JSON cache keyed by
//! `Fingerprint → CacheEntry`, persisted as `.mediabox_cache.json` next to
//! the media files it describes. Writes are atomic: serialize to a temp
//! file in the same directory, then rename over the final path.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::Action;
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::probe::{HdrType, ProbeSummary};

pub const CACHE_FILE_NAME: &str = ".mediabox_cache.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub file_name: String,
    /// Informational only — never part of the cache key.
    pub file_path: String,
    pub file_size: u64,
    pub file_mtime: f64,
    pub last_scanned: DateTime<Utc>,
    pub codec_video: Option<String>,
    pub codec_audio: Option<String>,
    pub resolution: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: f64,
    pub bitrate: Option<u64>,
    pub is_hdr: bool,
    pub hdr_type: HdrType,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub color_space: Option<String>,
    pub bit_depth: Option<u32>,
    pub audio_channels: Option<u32>,
    pub audio_layout: Option<String>,
    pub has_stereo_track: bool,
    pub has_surround_track: bool,
    pub action: Action,
    pub conversion_params: Option<String>,
    pub processing_version: u32,
    #[serde(default)]
    pub conversion_count: u32,
    #[serde(default)]
    pub last_conversion_duration: Option<f64>,
    #[serde(default)]
    pub last_conversion_error: Option<String>,
}

pub const PROCESSING_VERSION: u32 = 1;

impl CacheEntry {
    pub fn from_probe(
        fingerprint: Fingerprint,
        path: &Path,
        size: u64,
        mtime: f64,
        probe: &ProbeSummary,
        action: Action,
        conversion_params: Option<String>,
    ) -> Self {
        let primary_video = probe.video.first();
        let primary_audio = probe.audio.first();
        let has_stereo_track = probe.audio.iter().any(|a| a.channels == 2);
        let has_surround_track = probe.audio.iter().any(|a| a.channels >= 6);

        CacheEntry {
            fingerprint: fingerprint.to_hex(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_path: path.to_string_lossy().into_owned(),
            file_size: size,
            file_mtime: mtime,
            last_scanned: Utc::now(),
            codec_video: primary_video.map(|v| v.codec.clone()),
            codec_audio: primary_audio.map(|a| a.codec.clone()),
            resolution: primary_video.map(|v| format!("{}x{}", v.width, v.height)),
            width: primary_video.map(|v| v.width),
            height: primary_video.map(|v| v.height),
            duration: probe.duration,
            bitrate: probe.bitrate,
            is_hdr: primary_video.is_some_and(|v| v.hdr_type != HdrType::None),
            hdr_type: primary_video.map(|v| v.hdr_type).unwrap_or(HdrType::None),
            color_transfer: primary_video.and_then(|v| v.color_transfer.clone()),
            color_primaries: primary_video.and_then(|v| v.color_primaries.clone()),
            color_space: primary_video.and_then(|v| v.color_space.clone()),
            bit_depth: primary_video.and_then(|v| v.bit_depth),
            audio_channels: primary_audio.map(|a| a.channels),
            audio_layout: primary_audio.and_then(|a| a.channel_layout.as_known().map(str::to_string)),
            has_stereo_track,
            has_surround_track,
            action,
            conversion_params,
            processing_version: PROCESSING_VERSION,
            conversion_count: 0,
            last_conversion_duration: None,
            last_conversion_error: None,
        }
    }
}

/// `Fingerprint → CacheEntry`, one JSON object per directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryCache(pub HashMap<String, CacheEntry>);

impl DirectoryCache {
    pub fn cache_path_for_dir(dir: &Path) -> PathBuf {
        dir.join(CACHE_FILE_NAME)
    }

    pub fn cache_path_for_file(path: &Path) -> PathBuf {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::cache_path_for_dir(dir)
    }

    pub fn load(dir: &Path) -> Result<Self, CacheError> {
        let path = Self::cache_path_for_dir(dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = fs::File::open(&path).map_err(|source| CacheError::Read {
            path: path.clone(),
            source,
        })?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|source| CacheError::Parse { path, source })
    }

    /// Atomic write: serialize to `<path>.tmp`, then rename over the target.
    /// Readers never observe a partially-written JSON document.
    pub fn save(&self, dir: &Path) -> Result<(), CacheError> {
        let path = Self::cache_path_for_dir(dir);
        let tmp_path = path.with_extension("tmp");
        let file = fs::File::create(&tmp_path).map_err(|source| CacheError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        serde_json::to_writer_pretty(&file, self).map_err(|source| CacheError::Write {
            path: tmp_path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, source),
        })?;
        fs::rename(&tmp_path, &path).map_err(|source| CacheError::Write { path, source })?;
        Ok(())
    }

    pub fn get(dir: &Path, fingerprint: Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let cache = Self::load(dir)?;
        Ok(cache.0.get(&fingerprint.to_hex()).cloned())
    }

    pub fn put(&mut self, fingerprint: Fingerprint, entry: CacheEntry) {
        self.0.insert(fingerprint.to_hex(), entry);
    }

    /// Recomputes the fingerprint (the transform changed size/mtime),
    /// inserts under the new key, and drops the old one.
    pub fn update_after(
        &mut self,
        old_fingerprint: Fingerprint,
        new_fingerprint: Fingerprint,
        entry: CacheEntry,
    ) {
        self.0.remove(&old_fingerprint.to_hex());
        self.0.insert(new_fingerprint.to_hex(), entry);
    }

    /// Removes entries whose files no longer exist under `dir`, or whose
    /// `last_scanned` is older than `max_age`. Returns the count removed.
    pub fn cleanup(dir: &Path, max_age: chrono::Duration) -> Result<usize, CacheError> {
        let mut cache = Self::load(dir)?;
        let cutoff = Utc::now() - max_age;
        let before = cache.0.len();
        cache.0.retain(|_, entry| {
            let file_path = dir.join(&entry.file_name);
            file_path.exists() && entry.last_scanned >= cutoff
        });
        let removed = before - cache.0.len();
        if removed > 0 {
            cache.save(dir)?;
        }
        Ok(removed)
    }

    /// Scans `.mediabox_cache.json` files under every directory in `dirs`
    /// (non-recursive — each cache file only ever describes its own
    /// directory) and returns entries matching `filter`.
    pub fn query<F>(dirs: &[PathBuf], filter: F) -> Vec<CacheEntry>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut out = Vec::new();
        for dir in dirs {
            for entry in walk_cache_files(dir) {
                if let Ok(cache) = Self::load_from_cache_file(&entry) {
                    out.extend(cache.0.into_values().filter(|e| filter(e)));
                }
            }
        }
        out
    }

    fn load_from_cache_file(cache_file: &Path) -> Result<Self, CacheError> {
        let file = fs::File::open(cache_file).map_err(|source| CacheError::Read {
            path: cache_file.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|source| CacheError::Parse {
            path: cache_file.to_path_buf(),
            source,
        })
    }
}

fn walk_cache_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(CACHE_FILE_NAME) {
                found.push(path);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(fp: &str) -> CacheEntry {
        CacheEntry {
            fingerprint: fp.to_string(),
            file_name: "movie.mkv".into(),
            file_path: "/tv/movie.mkv".into(),
            file_size: 100,
            file_mtime: 1.0,
            last_scanned: Utc::now(),
            codec_video: Some("h264".into()),
            codec_audio: Some("aac".into()),
            resolution: Some("1920x1080".into()),
            width: Some(1920),
            height: Some(1080),
            duration: 3600.0,
            bitrate: Some(5_000_000),
            is_hdr: false,
            hdr_type: HdrType::None,
            color_transfer: None,
            color_primaries: None,
            color_space: None,
            bit_depth: Some(8),
            audio_channels: Some(2),
            audio_layout: Some("stereo".into()),
            has_stereo_track: true,
            has_surround_track: false,
            action: Action::Skip,
            conversion_params: None,
            processing_version: PROCESSING_VERSION,
            conversion_count: 0,
            last_conversion_duration: None,
            last_conversion_error: None,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let mut cache = DirectoryCache::default();
        cache.put(
            Fingerprint::compute("movie.mkv", 100, 1.0),
            sample_entry("abc"),
        );
        cache.save(dir.path()).unwrap();

        let loaded = DirectoryCache::load(dir.path()).unwrap();
        assert_eq!(loaded.0.len(), 1);
    }

    #[test]
    fn atomic_save_never_leaves_tmp_file_behind() {
        let dir = tempdir().unwrap();
        let mut cache = DirectoryCache::default();
        cache.put(
            Fingerprint::compute("movie.mkv", 100, 1.0),
            sample_entry("abc"),
        );
        cache.save(dir.path()).unwrap();
        assert!(!dir.path().join(".mediabox_cache.json.tmp").exists());
        assert!(dir.path().join(CACHE_FILE_NAME).exists());
    }

    #[test]
    fn update_after_drops_old_key_and_inserts_new() {
        let dir = tempdir().unwrap();
        let mut cache = DirectoryCache::default();
        let old_fp = Fingerprint::compute("movie.mkv", 100, 1.0);
        cache.put(old_fp, sample_entry(&old_fp.to_hex()));

        let new_fp = Fingerprint::compute("movie.mp4", 200, 2.0);
        cache.update_after(old_fp, new_fp, sample_entry(&new_fp.to_hex()));

        assert!(!cache.0.contains_key(&old_fp.to_hex()));
        assert!(cache.0.contains_key(&new_fp.to_hex()));
        assert_eq!(cache.0.len(), 1);
        cache.save(dir.path()).unwrap();
    }

    #[test]
    fn cleanup_removes_missing_files() {
        let dir = tempdir().unwrap();
        let mut cache = DirectoryCache::default();
        cache.put(
            Fingerprint::compute("gone.mkv", 100, 1.0),
            sample_entry("gone"),
        );
        cache.save(dir.path()).unwrap();

        let removed = DirectoryCache::cleanup(dir.path(), chrono::Duration::days(30)).unwrap();
        assert_eq!(removed, 1);
        let loaded = DirectoryCache::load(dir.path()).unwrap();
        assert!(loaded.0.is_empty());
    }

    #[test]
    fn cleanup_keeps_entries_for_existing_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mkv"), b"data").unwrap();
        let mut cache = DirectoryCache::default();
        cache.put(
            Fingerprint::compute("movie.mkv", 100, 1.0),
            sample_entry("present"),
        );
        cache.save(dir.path()).unwrap();

        let removed = DirectoryCache::cleanup(dir.path(), chrono::Duration::days(30)).unwrap();
        assert_eq!(removed, 0);
    }
}
