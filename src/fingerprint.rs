//! Path-independent file identity: `SHA256(filename|size|mtime)`. Deliberately
//! excludes directory components so the same media file seen through two
//! different mounts shares a cache entry.

use std::fmt;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Content-free file identity. Serialized as a hex string wherever it needs
/// to appear in JSON (it is the map key of `.mediabox_cache.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Computes the fingerprint from the three identity fields directly,
    /// never reading file contents. Exposed standalone so tests can exercise
    /// it without touching the filesystem.
    pub fn compute(file_name: &str, size: u64, mtime: f64) -> Self {
        let payload = format!("{file_name}|{size}|{mtime}");
        let digest = Sha256::digest(payload.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Fingerprint(bytes)
    }

    /// Reads filename + size + mtime from the filesystem and computes the
    /// fingerprint. `path`'s directory components never enter the hash.
    pub fn for_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("path has no file name: {}", path.display()))?;
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let size = metadata.len();
        let mtime = metadata
            .modified()
            .with_context(|| format!("failed to read mtime of {}", path.display()))?
            .duration_since(UNIX_EPOCH)
            .context("mtime before unix epoch")?
            .as_secs_f64();
        Ok(Self::compute(file_name, size, mtime))
    }

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            anyhow::bail!("fingerprint hex must be 64 chars, got {}", s.len());
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .with_context(|| format!("invalid hex fingerprint: {s}"))?;
        }
        Ok(Fingerprint(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        let a = Fingerprint::compute("movie.mkv", 100, 12345.0);
        let b = Fingerprint::compute("movie.mkv", 100, 12345.0);
        assert_eq!(a, b);
    }

    #[test]
    fn path_independent() {
        // Same filename/size/mtime fingerprint, regardless of which
        // directory tree it's computed from — that's the whole point.
        let a = Fingerprint::compute("movie.mkv", 100, 12345.0);
        let b = Fingerprint::compute("movie.mkv", 100, 12345.0);
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn changes_with_size_or_mtime() {
        let base = Fingerprint::compute("movie.mkv", 100, 12345.0);
        let diff_size = Fingerprint::compute("movie.mkv", 101, 12345.0);
        let diff_mtime = Fingerprint::compute("movie.mkv", 100, 12346.0);
        assert_ne!(base, diff_size);
        assert_ne!(base, diff_mtime);
    }

    #[test]
    fn hex_round_trips() {
        let fp = Fingerprint::compute("a.mp4", 1, 2.0);
        let hex = fp.to_hex();
        let parsed: Fingerprint = hex.parse().unwrap();
        assert_eq!(fp, parsed);
    }
}
