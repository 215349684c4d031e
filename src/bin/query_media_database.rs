//! `query-media-database` — reads cache entries across one or more
//! directory trees and filters/reports on them without touching any media
//! file.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mediabox::cache::{CacheEntry, DirectoryCache};
use mediabox::logging::{self, LogLevel};
use mediabox::probe::HdrType;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "query-media-database", about = "Query the per-directory media cache")]
struct Args {
    #[arg(long)]
    hdr: bool,
    #[arg(long = "needs-conversion")]
    needs_conversion: bool,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    resolution: Option<String>,
    #[arg(long)]
    stats: bool,
    #[arg(long)]
    export: Option<PathBuf>,
    #[arg(long = "export-json")]
    export_json: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    #[arg(long)]
    log_json: bool,
    #[arg(required = true)]
    dirs: Vec<PathBuf>,
}

fn matches_filters(entry: &CacheEntry, args: &Args) -> bool {
    if args.hdr && !entry.is_hdr {
        return false;
    }
    if args.needs_conversion && matches!(entry.action, mediabox::decision::Action::Skip) {
        return false;
    }
    if let Some(term) = &args.search {
        let haystack = format!("{} {}", entry.file_name, entry.file_path).to_ascii_lowercase();
        if !haystack.contains(&term.to_ascii_lowercase()) {
            return false;
        }
    }
    if let Some(res) = &args.resolution {
        if entry.resolution.as_deref() != Some(res.as_str()) {
            return false;
        }
    }
    true
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_level, args.log_json);
    let entries = DirectoryCache::query(&args.dirs, |entry| matches_filters(entry, &args));

    if args.stats {
        let mut hdr_count = 0u64;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for entry in &entries {
            if entry.is_hdr {
                hdr_count += 1;
            }
            *counts.entry(format!("{:?}", entry.action)).or_insert(0) += 1;
        }
        let mut summary: HashMap<&str, serde_json::Value> = HashMap::new();
        summary.insert("total", serde_json::json!(entries.len()));
        summary.insert("hdr", serde_json::json!(hdr_count));
        summary.insert("by_action", serde_json::json!(counts));
        println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
        return ExitCode::SUCCESS;
    }

    if let Some(path) = &args.export_json {
        match serde_json::to_vec_pretty(&entries) {
            Ok(data) => {
                if let Err(err) = fs::write(path, data) {
                    error!(error = %err, "failed to write export-json");
                    return ExitCode::from(1);
                }
            }
            Err(err) => {
                error!(error = %err, "failed to serialize entries");
                return ExitCode::from(1);
            }
        }
        return ExitCode::SUCCESS;
    }

    if let Some(path) = &args.export {
        match export_csv(&entries, path) {
            Ok(()) => return ExitCode::SUCCESS,
            Err(err) => {
                error!(error = %err, "failed to write export");
                return ExitCode::from(1);
            }
        }
    }

    for entry in &entries {
        let hdr = match entry.hdr_type {
            HdrType::None => "sdr",
            HdrType::Hdr10 => "hdr10",
            HdrType::Hlg => "hlg",
            HdrType::DolbyVision => "dolby-vision",
        };
        println!(
            "{}\t{}\t{:?}\t{}",
            entry.file_path,
            entry.resolution.as_deref().unwrap_or("?"),
            entry.action,
            hdr
        );
    }

    ExitCode::SUCCESS
}

fn export_csv(entries: &[CacheEntry], path: &PathBuf) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "file_path,resolution,action,is_hdr,duration")?;
    for entry in entries {
        writeln!(
            file,
            "{},{},{:?},{},{}",
            entry.file_path,
            entry.resolution.as_deref().unwrap_or(""),
            entry.action,
            entry.is_hdr,
            entry.duration
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let entries = vec![];
        export_csv(&entries, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("file_path,resolution,action,is_hdr,duration"));
    }
}
