//! Probe Adapter (C1): runs `ffprobe -v quiet -print_format json -show_streams
//! -show_format <file>` and normalizes the result into `ProbeSummary`.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HdrType {
    None,
    Hdr10,
    Hlg,
    DolbyVision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoStream {
    pub index: usize,
    /// 0-based position among video streams only — the `N` ffmpeg's
    /// `0:v:N` stream specifier expects, distinct from the absolute
    /// `index` above.
    pub relative_index: usize,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<String>,
    pub bit_depth: Option<u32>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub color_space: Option<String>,
    pub hdr_type: HdrType,
    pub has_dv_side_data: bool,
}

/// Three-way distinction load-bearing for the channelmap repair decision:
/// present-and-known, known to be `"unknown"`, or the key absent entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Known(String),
    Unknown,
    Absent,
}

impl ChannelLayout {
    pub fn is_present(&self) -> bool {
        matches!(self, ChannelLayout::Known(_))
    }

    pub fn as_known(&self) -> Option<&str> {
        match self {
            ChannelLayout::Known(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioStream {
    pub index: usize,
    /// 0-based position among audio streams only — the `N` ffmpeg's
    /// `0:a:N` stream specifier expects, distinct from the absolute
    /// `index` above.
    pub relative_index: usize,
    pub codec: String,
    pub channels: u32,
    pub channel_layout: ChannelLayout,
    pub language: Option<String>,
    pub title: Option<String>,
    pub default: bool,
    pub forced: bool,
    pub bit_rate: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleStream {
    pub index: usize,
    /// 0-based position among subtitle streams only — the `N` ffmpeg's
    /// `0:s:N` stream specifier expects, distinct from the absolute
    /// `index` above.
    pub relative_index: usize,
    pub codec: String,
    pub language: Option<String>,
    pub forced: bool,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSummary {
    pub container: String,
    pub duration: f64,
    pub bitrate: Option<u64>,
    pub video: Vec<VideoStream>,
    pub audio: Vec<AudioStream>,
    pub subtitle: Vec<SubtitleStream>,
}

// --- raw ffprobe JSON shape -------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawProbe {
    #[serde(default)]
    streams: Vec<RawStream>,
    #[serde(default)]
    format: Option<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDisposition {
    #[serde(default)]
    default: u8,
    #[serde(default)]
    forced: u8,
}

#[derive(Debug, Default, Deserialize)]
struct RawTags {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "DOVI", default)]
    dovi: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawSideData {
    #[serde(default)]
    side_data_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    index: usize,
    codec_type: String,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    pix_fmt: Option<String>,
    #[serde(default)]
    bits_per_raw_sample: Option<String>,
    #[serde(default)]
    color_transfer: Option<String>,
    #[serde(default)]
    color_primaries: Option<String>,
    #[serde(default)]
    color_space: Option<String>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    channel_layout: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    disposition: RawDisposition,
    #[serde(default)]
    tags: Option<RawTags>,
    #[serde(default)]
    side_data_list: Vec<RawSideData>,
}

fn parse_duration(raw: &Option<String>) -> f64 {
    raw.as_deref()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0)
}

fn parse_bitrate(raw: &Option<String>) -> Option<u64> {
    raw.as_deref().and_then(|s| s.trim().parse::<u64>().ok())
}

fn bit_depth_from_pix_fmt(pix_fmt: &Option<String>, raw_bits: &Option<String>) -> Option<u32> {
    if let Some(bits) = raw_bits.as_deref().and_then(|s| s.parse::<u32>().ok()) {
        return Some(bits);
    }
    let fmt = pix_fmt.as_deref()?;
    if fmt.contains("p10") {
        Some(10)
    } else if fmt.contains("p12") {
        Some(12)
    } else {
        Some(8)
    }
}

/// HDR detection, checked in strict priority order.
fn classify_hdr(
    has_dv_side_data: bool,
    color_transfer: &Option<String>,
    color_primaries: &Option<String>,
    bit_depth: Option<u32>,
) -> HdrType {
    if has_dv_side_data {
        return HdrType::DolbyVision;
    }
    if color_transfer.as_deref() == Some("arib-std-b67") {
        return HdrType::Hlg;
    }
    let is_pq = color_transfer.as_deref() == Some("smpte2084");
    let is_bt2020_deep = color_primaries.as_deref() == Some("bt2020") && bit_depth.unwrap_or(8) >= 10;
    if is_pq || is_bt2020_deep {
        return HdrType::Hdr10;
    }
    HdrType::None
}

fn looks_like_dolby_vision_tag(tags: &Option<RawTags>) -> bool {
    tags.as_ref().is_some_and(|t| t.dovi.is_some())
}

fn normalize(raw: RawProbe, path: &Path) -> Result<ProbeSummary, ProbeError> {
    if raw.streams.is_empty() {
        return Err(ProbeError::EmptyStreams {
            path: path.to_path_buf(),
        });
    }

    let format = raw.format.as_ref();
    let container = format
        .and_then(|f| f.format_name.clone())
        .unwrap_or_default();
    let duration = parse_duration(&format.and_then(|f| f.duration.clone()));
    let bitrate = format.and_then(|f| parse_bitrate(&f.bit_rate));

    let mut video = Vec::new();
    let mut audio = Vec::new();
    let mut subtitle = Vec::new();

    let mut next_video_index = 0usize;
    let mut next_audio_index = 0usize;
    let mut next_subtitle_index = 0usize;

    for s in raw.streams {
        match s.codec_type.as_str() {
            "video" => {
                let bit_depth = bit_depth_from_pix_fmt(&s.pix_fmt, &s.bits_per_raw_sample);
                let has_dv_side_data = s
                    .side_data_list
                    .iter()
                    .any(|sd| {
                        sd.side_data_type
                            .as_deref()
                            .is_some_and(|t| t.contains("DOVI") || t.contains("Dolby Vision"))
                    })
                    || looks_like_dolby_vision_tag(&s.tags);
                let hdr_type =
                    classify_hdr(has_dv_side_data, &s.color_transfer, &s.color_primaries, bit_depth);
                video.push(VideoStream {
                    index: s.index,
                    relative_index: next_video_index,
                    codec: s.codec_name.unwrap_or_default(),
                    width: s.width.unwrap_or(0),
                    height: s.height.unwrap_or(0),
                    pix_fmt: s.pix_fmt,
                    bit_depth,
                    color_transfer: s.color_transfer,
                    color_primaries: s.color_primaries,
                    color_space: s.color_space,
                    hdr_type,
                    has_dv_side_data,
                });
                next_video_index += 1;
            }
            "audio" => {
                let channel_layout = match s.channel_layout.as_deref() {
                    Some("unknown") => ChannelLayout::Unknown,
                    Some(other) => ChannelLayout::Known(other.to_string()),
                    None => ChannelLayout::Absent,
                };
                audio.push(AudioStream {
                    index: s.index,
                    relative_index: next_audio_index,
                    codec: s.codec_name.unwrap_or_default(),
                    channels: s.channels.unwrap_or(0),
                    channel_layout,
                    language: s.tags.as_ref().and_then(|t| t.language.clone()),
                    title: s.tags.as_ref().and_then(|t| t.title.clone()),
                    default: s.disposition.default != 0,
                    forced: s.disposition.forced != 0,
                    bit_rate: parse_bitrate(&s.bit_rate),
                });
                next_audio_index += 1;
            }
            "subtitle" => {
                subtitle.push(SubtitleStream {
                    index: s.index,
                    relative_index: next_subtitle_index,
                    codec: s.codec_name.unwrap_or_default(),
                    language: s.tags.as_ref().and_then(|t| t.language.clone()),
                    forced: s.disposition.forced != 0,
                    title: s.tags.as_ref().and_then(|t| t.title.clone()),
                });
                next_subtitle_index += 1;
            }
            _ => {}
        }
    }

    Ok(ProbeSummary {
        container,
        duration,
        bitrate,
        video,
        audio,
        subtitle,
    })
}

/// Runs `ffprobe` against `path` and normalizes the result. Failures are
/// never retried by this layer — callers log and skip the file.
pub fn probe(ffprobe_path: &Path, path: &Path) -> Result<ProbeSummary, ProbeError> {
    let output = Command::new(ffprobe_path)
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(path.as_os_str())
        .output()
        .map_err(|source| ProbeError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProbeError::NonZeroExit {
            path: path.to_path_buf(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let raw: RawProbe =
        serde_json::from_slice(&output.stdout).map_err(|source| ProbeError::Unparseable {
            path: path.to_path_buf(),
            source,
        })?;

    normalize(raw, path)
}

/// Default ffprobe binary path resolution: `$FFPROBE_PATH` if set, else
/// `ffprobe` on `$PATH`.
pub fn default_ffprobe_path() -> PathBuf {
    std::env::var("FFPROBE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ffprobe"))
}
