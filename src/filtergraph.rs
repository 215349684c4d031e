//! Filter-Graph Builder (C5): assembles a single, deterministic ffmpeg
//! argv realizing every transform in a `TransformPlan` at once — a flat
//! `Vec<String>` of argv tokens built up by the decisions already recorded
//! in the plan, emitting the `-filter_complex`/`-map` graph a multi-track
//! audio repair pipeline requires.

use std::path::Path;

use crate::decision::{AudioStreamPlan, TransformPlan};

const TONEMAP_FILTER: &str = "zscale=t=linear:npl=100,format=gbrpf32le,zscale=p=bt709,tonemap=tonemap=hable:desat=0,zscale=t=bt709:m=bt709:r=tv,format=yuv420p";
const CHANNELMAP_51: &str = "channelmap=0-FL|1-FR|2-FC|3-LFE|4-BL|5-BR:channel_layout=5.1";
const PAN_71_TO_51: &str = "pan=5.1|c0=c0|c1=c1|c2=c2|c3=c3|c4=c4+0.7*c6|c5=c5+0.7*c7";
const PAN_STEREO: &str = "pan=stereo|c0=0.35*c0+0.5*c2+0.25*c4|c1=0.35*c1+0.5*c2+0.25*c5";
const STEREO_COMPRESSOR: &str = "acompressor=level_in=1.5:threshold=0.1:ratio=6:attack=20:release=250";

struct OutputAudioTrack {
    /// Either a filter_complex label (`Some("surround_1")`) or a direct
    /// source stream's relative index to map without filtering.
    source: AudioSource,
    codec_out: &'static str,
    language: String,
    title: Option<&'static str>,
    /// Output channel count, used to size the `-b:a:N` bitrate — tracked
    /// explicitly rather than inferred from `title`, since an
    /// already-compliant passthrough track carries no title at all.
    channels: u32,
}

enum AudioSource {
    Label(String),
    Direct(usize),
}

fn audio_bitrate_kbps(channels: u32) -> u32 {
    (channels.max(1) * 64).min(384)
}

/// Builds the `-filter_complex` segments and the ordered list of output
/// audio tracks for every stream in the plan. Every derived label is
/// suffixed with the source stream index, so two different source streams
/// can never collide, and `asplit` is used whenever a derived stream feeds
/// more than one consumer — labels must never be reused across sources.
fn build_audio_graph(plan: &TransformPlan) -> (Vec<String>, Vec<OutputAudioTrack>) {
    let mut complex = Vec::new();
    let mut outputs = Vec::new();
    let mut stereo_track: Option<OutputAudioTrack> = None;

    for a in &plan.audio_streams_in {
        let idx = a.relative_index;
        let language = a.language_tag_fix.clone().unwrap_or_else(|| "und".to_string());

        if a.channelmap_repair {
            let surround_label = format!("fixed_surround_{idx}");
            if a.emit_stereo {
                let stereo_in = format!("for_stereo_{idx}");
                complex.push(format!(
                    "[0:a:{idx}]{CHANNELMAP_51},asplit=2[{surround_label}][{stereo_in}]"
                ));
                complex.push(stereo_filter_segment(&stereo_in, idx));
                stereo_track = Some(OutputAudioTrack {
                    source: AudioSource::Label(format!("stereo_{idx}")),
                    codec_out: "aac",
                    language: "eng".to_string(),
                    title: Some("Stereo (Enhanced)"),
                    channels: 2,
                });
            } else {
                complex.push(format!("[0:a:{idx}]{CHANNELMAP_51}[{surround_label}]"));
            }
            outputs.push(OutputAudioTrack {
                source: AudioSource::Label(surround_label),
                codec_out: a.codec_out,
                language,
                title: None,
                channels: 6,
            });
            continue;
        }

        if a.surround_role && a.source_channels == 8 {
            let surround_label = format!("surround_{idx}");
            if a.emit_stereo {
                let stereo_in = format!("for_stereo_{idx}");
                complex.push(format!(
                    "[0:a:{idx}]{PAN_71_TO_51},asplit=2[{surround_label}][{stereo_in}]"
                ));
                complex.push(stereo_filter_segment(&stereo_in, idx));
                stereo_track = Some(OutputAudioTrack {
                    source: AudioSource::Label(format!("stereo_{idx}")),
                    codec_out: "aac",
                    language: "eng".to_string(),
                    title: Some("Stereo (Enhanced)"),
                    channels: 2,
                });
            } else {
                complex.push(format!("[0:a:{idx}]{PAN_71_TO_51}[{surround_label}]"));
            }
            outputs.push(OutputAudioTrack {
                source: AudioSource::Label(surround_label),
                codec_out: a.codec_out,
                language,
                title: Some("Surround 5.1"),
                channels: 6,
            });
            continue;
        }

        if a.surround_role {
            // Existing, already-compliant 6-channel surround: preserved
            // verbatim, possibly split to feed the stereo downmix.
            if a.emit_stereo {
                let surround_label = format!("surround_{idx}");
                let stereo_in = format!("for_stereo_{idx}");
                complex.push(format!("[0:a:{idx}]asplit=2[{surround_label}][{stereo_in}]"));
                complex.push(stereo_filter_segment(&stereo_in, idx));
                stereo_track = Some(OutputAudioTrack {
                    source: AudioSource::Label(format!("stereo_{idx}")),
                    codec_out: "aac",
                    language: "eng".to_string(),
                    title: Some("Stereo (Enhanced)"),
                    channels: 2,
                });
                outputs.push(OutputAudioTrack {
                    source: AudioSource::Label(surround_label),
                    codec_out: a.codec_out,
                    language,
                    title: None,
                    channels: a.source_channels,
                });
            } else {
                outputs.push(OutputAudioTrack {
                    source: AudioSource::Direct(idx),
                    codec_out: a.codec_out,
                    language,
                    title: None,
                    channels: a.source_channels,
                });
            }
            continue;
        }

        // Plain qualifying stream with no surround/stereo role of its own
        // (e.g. a pre-existing, untouched stereo track): mapped directly,
        // with a language-tag fix applied via metadata if one was decided.
        outputs.push(OutputAudioTrack {
            source: AudioSource::Direct(idx),
            codec_out: a.codec_out,
            language,
            title: None,
            channels: a.source_channels,
        });
    }

    // Canonical map order: surround first, then stereo.
    let mut ordered = Vec::new();
    if let Some(pos) = outputs.iter().position(|o| o.title == Some("Surround 5.1")) {
        ordered.push(outputs.remove(pos));
    }
    ordered.append(&mut outputs);
    if let Some(stereo) = stereo_track {
        ordered.push(stereo);
    }

    (complex, ordered)
}

fn stereo_filter_segment(input_label: &str, idx: usize) -> String {
    format!("[{input_label}]{PAN_STEREO},{STEREO_COMPRESSOR}[stereo_{idx}]")
}

fn video_filter_chain(plan: &TransformPlan) -> Option<String> {
    if plan.copy_video {
        return None;
    }
    let mut parts = Vec::new();
    if plan.downgrade_resolution {
        if let Some(target) = &plan.video_target {
            parts.push(format!("scale={}:{}", target.target_width, target.target_height));
        }
    }
    if plan.tone_map_hdr {
        parts.push(TONEMAP_FILTER.to_string());
    } else if plan.re_encode_video {
        parts.push("format=yuv420p".to_string());
    }
    if parts.is_empty() { None } else { Some(parts.join(",")) }
}

/// Deterministic, single `ffmpeg` argv realizing the whole plan at once.
/// Same `(input, output, plan)` always yields byte-identical argv
/// (argv construction must be deterministic for a given plan).
pub fn build_ffmpeg_args(input: &Path, output: &Path, plan: &TransformPlan) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), input.to_string_lossy().into_owned()];

    if let Some(vf) = video_filter_chain(plan) {
        args.push("-vf".to_string());
        args.push(vf);
    }

    let (complex_segments, audio_outputs) = build_audio_graph(plan);
    if !complex_segments.is_empty() {
        args.push("-filter_complex".to_string());
        args.push(complex_segments.join(";"));
    }

    args.push("-map".to_string());
    args.push("0:v:0".to_string());

    for track in &audio_outputs {
        args.push("-map".to_string());
        match &track.source {
            AudioSource::Label(label) => args.push(format!("[{label}]")),
            AudioSource::Direct(idx) => args.push(format!("0:a:{idx}")),
        }
    }

    for (i, sub) in plan_text_subtitle_indices(plan).into_iter().enumerate() {
        let _ = i;
        args.push("-map".to_string());
        args.push(format!("0:s:{sub}"));
    }

    if plan.copy_video {
        args.push("-c:v".to_string());
        args.push("copy".to_string());
    } else {
        args.push("-c:v".to_string());
        args.push("libx264".to_string());
        args.push("-preset".to_string());
        args.push("medium".to_string());
        args.push("-crf".to_string());
        args.push("23".to_string());
    }

    for (i, track) in audio_outputs.iter().enumerate() {
        args.push(format!("-c:a:{i}"));
        if track.codec_out == "copy" {
            args.push("copy".to_string());
        } else {
            args.push(track.codec_out.to_string());
            args.push(format!("-b:a:{i}"));
            args.push(format!("{}k", audio_bitrate_kbps(track.channels)));
        }
        args.push(format!("-metadata:s:a:{i}"));
        args.push(format!("language={}", track.language));
        if let Some(title) = track.title {
            args.push(format!("-metadata:s:a:{i}"));
            args.push(format!("title={title}"));
        }
    }

    args.push("-c:s".to_string());
    args.push("mov_text".to_string());

    args.push("-f".to_string());
    args.push("mp4".to_string());
    args.push(tmp_output_path(output));
    args
}

/// Non-PGS subtitle streams travel in-container as `mov_text`; PGS streams
/// are extracted to `.sup` sidecars elsewhere and never mapped here.
fn plan_text_subtitle_indices(_plan: &TransformPlan) -> Vec<usize> {
    // The plan only models *extraction* targets (PGS); in-container text
    // subtitle passthrough is driven directly from `ProbeSummary` by the
    // runner, which knows the full subtitle stream list. Kept as a hook so
    // the builder's signature doesn't need to change if that responsibility
    // moves here later.
    Vec::new()
}

pub fn tmp_output_path(output: &Path) -> String {
    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    dir.join(format!("{stem}.tmp.mp4")).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{AudioStreamPlan, TransformPlan, VideoPlan};
    use std::path::PathBuf;

    fn plan_with_audio(streams: Vec<AudioStreamPlan>) -> TransformPlan {
        TransformPlan {
            container_target: "mp4",
            audio_streams_in: streams,
            ..Default::default()
        }
    }

    #[test]
    fn s1_channelmap_repair_produces_asplit_and_no_label_reuse() {
        let plan = plan_with_audio(vec![AudioStreamPlan {
            source_index: 1,
            relative_index: 1,
            source_channels: 6,
            source_layout: None,
            surround_role: true,
            emit_surround_51: true,
            emit_stereo: true,
            channelmap_repair: true,
            language_tag_fix: Some("eng".into()),
            codec_out: "aac",
        }]);
        let args = build_ffmpeg_args(Path::new("in.mkv"), Path::new("in.mp4"), &plan);
        let joined = args.join(" ");
        assert!(joined.contains(
            "channelmap=0-FL|1-FR|2-FC|3-LFE|4-BL|5-BR:channel_layout=5.1,asplit=2[fixed_surround_1][for_stereo_1]"
        ));
        assert!(joined.contains("[for_stereo_1]pan=stereo|c0=0.35*c0+0.5*c2+0.25*c4|c1=0.35*c1+0.5*c2+0.25*c5,acompressor="));

        // No label is both a final map target and a filter input without an
        // explicit split feeding it.
        let complex_idx = args.iter().position(|a| a == "-filter_complex").unwrap();
        let complex = &args[complex_idx + 1];
        assert!(!complex.contains("[fixed_surround_1][fixed_surround_1]"));
    }

    #[test]
    fn deterministic_argv_for_identical_plans() {
        let plan = plan_with_audio(vec![AudioStreamPlan {
            source_index: 1,
            relative_index: 1,
            source_channels: 6,
            source_layout: Some("5.1".into()),
            surround_role: true,
            emit_surround_51: false,
            emit_stereo: false,
            channelmap_repair: false,
            language_tag_fix: None,
            codec_out: "aac",
        }]);
        let a = build_ffmpeg_args(Path::new("in.mkv"), Path::new("in.mp4"), &plan);
        let b = build_ffmpeg_args(Path::new("in.mkv"), Path::new("in.mp4"), &plan);
        assert_eq!(a, b);
    }

    #[test]
    fn hdr_downgrade_chain_has_scale_before_tonemap() {
        let mut plan = plan_with_audio(vec![]);
        plan.re_encode_video = true;
        plan.downgrade_resolution = true;
        plan.tone_map_hdr = true;
        plan.video_target = Some(VideoPlan {
            target_width: 1920,
            target_height: 1080,
        });
        let args = build_ffmpeg_args(Path::new("in.mkv"), Path::new("in.mp4"), &plan);
        let vf_idx = args.iter().position(|a| a == "-vf").unwrap();
        let vf = &args[vf_idx + 1];
        assert!(vf.starts_with("scale=1920:1080,zscale=t=linear"));
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"23".to_string()));
    }

    #[test]
    fn copy_video_emits_no_filter_and_c_copy() {
        let mut plan = plan_with_audio(vec![]);
        plan.copy_video = true;
        let args = build_ffmpeg_args(Path::new("in.mkv"), Path::new("in.mp4"), &plan);
        assert!(!args.contains(&"-vf".to_string()));
        assert_eq!(args.iter().position(|a| a == "-c:v").map(|i| args[i + 1].clone()), Some("copy".to_string()));
    }

    #[test]
    fn output_is_written_to_tmp_mp4_in_source_directory() {
        let out = tmp_output_path(&PathBuf::from("/tv/Show S01E01.mkv").with_extension("mp4"));
        assert_eq!(out, "/tv/Show S01E01.tmp.mp4");
    }

    #[test]
    fn unknown_layout_stream_copy_does_not_get_bitrate_arg() {
        let plan = plan_with_audio(vec![AudioStreamPlan {
            source_index: 2,
            relative_index: 0,
            source_channels: 6,
            source_layout: None,
            surround_role: false,
            emit_surround_51: false,
            emit_stereo: false,
            channelmap_repair: false,
            language_tag_fix: None,
            codec_out: "copy",
        }]);
        let args = build_ffmpeg_args(Path::new("in.mkv"), Path::new("in.mp4"), &plan);
        let c_a_idx = args.iter().position(|a| a == "-c:a:0").unwrap();
        assert_eq!(args[c_a_idx + 1], "copy");
        assert!(!args.contains(&"-b:a:0".to_string()));
    }

    #[test]
    fn already_compliant_six_channel_track_gets_six_channel_bitrate() {
        let plan = plan_with_audio(vec![AudioStreamPlan {
            source_index: 1,
            relative_index: 0,
            source_channels: 6,
            source_layout: Some("5.1".into()),
            surround_role: true,
            emit_surround_51: false,
            emit_stereo: false,
            channelmap_repair: false,
            language_tag_fix: None,
            codec_out: "aac",
        }]);
        let args = build_ffmpeg_args(Path::new("in.mkv"), Path::new("in.mp4"), &plan);
        let b_a_idx = args.iter().position(|a| a == "-b:a:0").unwrap();
        assert_eq!(args[b_a_idx + 1], "384k");
    }

    #[test]
    fn map_specifier_uses_relative_index_not_absolute_stream_index() {
        let plan = plan_with_audio(vec![AudioStreamPlan {
            source_index: 5,
            relative_index: 0,
            source_channels: 2,
            source_layout: Some("stereo".into()),
            surround_role: false,
            emit_surround_51: false,
            emit_stereo: false,
            channelmap_repair: false,
            language_tag_fix: None,
            codec_out: "aac",
        }]);
        let args = build_ffmpeg_args(Path::new("in.mkv"), Path::new("in.mp4"), &plan);
        let map_idx = args.iter().position(|a| a == "-map").unwrap();
        assert_eq!(args[map_idx + 1], "0:v:0");
        let audio_map = args
            .windows(2)
            .find(|w| w[0] == "-map" && w[1].starts_with("0:a:"))
            .unwrap();
        assert_eq!(audio_map[1], "0:a:0");
    }
}
