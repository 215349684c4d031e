//! Decision Engine (C4): from a `ProbeSummary` plus user flags, computes the
//! `TransformPlan` describing exactly which transcodes are required.

use serde::{Deserialize, Serialize};

use crate::error::DecisionError;
use crate::probe::{AudioStream, ChannelLayout, HdrType, ProbeSummary};

/// Tag stored in the cache and used by the scheduler to filter the queue.
/// A file may require several actions; this is the single dominant one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "skip")]
    Skip,
    #[serde(rename = "needs_video_conversion")]
    NeedsVideoConversion,
    #[serde(rename = "needs_audio_conversion")]
    NeedsAudioConversion,
    #[serde(rename = "needs_hdr_tonemap")]
    NeedsHdrTonemap,
    #[serde(rename = "needs_stereo_track")]
    NeedsStereoTrack,
    #[serde(rename = "needs_51_from_71")]
    Needs51From71,
    #[serde(rename = "needs_audio_metadata_fix")]
    NeedsAudioMetadataFix,
    #[serde(rename = "needs_channelmap_fix")]
    NeedsChannelmapFix,
    #[serde(rename = "skip_no_english")]
    SkipNoEnglish,
}

/// Which half of the plan `media-update --type` restricts work to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetScope {
    Video,
    Audio,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionFlags {
    pub force_stereo: bool,
    pub downgrade_resolution: bool,
    pub scope: TargetScope,
}

#[derive(Debug, Clone)]
pub struct SubtitleExtract {
    pub stream_index: usize,
    /// Position among subtitle streams only — what `-map 0:s:N` needs.
    pub relative_index: usize,
    pub lang: String,
    pub forced: bool,
    pub out_path_suffix: String,
}

#[derive(Debug, Clone)]
pub struct AudioStreamPlan {
    pub source_index: usize,
    /// Position among audio streams only — what `-map 0:a:N` and the
    /// filter-complex labels built from it need, as opposed to `source_index`
    /// which is the raw, absolute ffprobe stream index.
    pub relative_index: usize,
    pub source_channels: u32,
    /// `None` represents "unknown" in this shape.
    pub source_layout: Option<String>,
    /// This stream is the one chosen to carry the file's surround role,
    /// independent of whether any new work is actually required to realize
    /// it (an already-compliant existing 5.1 track still holds this role).
    pub surround_role: bool,
    /// A *new* 5.1 track is being synthesized or repaired for this stream
    /// (channelmap repair, or pan-downmixed from a 7.1 source) — `false`
    /// for an already-compliant existing 5.1 track preserved verbatim.
    pub emit_surround_51: bool,
    pub emit_stereo: bool,
    pub channelmap_repair: bool,
    pub language_tag_fix: Option<String>,
    pub codec_out: &'static str,
}

#[derive(Debug, Clone)]
pub struct VideoPlan {
    pub target_height: u32,
    pub target_width: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TransformPlan {
    pub downgrade_resolution: bool,
    pub tone_map_hdr: bool,
    pub re_encode_video: bool,
    pub copy_video: bool,
    pub video_target: Option<VideoPlan>,
    pub audio_streams_in: Vec<AudioStreamPlan>,
    pub subtitle_extract: Vec<SubtitleExtract>,
    pub container_target: &'static str,
}

impl TransformPlan {
    /// A plan requires no work when none of the transforms that gate the
    /// `Action::Skip` decision are present. Subtitle-only extraction is
    /// folded in here too: the runner treats an empty plan as "nothing to
    /// do", and a file with pending PGS extraction plainly has something
    /// to do.
    pub fn is_empty(&self) -> bool {
        !self.re_encode_video
            && !self.tone_map_hdr
            && !self.downgrade_resolution
            && self.audio_streams_in.iter().all(|a| {
                !a.emit_surround_51
                    && !a.emit_stereo
                    && !a.channelmap_repair
                    && a.language_tag_fix.is_none()
            })
            && self.subtitle_extract.is_empty()
    }

    /// The single dominant `Action` tag for the cache.
    pub fn dominant_action(&self) -> Action {
        if self.is_empty() {
            return Action::Skip;
        }
        if self.tone_map_hdr {
            return Action::NeedsHdrTonemap;
        }
        if self.audio_streams_in.iter().any(|a| a.channelmap_repair) {
            return Action::NeedsChannelmapFix;
        }
        if self.re_encode_video {
            return Action::NeedsVideoConversion;
        }
        if self
            .audio_streams_in
            .iter()
            .any(|a| a.emit_stereo && !a.emit_surround_51)
        {
            return Action::NeedsStereoTrack;
        }
        if self.audio_streams_in.iter().any(|a| a.emit_surround_51) {
            return Action::Needs51From71;
        }
        if self
            .audio_streams_in
            .iter()
            .any(|a| a.language_tag_fix.is_some())
        {
            return Action::NeedsAudioMetadataFix;
        }
        Action::NeedsAudioConversion
    }
}

impl Default for VideoPlan {
    fn default() -> Self {
        VideoPlan {
            target_height: 1080,
            target_width: 1920,
        }
    }
}

fn is_english_or_unlabeled(stream: &AudioStream) -> bool {
    match stream.language.as_deref() {
        None => true,
        Some(lang) => {
            let lower = lang.to_ascii_lowercase();
            if lower == "und" || lower == "eng" || lower == "en" {
                return true;
            }
            stream
                .title
                .as_deref()
                .map(|t| t.to_ascii_lowercase().contains("english"))
                .unwrap_or(false)
        }
    }
}

fn needs_language_fix(stream: &AudioStream) -> bool {
    match stream.language.as_deref() {
        None => true,
        Some(lang) => {
            let lower = lang.to_ascii_lowercase();
            lower == "und" || lower.is_empty()
        }
    }
}

/// Tie-break policy for streams of equal channel count (an Open
/// Question): prefer `default`-flagged, then highest bitrate, then lowest
/// `source_index`.
fn pick_primary<'a>(candidates: &[&'a AudioStream]) -> Option<&'a AudioStream> {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            a.default
                .cmp(&b.default)
                .then(a.bit_rate.unwrap_or(0).cmp(&b.bit_rate.unwrap_or(0)))
                .then(b.index.cmp(&a.index))
        })
}

fn layout_string(layout: &ChannelLayout) -> Option<String> {
    layout.as_known().map(str::to_string)
}

fn video_decision(plan: &mut TransformPlan, probe: &ProbeSummary, flags: DecisionFlags) {
    let Some(primary) = probe.video.first() else {
        return;
    };

    let is_h264 = primary.codec.eq_ignore_ascii_case("h264");
    if !is_h264 {
        plan.re_encode_video = true;
    }

    if flags.downgrade_resolution && primary.height > 1080 && primary.width > 0 {
        plan.downgrade_resolution = true;
        plan.re_encode_video = true;
        let ar = primary.width as f64 / primary.height as f64;
        let target_height = 1080u32;
        let target_width = (1080.0 * ar).floor() as u32;
        plan.video_target = Some(VideoPlan {
            target_height,
            target_width,
        });
    }

    if primary.hdr_type != HdrType::None {
        plan.tone_map_hdr = true;
        plan.re_encode_video = true;
    }

    let compliant_pix_fmt = primary
        .pix_fmt
        .as_deref()
        .map(|f| f == "yuv420p" || f == "yuvj420p")
        .unwrap_or(false);
    if !plan.re_encode_video
        && is_h264
        && primary.height <= 1080
        && compliant_pix_fmt
        && primary.hdr_type == HdrType::None
    {
        plan.copy_video = true;
    }
}

fn audio_decision(
    plan: &mut TransformPlan,
    probe: &ProbeSummary,
    flags: DecisionFlags,
) -> Result<(), DecisionError> {
    let qualifying: Vec<&AudioStream> = probe
        .audio
        .iter()
        .filter(|a| is_english_or_unlabeled(a))
        .collect();

    if qualifying.is_empty() {
        return Ok(());
    }

    let existing_six_channel: Vec<&AudioStream> =
        qualifying.iter().copied().filter(|a| a.channels == 6).collect();
    let existing_eight_channel: Vec<&AudioStream> =
        qualifying.iter().copied().filter(|a| a.channels == 8).collect();
    let existing_stereo: Vec<&AudioStream> =
        qualifying.iter().copied().filter(|a| a.channels == 2).collect();

    let surround_source = pick_primary(&existing_six_channel)
        .map(|s| (s, false))
        .or_else(|| pick_primary(&existing_eight_channel).map(|s| (s, true)));

    let has_existing_stereo = !existing_stereo.is_empty();
    let needs_enhanced_stereo =
        flags.force_stereo || (!has_existing_stereo && surround_source.is_some());

    for stream in &qualifying {
        let channelmap_repair = stream.channels == 6 && stream.channel_layout == ChannelLayout::Absent;
        let is_surround_source = surround_source.map(|(s, _)| s.index) == Some(stream.index);
        let is_synthesized_from_71 = surround_source
            .map(|(s, from_71)| from_71 && s.index == stream.index)
            .unwrap_or(false);
        let emit_stereo = needs_enhanced_stereo && is_surround_source;

        // A *new* 5.1 track is only actually produced when this stream's
        // 6-channel layout needs repairing, or when it's being pan-downmixed
        // from a 7.1 source. An already-compliant existing 5.1 stream still
        // holds the surround role (`surround_role`) but requires no work.
        let emit_surround_51 = channelmap_repair || is_synthesized_from_71;

        let language_tag_fix = if needs_language_fix(stream) {
            Some("eng".to_string())
        } else {
            None
        };

        let codec_out = if stream.channel_layout == ChannelLayout::Unknown && !channelmap_repair {
            "copy"
        } else {
            "aac"
        };

        plan.audio_streams_in.push(AudioStreamPlan {
            source_index: stream.index,
            relative_index: stream.relative_index,
            source_channels: stream.channels,
            source_layout: layout_string(&stream.channel_layout),
            surround_role: is_surround_source,
            emit_surround_51,
            emit_stereo,
            channelmap_repair,
            language_tag_fix,
            codec_out,
        });
    }

    // If `needs_enhanced_stereo` is true but the stereo source isn't one of
    // the qualifying surround-carrying streams found above (e.g. no
    // surround source at all — stereo is impossible to synthesize without a
    // multichannel donor), there is nothing further to add: stereo
    // synthesis is only ever derived from >= 6ch source material.
    Ok(())
}

fn subtitle_decision(plan: &mut TransformPlan, probe: &ProbeSummary) {
    for sub in &probe.subtitle {
        let is_pgs = sub.codec == "hdmv_pgs_subtitle";
        if !is_pgs {
            continue;
        }
        let is_english = sub
            .language
            .as_deref()
            .map(|l| l.eq_ignore_ascii_case("eng") || l.eq_ignore_ascii_case("en"))
            .unwrap_or(false);
        if !is_english && !sub.forced {
            continue;
        }
        let lang = sub.language.clone().unwrap_or_else(|| "und".to_string());
        let mut suffix = format!(".{lang}");
        if sub.forced {
            suffix.push_str(".forced");
        }
        suffix.push_str(".sup");
        plan.subtitle_extract.push(SubtitleExtract {
            stream_index: sub.index,
            relative_index: sub.relative_index,
            lang,
            forced: sub.forced,
            out_path_suffix: suffix,
        });
    }
}

/// Computes the `TransformPlan` for a probed file. Returns
/// `DecisionError::NoEnglishAudio` when no audio stream qualifies as
/// English-or-unlabeled.
pub fn decide(probe: &ProbeSummary, flags: DecisionFlags) -> Result<TransformPlan, DecisionError> {
    let mut plan = TransformPlan {
        container_target: "mp4",
        ..Default::default()
    };

    if flags.scope != TargetScope::Audio {
        video_decision(&mut plan, probe, flags);
    }

    if flags.scope != TargetScope::Video {
        let has_qualifying_audio = probe.audio.iter().any(is_english_or_unlabeled);
        if !probe.audio.is_empty() && !has_qualifying_audio {
            return Err(DecisionError::NoEnglishAudio);
        }
        audio_decision(&mut plan, probe, flags)?;
    }

    subtitle_decision(&mut plan, probe);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{SubtitleStream, VideoStream};

    fn video(codec: &str, w: u32, h: u32, hdr: HdrType, pix_fmt: &str) -> VideoStream {
        VideoStream {
            index: 0,
            relative_index: 0,
            codec: codec.into(),
            width: w,
            height: h,
            pix_fmt: Some(pix_fmt.into()),
            bit_depth: Some(if hdr == HdrType::None { 8 } else { 10 }),
            color_transfer: None,
            color_primaries: None,
            color_space: None,
            hdr_type: hdr,
            has_dv_side_data: hdr == HdrType::DolbyVision,
        }
    }

    fn audio(
        index: usize,
        channels: u32,
        layout: ChannelLayout,
        language: Option<&str>,
        default: bool,
    ) -> AudioStream {
        AudioStream {
            index,
            // Every scenario in this module puts exactly one video stream
            // at absolute index 0, so the audio streams' relative position
            // among audio-only streams is `index - 1`.
            relative_index: index - 1,
            codec: "aac".into(),
            channels,
            channel_layout: layout,
            language: language.map(str::to_string),
            title: None,
            default,
            forced: false,
            bit_rate: None,
        }
    }

    fn summary(video_streams: Vec<VideoStream>, audio_streams: Vec<AudioStream>) -> ProbeSummary {
        ProbeSummary {
            container: "matroska".into(),
            duration: 3600.0,
            bitrate: Some(8_000_000),
            video: video_streams,
            audio: audio_streams,
            subtitle: vec![],
        }
    }

    #[test]
    fn s1_channelmap_repair_with_stereo_synthesis() {
        let probe = summary(
            vec![video("h264", 1920, 1080, HdrType::None, "yuv420p")],
            vec![audio(1, 6, ChannelLayout::Absent, Some("und"), true)],
        );
        let plan = decide(&probe, DecisionFlags::default()).unwrap();
        let a = &plan.audio_streams_in[0];
        assert!(a.channelmap_repair);
        assert!(a.emit_surround_51);
        assert!(a.emit_stereo);
        assert_eq!(a.language_tag_fix.as_deref(), Some("eng"));
        assert_eq!(plan.dominant_action(), Action::NeedsChannelmapFix);
    }

    #[test]
    fn s2_4k_hdr10_downgrade() {
        let probe = summary(
            vec![video("hevc", 3840, 2160, HdrType::Hdr10, "yuv420p10le")],
            vec![audio(1, 6, ChannelLayout::Known("5.1".into()), Some("eng"), true)],
        );
        let plan = decide(
            &probe,
            DecisionFlags {
                force_stereo: false,
                downgrade_resolution: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(plan.re_encode_video);
        assert!(plan.downgrade_resolution);
        assert!(plan.tone_map_hdr);
        assert_eq!(plan.video_target.as_ref().unwrap().target_height, 1080);
    }

    #[test]
    fn s3_71_with_existing_51_only_stereo_synthesized() {
        let probe = summary(
            vec![video("h264", 1920, 1080, HdrType::None, "yuv420p")],
            vec![
                audio(1, 8, ChannelLayout::Known("7.1".into()), Some("eng"), false),
                audio(2, 6, ChannelLayout::Known("5.1".into()), Some("eng"), true),
            ],
        );
        let plan = decide(&probe, DecisionFlags::default()).unwrap();
        assert!(!plan.audio_streams_in.iter().any(|a| a.emit_surround_51));
        assert!(plan.audio_streams_in.iter().any(|a| a.emit_stereo));
    }

    #[test]
    fn s4_already_compliant_skips() {
        let probe = summary(
            vec![video("h264", 1920, 1080, HdrType::None, "yuv420p")],
            vec![
                audio(1, 6, ChannelLayout::Known("5.1".into()), Some("eng"), true),
                audio(2, 2, ChannelLayout::Known("stereo".into()), Some("eng"), false),
            ],
        );
        let plan = decide(&probe, DecisionFlags::default()).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.dominant_action(), Action::Skip);
    }

    #[test]
    fn foreign_only_audio_errors() {
        let probe = summary(
            vec![video("h264", 1920, 1080, HdrType::None, "yuv420p")],
            vec![audio(1, 2, ChannelLayout::Known("stereo".into()), Some("fre"), true)],
        );
        let err = decide(&probe, DecisionFlags::default()).unwrap_err();
        assert!(matches!(err, DecisionError::NoEnglishAudio));
    }

    #[test]
    fn unknown_layout_forces_stream_copy() {
        let probe = summary(
            vec![video("h264", 1920, 1080, HdrType::None, "yuv420p")],
            vec![audio(1, 6, ChannelLayout::Unknown, Some("eng"), true)],
        );
        let plan = decide(&probe, DecisionFlags::default()).unwrap();
        assert_eq!(plan.audio_streams_in[0].codec_out, "copy");
    }

    #[test]
    fn pgs_english_subtitle_is_extracted() {
        let mut probe = summary(
            vec![video("h264", 1920, 1080, HdrType::None, "yuv420p")],
            vec![audio(1, 2, ChannelLayout::Known("stereo".into()), Some("eng"), true)],
        );
        probe.subtitle.push(SubtitleStream {
            index: 2,
            relative_index: 0,
            codec: "hdmv_pgs_subtitle".into(),
            language: Some("eng".into()),
            forced: false,
            title: None,
        });
        let plan = decide(&probe, DecisionFlags::default()).unwrap();
        assert_eq!(plan.subtitle_extract.len(), 1);
        assert_eq!(plan.subtitle_extract[0].out_path_suffix, ".eng.sup");
    }

    #[test]
    fn video_only_scope_skips_audio_decision_entirely() {
        let probe = summary(
            vec![video("hevc", 3840, 2160, HdrType::Hdr10, "yuv420p10le")],
            vec![audio(1, 2, ChannelLayout::Known("stereo".into()), Some("fre"), true)],
        );
        let plan = decide(
            &probe,
            DecisionFlags {
                force_stereo: false,
                downgrade_resolution: false,
                scope: TargetScope::Video,
            },
        )
        .unwrap();
        assert!(plan.tone_map_hdr);
        assert!(plan.audio_streams_in.is_empty());
    }

    #[test]
    fn foreign_pgs_subtitle_is_not_extracted() {
        let mut probe = summary(
            vec![video("h264", 1920, 1080, HdrType::None, "yuv420p")],
            vec![audio(1, 2, ChannelLayout::Known("stereo".into()), Some("eng"), true)],
        );
        probe.subtitle.push(SubtitleStream {
            index: 2,
            relative_index: 0,
            codec: "hdmv_pgs_subtitle".into(),
            language: Some("fre".into()),
            forced: false,
            title: None,
        });
        let plan = decide(&probe, DecisionFlags::default()).unwrap();
        assert!(plan.subtitle_extract.is_empty());
    }
}
