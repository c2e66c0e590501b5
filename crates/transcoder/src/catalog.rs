//! Encoder presets and the representations derived from them.

use reelcast_core::types::StreamKind;
use serde::{Deserialize, Serialize};

use crate::TranscodeError;
use crate::ffprobe::Stream;

/// Base id of representations that copy the source stream.
pub const PASSTHROUGH_BASE: &str = "direct";

const ID_SEPARATOR: char = '-';

/// Bandwidth advertised for passthrough streams whose bitrate the container
/// does not report.
const FALLBACK_VIDEO_BITRATE: u64 = 8_000_000;
const FALLBACK_AUDIO_BITRATE: u64 = 192_000;

/// A named, immutable encoder configuration.
#[derive(Debug, PartialEq, Eq)]
pub struct EncoderPreset {
    pub name: &'static str,
    pub kind: StreamKind,
    /// Target bits per second.
    pub bitrate: u64,
    /// RFC 6381 codecs string of the output.
    pub codecs: &'static str,
    /// Output height for video presets.
    pub height: Option<u32>,
    /// ffmpeg arguments selecting the encoder, bitrate flags excluded.
    pub codec_args: &'static [&'static str],
}

pub static PRESETS: &[EncoderPreset] = &[
    EncoderPreset {
        name: "64k-audio",
        kind: StreamKind::Audio,
        bitrate: 64_000,
        codecs: "mp4a.40.2",
        height: None,
        codec_args: &["aac", "-ac", "2"],
    },
    EncoderPreset {
        name: "128k-audio",
        kind: StreamKind::Audio,
        bitrate: 128_000,
        codecs: "mp4a.40.2",
        height: None,
        codec_args: &["aac", "-ac", "2"],
    },
    EncoderPreset {
        name: "480-1000k-video",
        kind: StreamKind::Video,
        bitrate: 1_000_000,
        codecs: "avc1.64001e",
        height: Some(480),
        codec_args: &["libx264", "-preset", "veryfast", "-profile:v", "high", "-level", "3.0"],
    },
    EncoderPreset {
        name: "720-5000k-video",
        kind: StreamKind::Video,
        bitrate: 5_000_000,
        codecs: "avc1.64001f",
        height: Some(720),
        codec_args: &["libx264", "-preset", "veryfast", "-profile:v", "high", "-level", "3.1"],
    },
    EncoderPreset {
        name: "1080-10000k-video",
        kind: StreamKind::Video,
        bitrate: 10_000_000,
        codecs: "avc1.640028",
        height: Some(1080),
        codec_args: &["libx264", "-preset", "veryfast", "-profile:v", "high", "-level", "4.0"],
    },
];

pub fn preset(name: &str) -> Result<&'static EncoderPreset, TranscodeError> {
    PRESETS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| TranscodeError::UnknownPreset(name.to_string()))
}

/// One deliverable variant of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    pub id: String,
    pub bitrate: u64,
    /// MIME container, e.g. `audio/mp4`.
    pub container: String,
    pub codecs: String,
    pub transcoded: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A representation bound to the source stream it is produced from.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRepresentation {
    pub stream: Stream,
    pub representation: Representation,
    /// `None` for passthrough.
    pub preset: Option<&'static EncoderPreset>,
}

pub fn join_representation_id(base: &str, stream_id: u32) -> String {
    format!("{base}{ID_SEPARATOR}{stream_id}")
}

/// Split `"{base}-{streamId}"` on the last separator.
pub fn split_representation_id(id: &str) -> Result<(&str, u32), TranscodeError> {
    let (base, stream_id) = id
        .rsplit_once(ID_SEPARATOR)
        .ok_or_else(|| TranscodeError::InvalidRepresentationId(format!("{id:?} has no separator")))?;
    if base.is_empty() {
        return Err(TranscodeError::InvalidRepresentationId(format!(
            "{id:?} has an empty base"
        )));
    }
    let stream_id = stream_id.parse::<u32>().map_err(|_| {
        TranscodeError::InvalidRepresentationId(format!("{id:?} has a non-numeric stream id"))
    })?;
    Ok((base, stream_id))
}

pub fn passthrough_representation(stream: &Stream) -> StreamRepresentation {
    let fallback = match stream.kind {
        StreamKind::Video => FALLBACK_VIDEO_BITRATE,
        _ => FALLBACK_AUDIO_BITRATE,
    };
    StreamRepresentation {
        stream: stream.clone(),
        representation: Representation {
            id: join_representation_id(PASSTHROUGH_BASE, stream.index),
            bitrate: stream.bitrate.unwrap_or(fallback),
            container: stream.kind.mp4_mime().to_string(),
            codecs: codecs_string(stream),
            transcoded: false,
            width: stream.width,
            height: stream.height,
        },
        preset: None,
    }
}

pub fn transcoded_representation(
    stream: &Stream,
    preset_name: &str,
) -> Result<StreamRepresentation, TranscodeError> {
    let preset = preset(preset_name)?;
    if preset.kind != stream.kind {
        return Err(TranscodeError::UnknownPreset(format!(
            "{preset_name} is a {} preset, stream {} is {}",
            preset.kind, stream.index, stream.kind
        )));
    }

    let (width, height) = match preset.height {
        Some(h) => (scaled_width(stream, h), Some(h)),
        None => (None, None),
    };

    Ok(StreamRepresentation {
        stream: stream.clone(),
        representation: Representation {
            id: join_representation_id(preset.name, stream.index),
            bitrate: preset.bitrate,
            container: stream.kind.mp4_mime().to_string(),
            codecs: preset.codecs.to_string(),
            transcoded: true,
            width,
            height,
        },
        preset: Some(preset),
    })
}

/// Passthrough plus every preset that fits the stream. Video presets that
/// would upscale are skipped.
pub fn representations_for(stream: &Stream) -> Vec<StreamRepresentation> {
    if stream.kind == StreamKind::Subtitle {
        return Vec::new();
    }

    let mut reps = vec![passthrough_representation(stream)];
    for p in PRESETS.iter().filter(|p| p.kind == stream.kind) {
        if let (Some(target), Some(source)) = (p.height, stream.height) {
            if target > source {
                continue;
            }
        }
        if let Ok(rep) = transcoded_representation(stream, p.name) {
            reps.push(rep);
        }
    }
    reps
}

/// Keep the aspect ratio, rounded to an even width as x264 requires.
fn scaled_width(stream: &Stream, target_height: u32) -> Option<u32> {
    let (w, h) = (stream.width?, stream.height?);
    if h == 0 {
        return None;
    }
    let width = (u64::from(w) * u64::from(target_height) / u64::from(h)) as u32;
    Some(width - width % 2)
}

/// RFC 6381 codecs parameter for a stream copied as-is.
fn codecs_string(stream: &Stream) -> String {
    let profile = stream.profile.as_deref().unwrap_or("");
    match stream.codec.as_str() {
        "h264" => {
            let (profile_idc, constraints) = match profile {
                "Constrained Baseline" => (0x42, 0xe0),
                "Baseline" => (0x42, 0x00),
                "Main" => (0x4d, 0x40),
                "High 10" => (0x6e, 0x00),
                "High 4:2:2" => (0x7a, 0x00),
                "High 4:4:4 Predictive" => (0xf4, 0x00),
                _ => (0x64, 0x00),
            };
            let level = stream.level.unwrap_or(40);
            format!("avc1.{profile_idc:02x}{constraints:02x}{level:02x}")
        }
        "hevc" => {
            let level = stream.level.unwrap_or(120);
            match profile {
                "Main 10" => format!("hvc1.2.4.L{level}.B0"),
                _ => format!("hvc1.1.6.L{level}.B0"),
            }
        }
        "aac" => match profile {
            "HE-AAC" => "mp4a.40.5".into(),
            "HE-AACv2" => "mp4a.40.29".into(),
            _ => "mp4a.40.2".into(),
        },
        "mp3" => "mp4a.40.34".into(),
        "ac3" => "ac-3".into(),
        "eac3" => "ec-3".into(),
        "opus" => "Opus".into(),
        "flac" => "fLaC".into(),
        other => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn audio_stream(index: u32, bitrate: Option<u64>) -> Stream {
        Stream {
            index,
            kind: StreamKind::Audio,
            codec: "aac".into(),
            profile: Some("LC".into()),
            level: None,
            bitrate,
            width: None,
            height: None,
            channels: Some(2),
            channel_layout: Some("stereo".into()),
            sample_rate: Some(48_000),
            language: Some("eng".into()),
            time_base: Some(48_000),
            duration_ts: None,
            duration_secs: None,
            is_default: true,
        }
    }

    pub(crate) fn video_stream(index: u32, width: u32, height: u32) -> Stream {
        Stream {
            index,
            kind: StreamKind::Video,
            codec: "h264".into(),
            profile: Some("High".into()),
            level: Some(41),
            bitrate: None,
            width: Some(width),
            height: Some(height),
            channels: None,
            channel_layout: None,
            sample_rate: None,
            language: None,
            time_base: Some(1000),
            duration_ts: None,
            duration_secs: None,
            is_default: true,
        }
    }

    #[test]
    fn passthrough_keeps_source_bitrate() {
        let rep = passthrough_representation(&audio_stream(1, Some(192_000)));
        assert!(!rep.representation.transcoded);
        assert_eq!(rep.representation.bitrate, 192_000);
        assert_eq!(rep.representation.id, "direct-1");
        assert_eq!(rep.representation.container, "audio/mp4");
        assert_eq!(rep.representation.codecs, "mp4a.40.2");
        assert!(rep.preset.is_none());
    }

    #[test]
    fn transcoded_uses_preset_bitrate() {
        let rep = transcoded_representation(&audio_stream(1, Some(192_000)), "128k-audio").unwrap();
        assert!(rep.representation.transcoded);
        assert_eq!(rep.representation.bitrate, 128_000);
        assert_eq!(rep.representation.id, "128k-audio-1");
        assert_eq!(rep.preset.map(|p| p.name), Some("128k-audio"));
    }

    #[test]
    fn catalog_is_deterministic() {
        let s = audio_stream(3, None);
        assert_eq!(
            transcoded_representation(&s, "64k-audio").unwrap(),
            transcoded_representation(&s, "64k-audio").unwrap()
        );
        assert_eq!(passthrough_representation(&s), passthrough_representation(&s));
    }

    #[test]
    fn unknown_or_mismatched_preset() {
        let s = audio_stream(1, None);
        assert!(matches!(
            transcoded_representation(&s, "256k-audio"),
            Err(TranscodeError::UnknownPreset(_))
        ));
        assert!(matches!(
            transcoded_representation(&s, "720-5000k-video"),
            Err(TranscodeError::UnknownPreset(_))
        ));
    }

    #[test]
    fn representation_ids_round_trip() {
        for base in ["direct", "64k-audio", "1080-10000k-video", "x"] {
            for id in [0, 1, 17, u32::MAX] {
                let joined = join_representation_id(base, id);
                assert_eq!(split_representation_id(&joined).unwrap(), (base, id));
            }
        }
        assert!(split_representation_id("direct").is_err());
        assert!(split_representation_id("direct-").is_err());
        assert!(split_representation_id("direct-a").is_err());
        assert!(split_representation_id("-3").is_err());
    }

    #[test]
    fn video_presets_never_upscale() {
        let reps = representations_for(&video_stream(0, 1280, 720));
        let ids: Vec<&str> = reps.iter().map(|r| r.representation.id.as_str()).collect();
        assert_eq!(ids, vec!["direct-0", "480-1000k-video-0", "720-5000k-video-0"]);

        let sd = &reps[1].representation;
        assert_eq!(sd.height, Some(480));
        assert_eq!(sd.width, Some(852));
    }

    #[test]
    fn subtitles_have_no_representations() {
        let mut s = audio_stream(4, None);
        s.kind = StreamKind::Subtitle;
        assert!(representations_for(&s).is_empty());
    }

    #[test]
    fn passthrough_codecs_strings() {
        let v = video_stream(0, 1920, 1080);
        assert_eq!(codecs_string(&v), "avc1.640029");

        let mut baseline = v.clone();
        baseline.profile = Some("Constrained Baseline".into());
        baseline.level = Some(30);
        assert_eq!(codecs_string(&baseline), "avc1.42e01e");

        let mut he = audio_stream(1, None);
        he.profile = Some("HE-AAC".into());
        assert_eq!(codecs_string(&he), "mp4a.40.5");
    }
}
