//! HLS playlists rendered from a planned timeline.

use std::fmt::Write as _;

use reelcast_core::types::StreamKind;

use crate::TranscodeError;
use crate::catalog::StreamRepresentation;
use crate::planner::ticks_to_duration;
use crate::timeline::{MediaTimeline, Track};

/// Content-Type for HLS master/variant playlists.
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const HLS_VERSION: u32 = 7;

/// Master playlist. Variant URIs are `{prefix}{representation id}/media.m3u8`.
pub fn build_master_playlist(timeline: &MediaTimeline, prefix: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:{HLS_VERSION}");
    let _ = writeln!(out, "#EXT-X-INDEPENDENT-SEGMENTS");

    let audio: Vec<(&Track, &StreamRepresentation)> = timeline
        .tracks
        .iter()
        .filter(|t| t.stream.kind == StreamKind::Audio)
        .flat_map(|t| t.representations.iter().map(move |r| (t, r)))
        .collect();
    let video: Vec<&StreamRepresentation> = timeline
        .tracks
        .iter()
        .filter(|t| t.stream.kind == StreamKind::Video)
        .flat_map(|t| t.representations.iter())
        .collect();

    if video.is_empty() {
        for (_, rep) in &audio {
            let r = &rep.representation;
            let _ = writeln!(
                out,
                "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"{}\"",
                r.bitrate, r.codecs
            );
            let _ = writeln!(out, "{prefix}{}/media.m3u8", r.id);
        }
        return out;
    }

    // One audio group per representation so every video variant can pair
    // with any audio tier.
    for (track, rep) in &audio {
        let r = &rep.representation;
        let name = track
            .stream
            .language
            .clone()
            .unwrap_or_else(|| format!("Track {}", track.stream.index));
        let default = if track.stream.is_default { "YES" } else { "NO" };
        let _ = write!(
            out,
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{id}\",NAME=\"{name}\",DEFAULT={default},AUTOSELECT=YES",
            id = r.id
        );
        if let Some(lang) = &track.stream.language {
            let _ = write!(out, ",LANGUAGE=\"{lang}\"");
        }
        let _ = writeln!(out, ",URI=\"{prefix}{}/media.m3u8\"", r.id);
    }

    for v in &video {
        let vr = &v.representation;
        let resolution = match (vr.width, vr.height) {
            (Some(w), Some(h)) => format!(",RESOLUTION={w}x{h}"),
            _ => String::new(),
        };
        if audio.is_empty() {
            let _ = writeln!(
                out,
                "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"{}\"{resolution}",
                vr.bitrate, vr.codecs
            );
            let _ = writeln!(out, "{prefix}{}/media.m3u8", vr.id);
            continue;
        }
        for (_, a) in &audio {
            let ar = &a.representation;
            let _ = writeln!(
                out,
                "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"{},{}\"{resolution},AUDIO=\"{}\"",
                vr.bitrate + ar.bitrate,
                vr.codecs,
                ar.codecs,
                ar.id
            );
            let _ = writeln!(out, "{prefix}{}/media.m3u8", vr.id);
        }
    }

    out
}

/// VOD media playlist for one representation, relative to its own directory.
pub fn build_media_playlist(
    timeline: &MediaTimeline,
    representation_id: &str,
) -> Result<String, TranscodeError> {
    let (track, _) = timeline.find(representation_id)?;
    let time_base = track.interval.time_base;

    let longest = track
        .plan
        .segments()
        .map(|s| s.interval.ticks())
        .max()
        .unwrap_or(0);
    let target = ticks_to_duration(longest, time_base).as_secs_f64().ceil() as u64;

    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:{HLS_VERSION}");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target}");
    let _ = writeln!(out, "#EXT-X-PLAYLIST-TYPE:VOD");
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:0");
    let _ = writeln!(out, "#EXT-X-INDEPENDENT-SEGMENTS");
    let _ = writeln!(out, "#EXT-X-MAP:URI=\"init.mp4\"");
    for seg in track.plan.segments() {
        let secs = seg.interval.duration().as_secs_f64();
        let _ = writeln!(out, "#EXTINF:{secs:.3},");
        let _ = writeln!(out, "{}.m4s", seg.segment_id);
    }
    let _ = writeln!(out, "#EXT-X-ENDLIST");
    Ok(out)
}
