//! DASH MPD rendering.

use std::time::Duration;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use reelcast_core::types::StreamKind;

use crate::TranscodeError;
use crate::planner::SegmentPlan;
use crate::timeline::{MediaTimeline, Track};

/// Content-Type for MPD manifests.
pub const DASH_CONTENT_TYPE: &str = "application/dash+xml";

const MIN_BUFFER_TIME: Duration = Duration::from_secs(2);

/// One `<S>` element: `r` extra repeats of a `d`-tick segment starting at `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimelineEntry {
    t: i64,
    d: i64,
    r: u32,
}

/// Render a static MPD for every track of `timeline`.
///
/// Segment URLs are `$RepresentationID$/init.mp4` and
/// `$RepresentationID$/$Number$.m4s`, resolved against `base_url` if given.
pub fn build_dash_manifest(
    timeline: &MediaTimeline,
    base_url: Option<&str>,
) -> Result<String, TranscodeError> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);

    write(&mut w, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let duration = iso8601_duration(timeline.duration);
    let min_buffer = iso8601_duration(MIN_BUFFER_TIME);
    let mut mpd = BytesStart::new("MPD");
    mpd.push_attribute(("xmlns", "urn:mpeg:dash:schema:mpd:2011"));
    mpd.push_attribute(("profiles", "urn:mpeg:dash:profile:isoff-live:2011"));
    mpd.push_attribute(("type", "static"));
    mpd.push_attribute(("mediaPresentationDuration", duration.as_str()));
    mpd.push_attribute(("minBufferTime", min_buffer.as_str()));
    write(&mut w, Event::Start(mpd))?;

    if let Some(base) = base_url {
        write(&mut w, Event::Start(BytesStart::new("BaseURL")))?;
        write(&mut w, Event::Text(BytesText::new(base)))?;
        write(&mut w, Event::End(BytesEnd::new("BaseURL")))?;
    }

    let mut period = BytesStart::new("Period");
    period.push_attribute(("id", "0"));
    period.push_attribute(("start", "PT0S"));
    write(&mut w, Event::Start(period))?;

    for (idx, track) in timeline.tracks.iter().enumerate() {
        write_adaptation_set(&mut w, idx, track)?;
    }

    write(&mut w, Event::End(BytesEnd::new("Period")))?;
    write(&mut w, Event::End(BytesEnd::new("MPD")))?;

    String::from_utf8(w.into_inner()).map_err(|e| TranscodeError::Manifest(e.to_string()))
}

fn write_adaptation_set(
    w: &mut Writer<Vec<u8>>,
    idx: usize,
    track: &Track,
) -> Result<(), TranscodeError> {
    let kind = track.stream.kind;
    let id = idx.to_string();
    let mut set = BytesStart::new("AdaptationSet");
    set.push_attribute(("id", id.as_str()));
    set.push_attribute(("contentType", kind.as_str()));
    set.push_attribute(("mimeType", kind.mp4_mime()));
    set.push_attribute(("segmentAlignment", "true"));
    set.push_attribute(("startWithSAP", "1"));
    if let Some(lang) = &track.stream.language {
        set.push_attribute(("lang", lang.as_str()));
    }
    write(w, Event::Start(set))?;

    write_segment_template(w, track)?;

    for rep in &track.representations {
        let r = &rep.representation;
        let bandwidth = r.bitrate.to_string();
        let mut el = BytesStart::new("Representation");
        el.push_attribute(("id", r.id.as_str()));
        el.push_attribute(("bandwidth", bandwidth.as_str()));
        el.push_attribute(("codecs", r.codecs.as_str()));
        match kind {
            StreamKind::Video => {
                let width = r.width.map(|v| v.to_string());
                let height = r.height.map(|v| v.to_string());
                if let (Some(width), Some(height)) = (&width, &height) {
                    el.push_attribute(("width", width.as_str()));
                    el.push_attribute(("height", height.as_str()));
                }
                write(w, Event::Empty(el))?;
            }
            _ => {
                let rate = rep.stream.sample_rate.map(|v| v.to_string());
                if let Some(rate) = &rate {
                    el.push_attribute(("audioSamplingRate", rate.as_str()));
                }
                write(w, Event::Start(el))?;

                let channels = if r.transcoded {
                    Some(2)
                } else {
                    rep.stream.channels
                };
                if let Some(channels) = channels {
                    let value = channels.to_string();
                    let mut cfg = BytesStart::new("AudioChannelConfiguration");
                    cfg.push_attribute((
                        "schemeIdUri",
                        "urn:mpeg:dash:23003:3:audio_channel_configuration:2011",
                    ));
                    cfg.push_attribute(("value", value.as_str()));
                    write(w, Event::Empty(cfg))?;
                }
                write(w, Event::End(BytesEnd::new("Representation")))?;
            }
        }
    }

    write(w, Event::End(BytesEnd::new("AdaptationSet")))
}

fn write_segment_template(w: &mut Writer<Vec<u8>>, track: &Track) -> Result<(), TranscodeError> {
    let timescale = track.interval.time_base.to_string();
    let mut st = BytesStart::new("SegmentTemplate");
    st.push_attribute(("timescale", timescale.as_str()));
    st.push_attribute(("initialization", "$RepresentationID$/init.mp4"));
    st.push_attribute(("media", "$RepresentationID$/$Number$.m4s"));
    st.push_attribute(("startNumber", "0"));
    write(w, Event::Start(st))?;

    write(w, Event::Start(BytesStart::new("SegmentTimeline")))?;
    for entry in timeline_entries(&track.plan) {
        let (t, d, r) = (entry.t.to_string(), entry.d.to_string(), entry.r.to_string());
        let mut s = BytesStart::new("S");
        s.push_attribute(("t", t.as_str()));
        s.push_attribute(("d", d.as_str()));
        if entry.r > 0 {
            s.push_attribute(("r", r.as_str()));
        }
        write(w, Event::Empty(s))?;
    }
    write(w, Event::End(BytesEnd::new("SegmentTimeline")))?;

    write(w, Event::End(BytesEnd::new("SegmentTemplate")))
}

/// Run-length encode consecutive equal-length segments.
fn timeline_entries(plan: &SegmentPlan) -> Vec<TimelineEntry> {
    let mut entries: Vec<TimelineEntry> = Vec::new();
    for seg in plan.segments() {
        let d = seg.interval.ticks();
        match entries.last_mut() {
            Some(last) if last.d == d => last.r += 1,
            _ => entries.push(TimelineEntry {
                t: seg.interval.start,
                d,
                r: 0,
            }),
        }
    }
    entries
}

fn write(w: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), TranscodeError> {
    w.write_event(event)
        .map_err(|e| TranscodeError::Manifest(e.to_string()))
}

/// `PT1H2M3.456S`-style duration.
fn iso8601_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let secs = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("PT{hours}H{minutes}M{secs}.{millis:03}S")
}
