//! Per-file view of every deliverable track and its planned segments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reelcast_core::types::StreamKind;
use tracing::info;

use crate::catalog::{self, StreamRepresentation};
use crate::ffprobe::{self, MediaFile, Stream};
use crate::planner::{self, Interval, Segment, SegmentPlan};
use crate::{TranscodeError, TranscoderConfig};

/// Used for streams whose time base is not a whole number of ticks/second.
pub const DEFAULT_TIME_BASE: i64 = 1000;

/// Still-image codecs ffprobe reports as video (cover art).
const ATTACHED_PICTURE_CODECS: &[&str] = &["mjpeg", "png", "bmp", "gif"];

#[derive(Debug, Clone)]
pub struct Track {
    pub stream: Stream,
    pub interval: Interval,
    pub plan: SegmentPlan,
    pub representations: Vec<StreamRepresentation>,
}

#[derive(Debug, Clone)]
pub struct MediaTimeline {
    pub path: PathBuf,
    pub duration: Duration,
    pub tracks: Vec<Track>,
}

/// The planned session that owns a requested segment.
#[derive(Debug, Clone, Copy)]
pub struct PlannedSession<'a> {
    pub track: &'a Track,
    pub representation: &'a StreamRepresentation,
    pub segments: &'a [Segment],
}

impl PlannedSession<'_> {
    pub fn start_index(&self) -> u32 {
        self.segments.first().map(|s| s.segment_id).unwrap_or(0)
    }
}

impl MediaTimeline {
    /// Probe `path` and plan every track.
    pub async fn load(config: &TranscoderConfig, path: &Path) -> Result<Self, TranscodeError> {
        let media = ffprobe::probe(&config.ffprobe_path, path).await?;

        let mut keyframes = HashMap::new();
        if let Some(video) = primary_video(&media) {
            let kf = ffprobe::probe_keyframes(
                &config.ffprobe_path,
                path,
                video.index,
                stream_time_base(video),
            )
            .await?;
            keyframes.insert(video.index, kf);
        }

        let timeline = Self::build(config, &media, &keyframes)?;
        info!(
            file = %path.display(),
            tracks = timeline.tracks.len(),
            duration_ms = timeline.duration.as_millis() as u64,
            "planned media timeline"
        );
        Ok(timeline)
    }

    /// Plan the primary video stream (keyframe aligned) and every audio
    /// stream (fixed length).
    pub fn build(
        config: &TranscoderConfig,
        media: &MediaFile,
        keyframes: &HashMap<u32, Vec<i64>>,
    ) -> Result<Self, TranscodeError> {
        let mut tracks = Vec::new();

        let streams = primary_video(media)
            .into_iter()
            .chain(media.streams_of(StreamKind::Audio));
        for stream in streams {
            let interval = stream_interval(stream, media.duration_secs)?;
            let plan = match keyframes.get(&stream.index) {
                Some(kf) if stream.kind == StreamKind::Video => planner::plan_keyframes(
                    interval,
                    kf,
                    config.segment_duration,
                    config.segments_per_session,
                )?,
                _ => planner::plan_fixed(
                    interval,
                    config.segment_duration,
                    config.segments_per_session,
                )?,
            };
            tracks.push(Track {
                stream: stream.clone(),
                interval,
                plan,
                representations: catalog::representations_for(stream),
            });
        }

        let duration = Duration::try_from_secs_f64(media.duration_secs)
            .unwrap_or_default();

        Ok(Self {
            path: media.path.clone(),
            duration,
            tracks,
        })
    }

    pub fn find(
        &self,
        representation_id: &str,
    ) -> Result<(&Track, &StreamRepresentation), TranscodeError> {
        self.tracks
            .iter()
            .find_map(|t| {
                t.representations
                    .iter()
                    .find(|r| r.representation.id == representation_id)
                    .map(|r| (t, r))
            })
            .ok_or_else(|| {
                TranscodeError::NoSuchSegment(format!(
                    "representation {representation_id} does not exist in {}",
                    self.path.display()
                ))
            })
    }

    pub fn locate(
        &self,
        representation_id: &str,
        segment_id: u32,
    ) -> Result<PlannedSession<'_>, TranscodeError> {
        let (track, representation) = self.find(representation_id)?;
        let segments = track.plan.locate(segment_id)?;
        Ok(PlannedSession {
            track,
            representation,
            segments,
        })
    }
}

fn primary_video(media: &MediaFile) -> Option<&Stream> {
    media
        .streams_of(StreamKind::Video)
        .find(|s| !ATTACHED_PICTURE_CODECS.contains(&s.codec.as_str()))
}

fn stream_time_base(stream: &Stream) -> i64 {
    stream.time_base.unwrap_or(DEFAULT_TIME_BASE)
}

fn stream_interval(stream: &Stream, container_secs: f64) -> Result<Interval, TranscodeError> {
    let time_base = stream_time_base(stream);
    let end = match (stream.time_base, stream.duration_ts) {
        (Some(_), Some(ticks)) if ticks > 0 => ticks,
        _ => {
            let secs = stream.duration_secs.unwrap_or(container_secs);
            (secs * time_base as f64).round() as i64
        }
    };
    Interval::new(time_base, 0, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{audio_stream, video_stream};

    fn config() -> TranscoderConfig {
        TranscoderConfig {
            segment_duration: Duration::from_secs(5),
            segments_per_session: 2,
            ..Default::default()
        }
    }

    fn media() -> MediaFile {
        let mut cover = video_stream(3, 600, 600);
        cover.codec = "mjpeg".into();
        MediaFile {
            path: PathBuf::from("/media/movie.mkv"),
            container: "matroska,webm".into(),
            duration_secs: 13.0,
            bitrate: None,
            streams: vec![
                video_stream(0, 1280, 720),
                audio_stream(1, Some(192_000)),
                cover,
            ],
        }
    }

    #[test]
    fn builds_video_and_audio_tracks() {
        let keyframes = HashMap::from([(0, vec![0, 4000, 6000, 11000])]);
        let tl = MediaTimeline::build(&config(), &media(), &keyframes).unwrap();

        assert_eq!(tl.duration, Duration::from_secs(13));
        assert_eq!(tl.tracks.len(), 2);

        let video = &tl.tracks[0];
        assert_eq!(video.stream.index, 0);
        assert_eq!(video.interval, Interval::new(1000, 0, 13000).unwrap());
        let starts: Vec<i64> = video.plan.segments().map(|s| s.interval.start).collect();
        assert_eq!(starts, vec![0, 6000, 11000]);

        let audio = &tl.tracks[1];
        assert_eq!(audio.interval.time_base, 48_000);
        assert_eq!(audio.interval.end, 13 * 48_000);
        assert_eq!(audio.plan.sessions().len(), 2);
        assert_eq!(audio.representations.len(), 3);
    }

    #[test]
    fn locate_resolves_representation_and_session() {
        let tl = MediaTimeline::build(&config(), &media(), &HashMap::new()).unwrap();

        let planned = tl.locate("128k-audio-1", 2).unwrap();
        assert_eq!(planned.track.stream.index, 1);
        assert_eq!(planned.start_index(), 2);
        assert_eq!(planned.segments.len(), 1);
        assert_eq!(planned.representation.representation.bitrate, 128_000);

        assert!(matches!(
            tl.locate("128k-audio-1", 3),
            Err(TranscodeError::NoSuchSegment(_))
        ));
        assert!(matches!(
            tl.locate("256k-audio-1", 0),
            Err(TranscodeError::NoSuchSegment(_))
        ));
    }

    #[test]
    fn stream_duration_ticks_win_over_container_duration() {
        let mut m = media();
        m.streams[1].duration_ts = Some(48_000 * 12);
        let tl = MediaTimeline::build(&config(), &m, &HashMap::new()).unwrap();
        assert_eq!(tl.tracks[1].interval.end, 48_000 * 12);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let mut m = media();
        m.duration_secs = 0.0;
        let err = MediaTimeline::build(&config(), &m, &HashMap::new()).unwrap_err();
        assert!(matches!(err, TranscodeError::InvalidInterval(_)));
    }
}
