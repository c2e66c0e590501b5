#![allow(clippy::collapsible_if)]
pub mod catalog;
pub mod ffprobe;
pub mod hls;
pub mod manifest;
pub mod planner;
pub mod registry;
pub mod session;
pub mod timeline;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),
    #[error("unknown encoder preset: {0}")]
    UnknownPreset(String),
    #[error("could not create transcoding session: {0}")]
    SessionCreate(String),
    #[error("could not start transcoding session: {0}")]
    SessionStart(String),
    #[error("all {0} transcoding sessions are busy")]
    SessionLimit(usize),
    #[error("timed out after {waited:?} waiting for {what}")]
    SegmentTimeout { what: String, waited: Duration },
    #[error("no such segment: {0}")]
    NoSuchSegment(String),
    #[error("invalid representation id: {0}")]
    InvalidRepresentationId(String),
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("invalid segment plan: {0}")]
    InvalidPlan(String),
    #[error("manifest rendering failed: {0}")]
    Manifest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How long a request may wait for encoder output.
///
/// `startup` applies while a session has not produced its init segment yet
/// (process spawn, seek and first encode); `steady` applies afterwards, when a
/// missing segment most likely means a stalled or crashed encoder.
#[derive(Debug, Clone, Copy)]
pub struct SegmentTimeouts {
    pub startup: Duration,
    pub steady: Duration,
}

impl Default for SegmentTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(20),
            steady: Duration::from_secs(10),
        }
    }
}

/// Global transcoder configuration.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub transcode_dir: PathBuf,
    pub segment_duration: Duration,
    pub segments_per_session: usize,
    pub poll_interval: Duration,
    pub timeouts: SegmentTimeouts,
    pub warmup_delay: Duration,
    pub idle_timeout: Duration,
    /// Most ffmpeg processes alive at once.
    pub max_sessions: usize,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            transcode_dir: std::env::temp_dir().join("reelcast_transcode"),
            segment_duration: Duration::from_secs(5),
            segments_per_session: 12,
            poll_interval: Duration::from_millis(200),
            timeouts: SegmentTimeouts::default(),
            warmup_delay: Duration::ZERO,
            idle_timeout: Duration::from_secs(120),
            max_sessions: 8,
        }
    }
}
