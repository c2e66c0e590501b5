use std::path::{Path, PathBuf};

use reelcast_core::types::StreamKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::TranscodeError;

/// A probed source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaFile {
    pub path: PathBuf,
    pub container: String,
    pub duration_secs: f64,
    pub bitrate: Option<u64>,
    pub streams: Vec<Stream>,
}

impl MediaFile {
    pub fn stream(&self, index: u32) -> Option<&Stream> {
        self.streams.iter().find(|s| s.index == index)
    }

    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &Stream> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }
}

/// One elementary stream of a [`MediaFile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    /// Container-relative stream index, as used by `-map 0:<index>`.
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub profile: Option<String>,
    pub level: Option<i32>,
    /// Bits per second.
    pub bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub channels: Option<u32>,
    pub channel_layout: Option<String>,
    pub sample_rate: Option<u32>,
    pub language: Option<String>,
    /// Ticks per second, only set when ffprobe reports an exact `1/N` base.
    pub time_base: Option<i64>,
    /// Stream duration in `time_base` ticks.
    pub duration_ts: Option<i64>,
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub is_default: bool,
}

/// Run ffprobe on a file and parse the JSON output.
pub async fn probe(ffprobe_path: &Path, file: &Path) -> Result<MediaFile, TranscodeError> {
    let output = tokio::process::Command::new(ffprobe_path)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(file)
        .output()
        .await
        .map_err(|e| TranscodeError::ProbeFailed(format!("spawn failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TranscodeError::ProbeFailed(format!(
            "{} exited with {}: {}",
            file.display(),
            output.status,
            stderr.trim()
        )));
    }

    let raw: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| TranscodeError::ProbeFailed(format!("parse JSON: {e}")))?;

    let media = parse_probe_output(file, &raw)?;
    debug!(file = %file.display(), streams = media.streams.len(), "probed media file");
    Ok(media)
}

/// List keyframe timestamps of one stream, in ticks of `time_base`.
pub async fn probe_keyframes(
    ffprobe_path: &Path,
    file: &Path,
    stream_index: u32,
    time_base: i64,
) -> Result<Vec<i64>, TranscodeError> {
    let output = tokio::process::Command::new(ffprobe_path)
        .args(["-v", "quiet", "-select_streams"])
        .arg(stream_index.to_string())
        .args(["-show_entries", "packet=pts_time,flags", "-of", "csv"])
        .arg(file)
        .output()
        .await
        .map_err(|e| TranscodeError::ProbeFailed(format!("spawn failed: {e}")))?;

    if !output.status.success() {
        return Err(TranscodeError::ProbeFailed(format!(
            "keyframe scan of {} exited with {}",
            file.display(),
            output.status
        )));
    }

    let keyframes = parse_keyframes(&String::from_utf8_lossy(&output.stdout), time_base)?;
    debug!(file = %file.display(), stream_index, count = keyframes.len(), "probed keyframes");
    Ok(keyframes)
}

/// Parse `packet,<pts_time>,<flags>` lines, keeping keyframe packets.
fn parse_keyframes(csv: &str, time_base: i64) -> Result<Vec<i64>, TranscodeError> {
    let mut keyframes = Vec::new();
    for line in csv.lines() {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() < 3 || !fields[2].starts_with('K') {
            continue;
        }
        if fields[1] == "N/A" {
            continue;
        }
        let pts: f64 = fields[1]
            .parse()
            .map_err(|e| TranscodeError::ProbeFailed(format!("bad pts_time {:?}: {e}", fields[1])))?;
        keyframes.push((pts * time_base as f64).round() as i64);
    }
    keyframes.sort_unstable();
    keyframes.dedup();
    Ok(keyframes)
}

fn parse_probe_output(file: &Path, raw: &serde_json::Value) -> Result<MediaFile, TranscodeError> {
    let format = raw
        .get("format")
        .ok_or_else(|| TranscodeError::ProbeFailed("missing 'format'".into()))?;

    let container = format
        .get("format_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let duration_secs: f64 = format
        .get("duration")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);

    let bitrate = format
        .get("bit_rate")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok());

    let streams = raw
        .get("streams")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(parse_stream).collect())
        .unwrap_or_default();

    Ok(MediaFile {
        path: file.to_path_buf(),
        container,
        duration_secs,
        bitrate,
        streams,
    })
}

fn parse_stream(s: &serde_json::Value) -> Option<Stream> {
    let str_field = |name: &str| s.get(name).and_then(|v| v.as_str());
    let u32_field = |name: &str| s.get(name).and_then(|v| v.as_u64()).map(|v| v as u32);

    let kind = StreamKind::from_codec_type(str_field("codec_type")?)?;
    let index = u32_field("index").unwrap_or(0);
    let codec = str_field("codec_name").unwrap_or("unknown").to_string();
    let profile = str_field("profile").map(str::to_string);
    let level = s
        .get("level")
        .and_then(|v| v.as_i64())
        .filter(|l| *l > 0)
        .map(|l| l as i32);
    let bitrate = str_field("bit_rate").and_then(|b| b.parse::<u64>().ok());
    let sample_rate = str_field("sample_rate").and_then(|r| r.parse::<u32>().ok());
    let time_base = str_field("time_base").and_then(parse_time_base);
    let duration_ts = s.get("duration_ts").and_then(|v| v.as_i64());
    let duration_secs = str_field("duration").and_then(|d| d.parse::<f64>().ok());
    let language = s
        .get("tags")
        .and_then(|t| t.get("language"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let is_default = s
        .get("disposition")
        .and_then(|d| d.get("default"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
        == 1;

    let (width, height) = match kind {
        StreamKind::Video => (u32_field("width"), u32_field("height")),
        _ => (None, None),
    };
    let (channels, channel_layout) = match kind {
        StreamKind::Audio => (
            u32_field("channels"),
            str_field("channel_layout").map(str::to_string),
        ),
        _ => (None, None),
    };

    Some(Stream {
        index,
        kind,
        codec,
        profile,
        level,
        bitrate,
        width,
        height,
        channels,
        channel_layout,
        sample_rate,
        language,
        time_base,
        duration_ts,
        duration_secs,
        is_default,
    })
}

/// `"1/90000"` → `90000`. Bases that are not a whole number of ticks per
/// second are rejected.
fn parse_time_base(s: &str) -> Option<i64> {
    let (num, den) = s.split_once('/')?;
    let num: i64 = num.parse().ok()?;
    let den: i64 = den.parse().ok()?;
    if num > 0 && den > 0 && den % num == 0 {
        Some(den / num)
    } else {
        None
    }
}
