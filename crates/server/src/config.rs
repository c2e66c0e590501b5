//! Environment-driven server configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reelcast_transcoder::TranscoderConfig;
use tracing::warn;

pub const DEFAULT_BIND: &str = "0.0.0.0:8097";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub media_dir: PathBuf,
    pub transcoder: TranscoderConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset or unparsable values
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut tc = TranscoderConfig::default();

        if let Some(v) = lookup("REELCAST_TRANSCODE_DIR") {
            tc.transcode_dir = v.into();
        }
        if let Some(v) = lookup("REELCAST_FFMPEG") {
            tc.ffmpeg_path = v.into();
        }
        if let Some(v) = lookup("REELCAST_FFPROBE") {
            tc.ffprobe_path = v.into();
        }
        if let Some(secs) = parsed::<f64>(&lookup, "REELCAST_SEGMENT_SECS") {
            match Duration::try_from_secs_f64(secs) {
                Ok(d) if !d.is_zero() => tc.segment_duration = d,
                _ => warn!(value = secs, "ignoring REELCAST_SEGMENT_SECS"),
            }
        }
        if let Some(n) = parsed::<usize>(&lookup, "REELCAST_SEGMENTS_PER_SESSION") {
            if n > 0 {
                tc.segments_per_session = n;
            }
        }
        if let Some(secs) = parsed::<u64>(&lookup, "REELCAST_IDLE_TIMEOUT_SECS") {
            tc.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "REELCAST_STARTUP_TIMEOUT_SECS") {
            tc.timeouts.startup = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "REELCAST_SEGMENT_TIMEOUT_SECS") {
            tc.timeouts.steady = Duration::from_secs(secs);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "REELCAST_WARMUP_MS") {
            tc.warmup_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parsed::<usize>(&lookup, "REELCAST_MAX_SESSIONS") {
            if n > 0 {
                tc.max_sessions = n;
            }
        }
        // The reaper must not kill an encoder a request is still waiting on.
        if tc.idle_timeout <= tc.timeouts.startup {
            let clamped = tc.timeouts.startup * 2;
            warn!(
                idle_secs = tc.idle_timeout.as_secs(),
                clamped_secs = clamped.as_secs(),
                "idle timeout shorter than startup timeout, raising it"
            );
            tc.idle_timeout = clamped;
        }

        Self {
            bind: lookup("REELCAST_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            media_dir: lookup("REELCAST_MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            transcoder: tc,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c.bind, DEFAULT_BIND);
        assert_eq!(c.transcoder.segment_duration, Duration::from_secs(5));
        assert_eq!(c.transcoder.segments_per_session, 12);
    }

    #[test]
    fn overrides_apply() {
        let c = config(&[
            ("REELCAST_BIND", "127.0.0.1:9000"),
            ("REELCAST_MEDIA_DIR", "/srv/media"),
            ("REELCAST_FFMPEG", "/opt/ffmpeg"),
            ("REELCAST_SEGMENT_SECS", "2.5"),
            ("REELCAST_SEGMENTS_PER_SESSION", "6"),
            ("REELCAST_STARTUP_TIMEOUT_SECS", "30"),
            ("REELCAST_SEGMENT_TIMEOUT_SECS", "8"),
            ("REELCAST_WARMUP_MS", "250"),
            ("REELCAST_MAX_SESSIONS", "3"),
            ("REELCAST_IDLE_TIMEOUT_SECS", "90"),
        ]);
        assert_eq!(c.bind, "127.0.0.1:9000");
        assert_eq!(c.media_dir, PathBuf::from("/srv/media"));
        assert_eq!(c.transcoder.ffmpeg_path, PathBuf::from("/opt/ffmpeg"));
        assert_eq!(c.transcoder.segment_duration, Duration::from_millis(2500));
        assert_eq!(c.transcoder.segments_per_session, 6);
        assert_eq!(c.transcoder.timeouts.startup, Duration::from_secs(30));
        assert_eq!(c.transcoder.timeouts.steady, Duration::from_secs(8));
        assert_eq!(c.transcoder.warmup_delay, Duration::from_millis(250));
        assert_eq!(c.transcoder.max_sessions, 3);
        assert_eq!(c.transcoder.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn idle_timeout_outlasts_startup_wait() {
        let c = config(&[
            ("REELCAST_IDLE_TIMEOUT_SECS", "0"),
            ("REELCAST_STARTUP_TIMEOUT_SECS", "15"),
        ]);
        assert_eq!(c.transcoder.idle_timeout, Duration::from_secs(30));

        let c = config(&[("REELCAST_IDLE_TIMEOUT_SECS", "16")]);
        assert!(c.transcoder.idle_timeout > c.transcoder.timeouts.startup);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let c = config(&[
            ("REELCAST_SEGMENT_SECS", "0"),
            ("REELCAST_SEGMENTS_PER_SESSION", "many"),
            ("REELCAST_MAX_SESSIONS", "0"),
        ]);
        assert_eq!(c.transcoder.segment_duration, Duration::from_secs(5));
        assert_eq!(c.transcoder.segments_per_session, 12);
        assert_eq!(c.transcoder.max_sessions, 8);
    }
}
