use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use reelcast_core::pool::run_bounded;
use reelcast_core::types::StreamKind;

use crate::catalog::StreamRepresentation;
use crate::planner::Segment;
use crate::registry::ManagedSession;
use crate::{TranscodeError, TranscoderConfig};

/// Every session directory starts with this, so leftovers of a crashed
/// server can be told apart from unrelated files.
pub const SESSION_DIR_PREFIX: &str = "transcoding-session-";

const INIT_SEGMENT_NAME: &str = "init.mp4";
const PLAYLIST_NAME: &str = "generated_by_ffmpeg.m3u8";

enum Process {
    Created,
    Running {
        kill: oneshot::Sender<()>,
        monitor: JoinHandle<()>,
    },
    Failed,
    Destroyed,
}

struct Inner {
    process: Process,
    dir: Option<TempDir>,
}

/// One ffmpeg process producing a bounded run of segments for one
/// representation.
pub struct TranscodingSession {
    id: String,
    stream: StreamRepresentation,
    start_time: Duration,
    start_index: u32,
    segment_count: usize,
    output_dir: PathBuf,
    ffmpeg_path: PathBuf,
    args: Vec<String>,
    poll_interval: Duration,
    created_at: Instant,
    last_access_ms: AtomicU64,
    inner: Mutex<Inner>,
}

impl TranscodingSession {
    /// Allocate the output directory and build the ffmpeg invocation for
    /// `segments`, one planned session of `stream`. Nothing is spawned yet.
    pub fn new(
        config: &TranscoderConfig,
        source: &Path,
        stream: StreamRepresentation,
        segments: &[Segment],
    ) -> Result<Self, TranscodeError> {
        let first = segments
            .first()
            .ok_or_else(|| TranscodeError::SessionCreate("no segments planned".into()))?;

        std::fs::create_dir_all(&config.transcode_dir).map_err(|e| {
            TranscodeError::SessionCreate(format!(
                "create {}: {e}",
                config.transcode_dir.display()
            ))
        })?;
        let dir = tempfile::Builder::new()
            .prefix(SESSION_DIR_PREFIX)
            .tempdir_in(&config.transcode_dir)
            .map_err(|e| TranscodeError::SessionCreate(format!("allocate temp dir: {e}")))?;

        let output_dir = dir.path().to_path_buf();
        let id = output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let args = build_ffmpeg_args(source, &stream, segments, &output_dir, config.segment_duration);

        debug!(session_id = %id, representation = %stream.representation.id, start_index = first.segment_id, "transcoding session created");

        Ok(Self {
            id,
            start_time: first.interval.start_time(),
            start_index: first.segment_id,
            segment_count: segments.len(),
            stream,
            output_dir,
            ffmpeg_path: config.ffmpeg_path.clone(),
            args,
            poll_interval: config.poll_interval,
            created_at: Instant::now(),
            last_access_ms: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                process: Process::Created,
                dir: Some(dir),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> &StreamRepresentation {
        &self.stream
    }

    pub fn start_time(&self) -> Duration {
        self.start_time
    }

    pub fn start_index(&self) -> u32 {
        self.start_index
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn segment_path(&self, segment_id: u32) -> PathBuf {
        self.output_dir.join(format!("stream0_{segment_id}.m4s"))
    }

    pub fn init_segment_path(&self) -> PathBuf {
        self.output_dir.join(INIT_SEGMENT_NAME)
    }

    /// Whether the encoder has written its initialization segment yet.
    pub async fn init_ready(&self) -> bool {
        tokio::fs::try_exists(self.init_segment_path())
            .await
            .unwrap_or(false)
    }

    /// Whether the encoder process is alive.
    pub async fn is_running(&self) -> bool {
        match &self.inner.lock().await.process {
            Process::Running { monitor, .. } => !monitor.is_finished(),
            _ => false,
        }
    }

    /// Spawn ffmpeg. A failed spawn leaves the session unusable.
    pub async fn start(&self) -> Result<(), TranscodeError> {
        let mut inner = self.inner.lock().await;
        match inner.process {
            Process::Created => {}
            Process::Running { .. } => return Ok(()),
            Process::Failed => {
                return Err(TranscodeError::SessionStart(format!(
                    "session {} already failed to start",
                    self.id
                )));
            }
            Process::Destroyed => {
                return Err(TranscodeError::SessionStart(format!(
                    "session {} was destroyed",
                    self.id
                )));
            }
        }

        let spawned = tokio::process::Command::new(&self.ffmpeg_path)
            .args(&self.args)
            .current_dir(&self.output_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                inner.process = Process::Failed;
                return Err(TranscodeError::SessionStart(format!(
                    "spawn {}: {e}",
                    self.ffmpeg_path.display()
                )));
            }
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.id.clone(), stderr));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let session_id = self.id.clone();
        let monitor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(s) if s.success() => info!(session_id = %session_id, "ffmpeg finished"),
                    Ok(s) => warn!(session_id = %session_id, status = %s, "ffmpeg exited with failure"),
                    Err(e) => warn!(session_id = %session_id, error = %e, "failed to wait on ffmpeg"),
                },
                // Fires on an explicit kill and when the session is dropped.
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(session_id = %session_id, error = %e, "failed to kill ffmpeg");
                    }
                    debug!(session_id = %session_id, "ffmpeg killed");
                }
            }
        });

        inner.process = Process::Running {
            kill: kill_tx,
            monitor,
        };
        self.touch();
        info!(
            session_id = %self.id,
            representation = %self.stream.representation.id,
            start_index = self.start_index,
            ffmpeg = ?self.ffmpeg_path,
            args = ?self.args,
            "spawned ffmpeg"
        );
        Ok(())
    }

    /// Wait until media segment `segment_id` has been written.
    pub async fn get_segment(
        &self,
        stream_id: u32,
        segment_id: u32,
        timeout: Duration,
    ) -> Result<PathBuf, TranscodeError> {
        self.check_stream(stream_id)?;
        if segment_id < self.start_index {
            return Err(TranscodeError::NoSuchSegment(format!(
                "segment {segment_id} precedes session {} starting at {}",
                self.id, self.start_index
            )));
        }
        let what = format!(
            "segment {segment_id} of {}",
            self.stream.representation.id
        );
        self.wait_for(self.segment_path(segment_id), timeout, what)
            .await
    }

    /// Wait until the initialization segment has been written.
    pub async fn initial_segment(
        &self,
        stream_id: u32,
        timeout: Duration,
    ) -> Result<PathBuf, TranscodeError> {
        self.check_stream(stream_id)?;
        let what = format!("init segment of {}", self.stream.representation.id);
        self.wait_for(self.init_segment_path(), timeout, what).await
    }

    /// Kill the encoder and remove the output directory. Idempotent.
    pub async fn destroy(&self) {
        let mut inner = self.inner.lock().await;
        let process = std::mem::replace(&mut inner.process, Process::Destroyed);
        if let Process::Running { kill, monitor } = process {
            let _ = kill.send(());
            if let Err(e) = monitor.await {
                warn!(session_id = %self.id, error = %e, "ffmpeg monitor task failed");
            }
        }

        let Some(dir) = inner.dir.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = %self.id, error = %e, "failed to clean up transcode dir")
            }
            Err(e) => warn!(session_id = %self.id, error = %e, "cleanup task failed"),
        }
        info!(session_id = %self.id, "transcoding session destroyed");
    }

    fn check_stream(&self, stream_id: u32) -> Result<(), TranscodeError> {
        if stream_id != self.stream.stream.index {
            return Err(TranscodeError::NoSuchSegment(format!(
                "session {} encodes stream {}, not {stream_id}",
                self.id, self.stream.stream.index
            )));
        }
        Ok(())
    }

    async fn wait_for(
        &self,
        path: PathBuf,
        timeout: Duration,
        what: String,
    ) -> Result<PathBuf, TranscodeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // A waiter counts as a user, so the reaper leaves the session be.
            self.touch();
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(TranscodeError::SegmentTimeout {
                    what,
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[async_trait::async_trait]
impl ManagedSession for TranscodingSession {
    async fn destroy(&self) {
        TranscodingSession::destroy(self).await;
    }

    fn touch(&self) {
        let now = self.created_at.elapsed().as_millis() as u64;
        self.last_access_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }
}

async fn forward_stderr(session_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "ffmpeg", session_id = %session_id, "{line}");
    }
}

/// Build the ffmpeg command line for one session.
fn build_ffmpeg_args(
    source: &Path,
    stream: &StreamRepresentation,
    segments: &[Segment],
    output_dir: &Path,
    segment_duration: Duration,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];

    let start_index = segments.first().map(|s| s.segment_id).unwrap_or(0);
    let (first, last) = match (segments.first(), segments.last()) {
        (Some(first), Some(last)) => (first.interval, last.interval),
        _ => return args,
    };
    let time_base = first.time_base;

    // -ss before -i seeks on the input, which is fast. Rounding up keeps the
    // seek point from landing just before the session's first keyframe.
    if first.start != 0 {
        args.extend(["-ss".into(), seconds_arg(first.start, time_base, Rounding::Up)]);
    }

    args.extend([
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-copyts".into(),
        "-start_at_zero".into(),
        "-map".into(),
        format!("0:{}", stream.stream.index),
        "-t".into(),
        seconds_arg(last.end - first.start, time_base, Rounding::Nearest),
        "-c:0".into(),
    ]);

    match stream.preset {
        None => args.push("copy".into()),
        Some(preset) => {
            args.extend(preset.codec_args.iter().map(|a| a.to_string()));
            let bitrate = preset.bitrate.to_string();
            match preset.kind {
                StreamKind::Video => {
                    args.extend([
                        "-b:v".into(),
                        bitrate.clone(),
                        "-maxrate".into(),
                        bitrate,
                        "-bufsize".into(),
                        (preset.bitrate * 2).to_string(),
                    ]);
                    if let Some(h) = preset.height {
                        args.extend(["-vf".into(), format!("scale=-2:{h}")]);
                    }
                    // Keyframes only on the planned boundaries, so the muxer
                    // cuts exactly where the plan says.
                    args.extend([
                        "-sc_threshold".into(),
                        "0".into(),
                        "-x264-params".into(),
                        "scenecut=0:keyint=infinite".into(),
                    ]);
                    let boundaries: Vec<String> = segments
                        .iter()
                        .map(|s| seconds_arg(s.interval.start, time_base, Rounding::Down))
                        .collect();
                    args.extend(["-force_key_frames".into(), boundaries.join(",")]);
                }
                _ => args.extend(["-b:a".into(), bitrate]),
            }
        }
    }

    let movflags = if start_index != 0 {
        "movflags=+dash+frag_discont"
    } else {
        "movflags=+dash"
    };

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_segment_type".into(),
        "fmp4".into(),
        "-start_number".into(),
        start_index.to_string(),
        "-hls_time".into(),
        format!(
            "{}.{:06}",
            segment_duration.as_secs(),
            segment_duration.subsec_micros()
        ),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_flags".into(),
        "temp_file".into(),
        "-hls_fmp4_init_filename".into(),
        INIT_SEGMENT_NAME.into(),
        "-hls_segment_filename".into(),
        output_dir
            .join("stream0_%d.m4s")
            .to_string_lossy()
            .into_owned(),
        "-hls_segment_options".into(),
        movflags.into(),
        // Manifests are rendered by the server, this one is ignored.
        output_dir.join(PLAYLIST_NAME).to_string_lossy().into_owned(),
    ]);

    args
}

#[derive(Debug, Clone, Copy)]
enum Rounding {
    Down,
    Nearest,
    Up,
}

/// Render `ticks` as ffmpeg seconds with microsecond precision, the finest
/// ffmpeg parses for time options.
fn seconds_arg(ticks: i64, time_base: i64, rounding: Rounding) -> String {
    let num = i128::from(ticks.max(0)) * 1_000_000;
    let den = i128::from(time_base.max(1));
    let micros = match rounding {
        Rounding::Down => num / den,
        Rounding::Nearest => (num + den / 2) / den,
        Rounding::Up => (num + den - 1) / den,
    };
    format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000)
}

/// Remove session directories left behind by a previous run.
pub async fn sweep_orphans(transcode_dir: &Path) -> Result<usize, TranscodeError> {
    let mut entries = match tokio::fs::read_dir(transcode_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut stale = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let is_session = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(SESSION_DIR_PREFIX));
        if is_session && entry.file_type().await?.is_dir() {
            stale.push(entry.path());
        }
    }

    let results = run_bounded(stale, 4, |path| async move {
        let res = tokio::fs::remove_dir_all(&path).await;
        (path, res)
    })
    .await;

    let mut removed = 0;
    for (path, res) in results {
        match res {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphaned transcode dir"),
        }
    }
    if removed > 0 {
        info!(removed, dir = %transcode_dir.display(), "swept orphaned transcoding sessions");
    }
    Ok(removed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::tests::{audio_stream, video_stream};
    use crate::catalog::{passthrough_representation, transcoded_representation};
    use crate::planner::{Interval, plan_fixed};

    pub(crate) fn test_config(dir: &Path) -> TranscoderConfig {
        TranscoderConfig {
            transcode_dir: dir.to_path_buf(),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn audio_segments(max: usize) -> Vec<Vec<Segment>> {
        let interval = Interval::new(48_000, 0, 48_000 * 13).unwrap();
        plan_fixed(interval, Duration::from_secs(5), max)
            .unwrap()
            .sessions()
            .to_vec()
    }

    fn audio_session(config: &TranscoderConfig, session: usize) -> TranscodingSession {
        let rep = transcoded_representation(&audio_stream(1, Some(192_000)), "128k-audio").unwrap();
        TranscodingSession::new(
            config,
            Path::new("/media/movie.mkv"),
            rep,
            &audio_segments(2)[session],
        )
        .unwrap()
    }

    #[cfg(unix)]
    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Writes the init segment and the first media segment of its range.
    #[cfg(unix)]
    pub(crate) const FAKE_FFMPEG: &str = r#"n=0
while [ $# -gt 0 ]; do
  if [ "$1" = "-start_number" ]; then n=$2; fi
  shift
done
printf 'init' > init.mp4
printf 'media' > "stream0_$n.m4s"
exec sleep 30"#;

    #[test]
    fn first_session_args() {
        let tmp = tempfile::tempdir().unwrap();
        let session = audio_session(&test_config(tmp.path()), 0);
        let args = session.args().join(" ");

        assert!(!args.contains("-ss "));
        assert!(args.contains("-map 0:1"));
        assert!(args.contains("-c:0 aac -ac 2 -b:a 128000"));
        assert!(args.contains("-start_number 0"));
        assert!(args.contains("-hls_time 5.000000"));
        assert!(args.contains("-t 10.000000"));
        assert!(args.contains("movflags=+dash"));
        assert!(!args.contains("frag_discont"));
        assert_eq!(session.start_index(), 0);
        assert_eq!(session.segment_count(), 2);
        assert!(session.output_dir().starts_with(tmp.path()));
        assert!(session.id().starts_with(SESSION_DIR_PREFIX));
    }

    #[test]
    fn later_session_seeks_and_marks_discontinuity() {
        let tmp = tempfile::tempdir().unwrap();
        let session = audio_session(&test_config(tmp.path()), 1);
        let args = session.args().join(" ");

        assert!(args.contains("-ss 10.000000 -i /media/movie.mkv"));
        assert!(args.contains("-start_number 2"));
        assert!(args.contains("-t 3.000000"));
        assert!(args.contains("movflags=+dash+frag_discont"));
        assert_eq!(session.start_time(), Duration::from_secs(10));
    }

    #[test]
    fn passthrough_copies_and_video_presets_force_keyframes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let interval = Interval::new(1000, 0, 13_000).unwrap();
        let plan = plan_fixed(interval, Duration::from_secs(5), 4).unwrap();
        let video = video_stream(0, 1920, 1080);

        let copy = TranscodingSession::new(
            &config,
            Path::new("in.mkv"),
            passthrough_representation(&video),
            &plan.sessions()[0],
        )
        .unwrap();
        assert!(copy.args().join(" ").contains("-c:0 copy"));

        let x264 = TranscodingSession::new(
            &config,
            Path::new("in.mkv"),
            transcoded_representation(&video, "720-5000k-video").unwrap(),
            &plan.sessions()[0],
        )
        .unwrap();
        let args = x264.args().join(" ");
        assert!(args.contains("-c:0 libx264"));
        assert!(args.contains("-b:v 5000000"));
        assert!(args.contains("-vf scale=-2:720"));
        assert!(args.contains("-force_key_frames 0.000000,5.000000,10.000000"));
        assert!(args.contains("-sc_threshold 0 -x264-params scenecut=0:keyint=infinite"));
    }

    #[test]
    fn seek_times_keep_sub_millisecond_precision() {
        // 1 tick at 90 kHz is 11.1us: a seek must not land before it.
        assert_eq!(seconds_arg(1, 90_000, Rounding::Up), "0.000012");
        assert_eq!(seconds_arg(1, 90_000, Rounding::Down), "0.000011");
        assert_eq!(seconds_arg(900_001, 90_000, Rounding::Up), "10.000012");
        assert_eq!(seconds_arg(441_000, 44_100, Rounding::Nearest), "10.000000");
        assert_eq!(seconds_arg(0, 1000, Rounding::Up), "0.000000");
    }

    #[test]
    fn keyframe_session_seeks_to_its_exact_start() {
        let tmp = tempfile::tempdir().unwrap();
        let interval = Interval::new(90_000, 0, 90_000 * 20).unwrap();
        let keyframes = [0, 450_001, 900_001, 1_350_001];
        let plan = crate::planner::plan_keyframes(interval, &keyframes, Duration::from_secs(5), 2).unwrap();
        let video = video_stream(0, 1920, 1080);
        let session = TranscodingSession::new(
            &test_config(tmp.path()),
            Path::new("in.mkv"),
            passthrough_representation(&video),
            &plan.sessions()[1],
        )
        .unwrap();
        let args = session.args().join(" ");
        assert!(args.contains("-ss 10.000012 -i in.mkv"), "{args}");
        assert!(args.contains("-start_number 2"));
    }

    #[test]
    fn empty_session_cannot_be_created() {
        let tmp = tempfile::tempdir().unwrap();
        let rep = passthrough_representation(&audio_stream(1, None));
        let err = TranscodingSession::new(&test_config(tmp.path()), Path::new("x"), rep, &[])
            .err()
            .unwrap();
        assert!(matches!(err, TranscodeError::SessionCreate(_)));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let session = audio_session(&test_config(tmp.path()), 0);
        let dir = session.output_dir().to_path_buf();
        assert!(dir.exists());

        session.destroy().await;
        assert!(!dir.exists());
        session.destroy().await;
        assert!(!dir.exists());
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn failed_spawn_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.ffmpeg_path = tmp.path().join("no-such-ffmpeg");
        let session = audio_session(&config, 0);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, TranscodeError::SessionStart(_)));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, TranscodeError::SessionStart(_)));
        session.destroy().await;
    }

    #[tokio::test]
    async fn missing_segment_times_out_after_the_deadline() {
        let tmp = tempfile::tempdir().unwrap();
        let session = audio_session(&test_config(tmp.path()), 0);

        let started = Instant::now();
        let err = session
            .get_segment(1, 1, Duration::from_millis(300))
            .await
            .unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, TranscodeError::SegmentTimeout { .. }));
        assert!(waited >= Duration::from_millis(300), "returned early: {waited:?}");
        assert!(waited < Duration::from_secs(3), "returned late: {waited:?}");
        session.destroy().await;
    }

    #[tokio::test]
    async fn segment_written_mid_wait_is_returned() {
        let tmp = tempfile::tempdir().unwrap();
        let session = audio_session(&test_config(tmp.path()), 0);
        let path = session.segment_path(1);

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                tokio::fs::write(&path, b"media").await.unwrap();
            })
        };

        let got = session
            .get_segment(1, 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got, path);
        writer.await.unwrap();
        session.destroy().await;
    }

    #[tokio::test]
    async fn wrong_stream_or_earlier_segment_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let session = audio_session(&test_config(tmp.path()), 1);

        let err = session
            .get_segment(7, 2, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::NoSuchSegment(_)));

        let err = session
            .get_segment(1, 1, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::NoSuchSegment(_)));
        session.destroy().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn encoder_output_is_served_and_destroy_kills_it() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.ffmpeg_path = write_script(tmp.path(), "fake-ffmpeg", FAKE_FFMPEG);
        let session = audio_session(&config, 1);

        session.start().await.unwrap();
        session.start().await.unwrap();

        let init = session
            .initial_segment(1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&init).unwrap(), b"init");
        let seg = session
            .get_segment(1, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&seg).unwrap(), b"media");
        assert!(session.init_ready().await);
        assert!(session.is_running().await);

        let started = Instant::now();
        session.destroy().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!session.is_running().await);
        assert!(!session.output_dir().exists());
    }

    #[tokio::test]
    async fn idle_time_resets_on_access() {
        let tmp = tempfile::tempdir().unwrap();
        let session = audio_session(&test_config(tmp.path()), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(session.idle_for() >= Duration::from_millis(50));
        session.touch();
        assert!(session.idle_for() < Duration::from_millis(50));
        session.destroy().await;
    }

    #[tokio::test]
    async fn waiting_keeps_the_session_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        let session = std::sync::Arc::new(audio_session(&test_config(tmp.path()), 0));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.get_segment(1, 1, Duration::from_millis(600)).await })
        };
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(session.idle_for() < Duration::from_millis(150), "{:?}", session.idle_for());

        assert!(waiter.await.unwrap().is_err());
        session.destroy().await;
    }

    #[tokio::test]
    async fn sweep_removes_only_session_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join(format!("{SESSION_DIR_PREFIX}abc"))).unwrap();
        std::fs::create_dir(tmp.path().join(format!("{SESSION_DIR_PREFIX}def"))).unwrap();
        std::fs::write(tmp.path().join(format!("{SESSION_DIR_PREFIX}file")), b"x").unwrap();
        std::fs::create_dir(tmp.path().join("keep-me")).unwrap();

        assert_eq!(sweep_orphans(tmp.path()).await.unwrap(), 2);
        assert!(tmp.path().join("keep-me").exists());
        assert!(tmp.path().join(format!("{SESSION_DIR_PREFIX}file")).exists());
        assert_eq!(sweep_orphans(&tmp.path().join("missing")).await.unwrap(), 0);
    }
}
