//! Segment timeline planning.
//!
//! All arithmetic happens in integer ticks of the stream's time base so that
//! thousands of small segments add up to exactly the planned interval.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TranscodeError;

/// A half-open `[start, end)` range of ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// Ticks per second.
    pub time_base: i64,
    pub start: i64,
    pub end: i64,
}

impl Interval {
    pub fn new(time_base: i64, start: i64, end: i64) -> Result<Self, TranscodeError> {
        if time_base <= 0 {
            return Err(TranscodeError::InvalidInterval(format!(
                "time base must be positive, got {time_base}"
            )));
        }
        if start >= end {
            return Err(TranscodeError::InvalidInterval(format!(
                "start {start} is not before end {end}"
            )));
        }
        Ok(Self {
            time_base,
            start,
            end,
        })
    }

    pub fn ticks(&self) -> i64 {
        self.end - self.start
    }

    pub fn duration(&self) -> Duration {
        ticks_to_duration(self.ticks(), self.time_base)
    }

    pub fn start_time(&self) -> Duration {
        ticks_to_duration(self.start, self.time_base)
    }

    pub fn end_time(&self) -> Duration {
        ticks_to_duration(self.end, self.time_base)
    }
}

/// Convert a wall-clock duration into ticks, rounding down.
pub fn duration_to_ticks(d: Duration, time_base: i64) -> i64 {
    (d.as_nanos() * time_base.max(0) as u128 / 1_000_000_000) as i64
}

pub fn ticks_to_duration(ticks: i64, time_base: i64) -> Duration {
    if ticks <= 0 || time_base <= 0 {
        return Duration::ZERO;
    }
    let nanos = ticks as u128 * 1_000_000_000 / time_base as u128;
    Duration::from_nanos(nanos as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub interval: Interval,
    pub segment_id: u32,
}

/// Segments of one stream, grouped into encoder sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPlan {
    sessions: Vec<Vec<Segment>>,
}

impl SegmentPlan {
    pub fn sessions(&self) -> &[Vec<Segment>] {
        &self.sessions
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.sessions.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.sessions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the planned session holding `segment_id`.
    pub fn locate(&self, segment_id: u32) -> Result<&[Segment], TranscodeError> {
        self.sessions
            .iter()
            .find(|session| {
                matches!(
                    (session.first(), session.last()),
                    (Some(first), Some(last))
                        if first.segment_id <= segment_id && segment_id <= last.segment_id
                )
            })
            .map(Vec::as_slice)
            .ok_or_else(|| {
                TranscodeError::NoSuchSegment(format!(
                    "segment {segment_id} is beyond the last of {} planned segments",
                    self.len()
                ))
            })
    }
}

/// Plan fixed-length segments, the last one clipped to the interval end.
pub fn plan_fixed(
    interval: Interval,
    segment_duration: Duration,
    max_per_session: usize,
) -> Result<SegmentPlan, TranscodeError> {
    let step = segment_ticks(&interval, segment_duration)?;
    plan_with(interval, max_per_session, |_, _, cursor| {
        cursor.saturating_add(step).min(interval.end)
    })
}

/// Plan segments the way ffmpeg's HLS muxer cuts a stream: segment `n` of
/// a session ends on the first keyframe at or after
/// `session start + (n + 1) * segment_duration`. Without such a keyframe the
/// segment runs to the end.
///
/// Every session is encoded by its own ffmpeg process, so the grid restarts
/// at each session's first segment. `keyframes` must be sorted ascending.
pub fn plan_keyframes(
    interval: Interval,
    keyframes: &[i64],
    segment_duration: Duration,
    max_per_session: usize,
) -> Result<SegmentPlan, TranscodeError> {
    let step = segment_ticks(&interval, segment_duration)?;
    plan_with(interval, max_per_session, |session_start, nth, cursor| {
        let target = grid_point(session_start, nth, step).max(cursor + 1);
        let idx = keyframes.partition_point(|&k| k < target);
        match keyframes.get(idx) {
            Some(&k) if k < interval.end => k,
            _ => interval.end,
        }
    })
}

/// `session_start + (nth + 1) * step`, saturating.
fn grid_point(session_start: i64, nth: usize, step: i64) -> i64 {
    let n = i64::try_from(nth).unwrap_or(i64::MAX).saturating_add(1);
    session_start.saturating_add(step.saturating_mul(n))
}

fn segment_ticks(interval: &Interval, segment_duration: Duration) -> Result<i64, TranscodeError> {
    let step = duration_to_ticks(segment_duration, interval.time_base);
    if step <= 0 {
        return Err(TranscodeError::InvalidPlan(format!(
            "segment duration {segment_duration:?} is shorter than one tick at time base {}",
            interval.time_base
        )));
    }
    Ok(step)
}

fn plan_with(
    interval: Interval,
    max_per_session: usize,
    mut next_boundary: impl FnMut(i64, usize, i64) -> i64,
) -> Result<SegmentPlan, TranscodeError> {
    if max_per_session == 0 {
        return Err(TranscodeError::InvalidPlan(
            "sessions must hold at least one segment".into(),
        ));
    }

    let mut sessions = Vec::new();
    let mut session = Vec::with_capacity(max_per_session.min(64));
    let mut cursor = interval.start;
    let mut session_start = cursor;
    let mut segment_id = 0u32;

    while cursor < interval.end {
        if session.len() >= max_per_session {
            sessions.push(std::mem::take(&mut session));
            session_start = cursor;
        }
        // Boundaries at or before the cursor would make an empty segment.
        let end = next_boundary(session_start, session.len(), cursor).max(cursor + 1);
        session.push(Segment {
            interval: Interval {
                time_base: interval.time_base,
                start: cursor,
                end,
            },
            segment_id,
        });
        segment_id += 1;
        cursor = end;
    }
    if !session.is_empty() {
        sessions.push(session);
    }

    Ok(SegmentPlan { sessions })
}
