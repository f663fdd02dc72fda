// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    playlist::PlaylistView,
    writer::{OpenSegmentError, Segment, SegmentWriter},
};
use common::{time::Duration, ArcMsgLogger, EncodedUnit, LogLevel, Quality};
use std::{collections::VecDeque, path::PathBuf};
use thiserror::Error;

// Consecutive write or reopen failures before the engine reports itself
// degraded to the host.
const DEGRADED_THRESHOLD: u32 = 3;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub quality: Quality,

    // Directory holding this quality's segment files.
    pub dir: PathBuf,

    pub target_duration: Duration,
    pub retention: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Opening,
    Writing,
    Draining,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    pub segments_created: u64,
    pub segments_evicted: u64,
    pub write_failures: u64,
}

#[derive(Debug, Error)]
pub enum StartEngineError {
    #[error("already started")]
    AlreadyStarted,

    #[error("recreate segment directory '{0}': {1}")]
    InvalidDirectory(PathBuf, std::io::Error),
}

#[derive(Debug, Error)]
pub enum WriteUnitError {
    #[error("no active segment")]
    NoActiveSegment,

    #[error("first unit of a stream must be a keyframe")]
    FirstUnitNotKeyframe,

    #[error("segment io: {0}")]
    SegmentIo(#[from] OpenSegmentError),

    #[error("engine degraded after {0} consecutive write failures")]
    EngineDegraded(u32),
}

/// Where a requested segment file stands.
#[derive(Debug, PartialEq, Eq)]
pub enum SegmentLookup {
    // Closed and on disk.
    Ready(PathBuf),

    // Currently being written, not served.
    NotReady,

    // Evicted or never existed.
    NotFound,
}

/// Owns the rolling segment window for one quality: at most `retention`
/// closed segments plus at most one open writer.
///
/// State machine: Idle → Opening → Writing ⇄ Rotating → Draining → Idle.
/// Rotation happens inside `write_unit` when a keyframe arrives after the
/// target duration has elapsed.
pub struct SegmentEngine {
    config: EngineConfig,
    logger: ArcMsgLogger,

    state: State,
    writer: Option<SegmentWriter>,
    segments: VecDeque<Segment>,
    next_sequence: u64,
    delete_count: u64,

    // The next opened segment follows a discarded one and must be flagged.
    pending_discontinuity: bool,
    overdue_warned: bool,
    consecutive_failures: u32,
    stats: EngineStats,
}

impl SegmentEngine {
    #[must_use]
    pub fn new(config: EngineConfig, logger: ArcMsgLogger) -> Self {
        Self {
            config,
            logger,
            state: State::Idle,
            writer: None,
            segments: VecDeque::new(),
            next_sequence: 0,
            delete_count: 0,
            pending_discontinuity: false,
            overdue_warned: false,
            consecutive_failures: 0,
            stats: EngineStats::default(),
        }
    }

    #[must_use]
    pub fn quality(&self) -> Quality {
        self.config.quality
    }

    #[must_use]
    pub fn target_duration(&self) -> Duration {
        self.config.target_duration
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Recreates the segment directory empty and arms the engine for the
    /// first unit of a new session.
    pub fn start(&mut self) -> Result<(), StartEngineError> {
        use StartEngineError::*;
        if self.state != State::Idle {
            return Err(AlreadyStarted);
        }

        if self.config.dir.exists() {
            std::fs::remove_dir_all(&self.config.dir)
                .map_err(|e| InvalidDirectory(self.config.dir.clone(), e))?;
        }
        std::fs::create_dir_all(&self.config.dir)
            .map_err(|e| InvalidDirectory(self.config.dir.clone(), e))?;

        self.segments.clear();
        self.next_sequence = 0;
        self.delete_count = 0;
        self.pending_discontinuity = false;
        self.overdue_warned = false;
        self.consecutive_failures = 0;
        self.state = State::Opening;
        Ok(())
    }

    pub fn write_unit(&mut self, unit: &EncodedUnit) -> Result<(), WriteUnitError> {
        use WriteUnitError::*;
        match self.state {
            State::Idle | State::Draining => return Err(NoActiveSegment),
            State::Opening => {
                if !unit.is_keyframe {
                    if self.pending_discontinuity {
                        // Waiting out the tail of a discarded segment.
                        return Ok(());
                    }
                    return Err(FirstUnitNotKeyframe);
                }
                return self.open_and_write(unit);
            }
            State::Writing => {}
        }

        let start_pts = self
            .writer
            .as_ref()
            .and_then(SegmentWriter::start_pts)
            .unwrap_or(unit.pts);
        let elapsed = unit.pts.saturating_sub(start_pts);

        if unit.is_keyframe && elapsed >= self.config.target_duration {
            return self.rotate(unit);
        }

        // A split on a non-keyframe would break playback, so an overdue
        // boundary can only be logged.
        if !unit.is_keyframe && !self.overdue_warned && elapsed >= self.overdue_threshold() {
            self.logger.log(
                LogLevel::Warning,
                &format!(
                    "segment boundary overdue: {:.3}s elapsed without a keyframe",
                    elapsed.as_secs_f64()
                ),
            );
            self.overdue_warned = true;
        }

        self.write_with_retry(unit)
    }

    /// Closes the current segment and returns it. No-op after the first
    /// call.
    pub fn stop(&mut self) -> Option<Segment> {
        match self.state {
            State::Idle => return None,
            State::Opening | State::Writing | State::Draining => {}
        }
        self.state = State::Draining;

        let segment = self.writer.take().and_then(|writer| {
            match writer.close(None) {
                Ok(v) => Some(v),
                Err(e) => {
                    self.logger
                        .log(LogLevel::Error, &format!("close final segment: {e}"));
                    None
                }
            }
        });

        if let Some(segment) = &segment {
            self.segments.push_back(segment.clone());
            self.evict_over_retention();
        }

        self.state = State::Idle;
        segment
    }

    /// Deletes every live segment file. Called when the session ends; the
    /// directory only ever holds transient state.
    pub fn clear(&mut self) {
        for segment in self.segments.drain(..) {
            if let Err(e) = std::fs::remove_file(&segment.path) {
                self.logger
                    .log(LogLevel::Warning, &format!("remove '{}': {e}", segment.filename));
            }
        }
        if let Some(writer) = self.writer.take() {
            writer.discard();
        }
    }

    /// Immutable snapshot for playlist generation. Only closed segments are
    /// visible.
    #[must_use]
    pub fn playlist_view(&self) -> PlaylistView {
        PlaylistView {
            quality: self.config.quality,
            media_sequence: self
                .segments
                .front()
                .map_or(self.delete_count, |s| s.sequence),
            segments: self.segments.iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn lookup_segment(&self, filename: &str) -> SegmentLookup {
        if let Some(writer) = &self.writer {
            if writer.filename() == filename {
                return SegmentLookup::NotReady;
            }
        }
        for segment in &self.segments {
            if segment.filename == filename {
                return SegmentLookup::Ready(segment.path.clone());
            }
        }
        SegmentLookup::NotFound
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state != State::Idle
    }

    fn overdue_threshold(&self) -> Duration {
        Duration::new(*self.config.target_duration * 3 / 2)
    }

    fn open_and_write(&mut self, unit: &EncodedUnit) -> Result<(), WriteUnitError> {
        let sequence = self.next_sequence;
        let writer = match SegmentWriter::open(&self.config.dir, sequence, self.pending_discontinuity)
        {
            Ok(v) => v,
            Err(e) => {
                self.stats.write_failures += 1;
                self.consecutive_failures += 1;
                self.pending_discontinuity = true;
                if self.consecutive_failures >= DEGRADED_THRESHOLD {
                    return Err(WriteUnitError::EngineDegraded(self.consecutive_failures));
                }
                self.logger
                    .log(LogLevel::Error, &format!("open segment {sequence}: {e}"));
                return Ok(());
            }
        };
        self.next_sequence += 1;
        self.pending_discontinuity = false;
        self.overdue_warned = false;
        self.writer = Some(writer);
        self.state = State::Writing;
        self.write_with_retry(unit)
    }

    fn rotate(&mut self, unit: &EncodedUnit) -> Result<(), WriteUnitError> {
        let writer = self.writer.take().expect("writing state has a writer");
        match writer.close(Some(unit.pts)) {
            Ok(segment) => {
                self.segments.push_back(segment);
                self.stats.segments_created += 1;
                self.evict_over_retention();
            }
            Err(e) => {
                // A broken file must not enter the playlist.
                self.logger
                    .log(LogLevel::Error, &format!("close segment: {e}"));
                self.stats.write_failures += 1;
                self.pending_discontinuity = true;
            }
        }
        self.state = State::Opening;
        self.open_and_write(unit)
    }

    fn write_with_retry(&mut self, unit: &EncodedUnit) -> Result<(), WriteUnitError> {
        let writer = self.writer.as_mut().expect("writing state has a writer");
        if writer.write(unit).is_ok() {
            self.consecutive_failures = 0;
            return Ok(());
        }
        self.stats.write_failures += 1;

        match writer.write(unit) {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(e) => {
                // Abort the segment and wait for the next keyframe.
                self.logger
                    .log(LogLevel::Error, &format!("write segment: {e}"));
                self.stats.write_failures += 1;
                self.consecutive_failures += 1;

                let writer = self.writer.take().expect("checked above");
                writer.discard();
                self.pending_discontinuity = true;
                self.state = State::Opening;

                if self.consecutive_failures >= DEGRADED_THRESHOLD {
                    return Err(WriteUnitError::EngineDegraded(self.consecutive_failures));
                }
                Ok(())
            }
        }
    }

    fn evict_over_retention(&mut self) {
        while self.segments.len() > self.config.retention {
            let evicted = self.segments.pop_front().expect("len > retention");
            if let Err(e) = std::fs::remove_file(&evicted.path) {
                self.logger
                    .log(LogLevel::Warning, &format!("remove '{}': {e}", evicted.filename));
            }
            self.delete_count += 1;
            self.stats.segments_evicted += 1;
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::{time::SECOND, DummyLogger};
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};

    fn new_test_engine(retention: usize) -> (TempDir, SegmentEngine) {
        let dir = tempdir().unwrap();
        let engine = SegmentEngine::new(
            EngineConfig {
                quality: Quality::Hd,
                dir: dir.path().join("hd"),
                target_duration: Duration::from_secs(4),
                retention,
            },
            DummyLogger::new(),
        );
        (dir, engine)
    }

    fn unit(pts_secs: i64, is_keyframe: bool) -> EncodedUnit {
        EncodedUnit {
            data: Bytes::from(vec![0u8; 128]),
            pts: Duration::new(pts_secs * SECOND),
            is_keyframe,
            quality: Quality::Hd,
        }
    }

    #[test]
    fn test_rotation_and_eviction() {
        let (_dir, mut engine) = new_test_engine(3);
        engine.start().unwrap();

        // Keyframes every 4 seconds rotate on each one after the first.
        for pts in [0, 4, 8, 12, 16] {
            engine.write_unit(&unit(pts, true)).unwrap();
        }

        let view = engine.playlist_view();
        assert_eq!(3, view.segments.len());
        assert_eq!(1, view.media_sequence);

        let sequences: Vec<u64> = view.segments.iter().map(|s| s.sequence).collect();
        assert_eq!(vec![1, 2, 3], sequences);
        for segment in &view.segments {
            assert_eq!(Duration::from_secs(4), segment.duration);
        }

        // The first segment file is gone, the window files remain.
        assert_eq!(
            SegmentLookup::NotFound,
            engine.lookup_segment("segment0.ts")
        );
        assert!(matches!(
            engine.lookup_segment("segment1.ts"),
            SegmentLookup::Ready(_)
        ));
        // Segment 4 is open and must not be served.
        assert_eq!(
            SegmentLookup::NotReady,
            engine.lookup_segment("segment4.ts")
        );
    }

    #[test]
    fn test_no_split_before_target() {
        let (_dir, mut engine) = new_test_engine(5);
        engine.start().unwrap();

        engine.write_unit(&unit(0, true)).unwrap();
        // Keyframe before the target duration elapsed: same segment.
        engine.write_unit(&unit(2, true)).unwrap();
        assert_eq!(0, engine.playlist_view().segments.len());

        engine.write_unit(&unit(4, true)).unwrap();
        assert_eq!(1, engine.playlist_view().segments.len());
    }

    #[test]
    fn test_no_split_on_non_keyframe() {
        let (_dir, mut engine) = new_test_engine(5);
        engine.start().unwrap();

        engine.write_unit(&unit(0, true)).unwrap();
        // Way past the target but never a keyframe: no boundary.
        for pts in [2, 4, 6, 8, 10] {
            engine.write_unit(&unit(pts, false)).unwrap();
        }
        assert_eq!(0, engine.playlist_view().segments.len());
    }

    #[test]
    fn test_first_unit_must_be_keyframe() {
        let (_dir, mut engine) = new_test_engine(5);
        engine.start().unwrap();
        assert!(matches!(
            engine.write_unit(&unit(0, false)),
            Err(WriteUnitError::FirstUnitNotKeyframe)
        ));
    }

    #[test]
    fn test_write_before_start() {
        let (_dir, mut engine) = new_test_engine(5);
        assert!(matches!(
            engine.write_unit(&unit(0, true)),
            Err(WriteUnitError::NoActiveSegment)
        ));
    }

    #[test]
    fn test_stop_emits_final_segment_and_is_idempotent() {
        let (_dir, mut engine) = new_test_engine(5);
        engine.start().unwrap();

        engine.write_unit(&unit(0, true)).unwrap();
        engine.write_unit(&unit(2, false)).unwrap();

        let segment = engine.stop().unwrap();
        assert_eq!(0, segment.sequence);
        assert_eq!(Duration::from_secs(2), segment.duration);
        assert_eq!(1, engine.playlist_view().segments.len());

        assert!(engine.stop().is_none());
        assert!(engine.stop().is_none());
    }

    #[test]
    fn test_clear_removes_files() {
        let (_dir, mut engine) = new_test_engine(5);
        engine.start().unwrap();
        for pts in [0, 4, 8] {
            engine.write_unit(&unit(pts, true)).unwrap();
        }
        _ = engine.stop();

        let paths: Vec<_> = engine
            .playlist_view()
            .segments
            .iter()
            .map(|s| s.path.clone())
            .collect();
        assert!(!paths.is_empty());
        assert!(paths.iter().all(|p| p.exists()));

        engine.clear();
        assert!(paths.iter().all(|p| !p.exists()));
        assert_eq!(0, engine.playlist_view().segments.len());
    }

    #[test]
    fn test_restart_resets_sequence() {
        let (_dir, mut engine) = new_test_engine(5);
        engine.start().unwrap();
        for pts in [0, 4, 8] {
            engine.write_unit(&unit(pts, true)).unwrap();
        }
        _ = engine.stop();
        engine.clear();

        engine.start().unwrap();
        engine.write_unit(&unit(0, true)).unwrap();
        engine.write_unit(&unit(4, true)).unwrap();

        let view = engine.playlist_view();
        assert_eq!(0, view.media_sequence);
        assert_eq!(vec![0], view.segments.iter().map(|s| s.sequence).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequence_numbers_have_no_gaps() {
        let (_dir, mut engine) = new_test_engine(2);
        engine.start().unwrap();
        for pts in [0, 4, 8, 12, 16, 20, 24] {
            engine.write_unit(&unit(pts, true)).unwrap();
        }

        let view = engine.playlist_view();
        let sequences: Vec<u64> = view.segments.iter().map(|s| s.sequence).collect();
        assert_eq!(vec![4, 5], sequences);
        assert_eq!(4, view.media_sequence);
        assert_eq!(4, engine.stats().segments_evicted);
    }
}
