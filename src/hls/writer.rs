// SPDX-License-Identifier: GPL-2.0-or-later

use crate::ts::{MuxError, TsMuxer};
use common::{time::Duration, EncodedUnit};
use mpeg2ts::ts::TsPacketWriter;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

/// One closed MPEG-TS segment.
///
/// Invariants: `filename` is unique per quality, `sequence` strictly
/// increasing without gaps, `duration` is positive once closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u64,
    pub filename: String,
    pub duration: Duration,
    pub start_pts: Duration,
    pub is_discontinuity: bool,
    pub path: PathBuf,
}

#[must_use]
pub fn segment_filename(sequence: u64) -> String {
    format!("segment{sequence}.ts")
}

#[derive(Debug, Error)]
pub enum OpenSegmentError {
    #[error("create '{0}': {1}")]
    Create(PathBuf, std::io::Error),

    #[error("write stream tables: {0}")]
    Header(MuxError),
}

#[derive(Debug, Error)]
pub enum WriteSegmentError {
    #[error("mux: {0}")]
    Mux(#[from] MuxError),
}

#[derive(Debug, Error)]
pub enum CloseSegmentError {
    #[error("empty segment")]
    Empty,

    #[error("flush: {0}")]
    Flush(std::io::Error),

    #[error("sync: {0}")]
    Sync(std::io::Error),
}

/// Single-use writer for one segment file. `open` writes the MPEG-TS
/// stream tables, `write` appends access units, `close` flushes, fsyncs
/// and returns the finalized record.
pub struct SegmentWriter {
    file: BufWriter<File>,
    muxer: TsMuxer,

    sequence: u64,
    filename: String,
    path: PathBuf,
    is_discontinuity: bool,

    start_pts: Option<Duration>,
    last_pts: Duration,
}

impl SegmentWriter {
    pub fn open(
        dir: &Path,
        sequence: u64,
        is_discontinuity: bool,
    ) -> Result<Self, OpenSegmentError> {
        use OpenSegmentError::*;
        let filename = segment_filename(sequence);
        let path = dir.join(&filename);

        let file = File::create(&path).map_err(|e| Create(path.clone(), e))?;
        let mut file = BufWriter::new(file);

        let mut muxer = TsMuxer::new();
        let mut writer = TsPacketWriter::new(&mut file);
        muxer.write_header(&mut writer).map_err(Header)?;

        Ok(Self {
            file,
            muxer,
            sequence,
            filename,
            path,
            is_discontinuity,
            start_pts: None,
            last_pts: Duration::new(0),
        })
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn start_pts(&self) -> Option<Duration> {
        self.start_pts
    }

    pub fn write(&mut self, unit: &EncodedUnit) -> Result<(), WriteSegmentError> {
        let mut writer = TsPacketWriter::new(&mut self.file);
        self.muxer
            .write_video(&mut writer, unit.pts, &unit.data, unit.is_keyframe)?;
        if self.start_pts.is_none() {
            self.start_pts = Some(unit.pts);
        }
        self.last_pts = unit.pts;
        Ok(())
    }

    /// Closes the file and returns the finalized segment. `end_pts` is the
    /// presentation time of the first unit of the next segment; the final
    /// segment of a stream passes None and ends at its last written unit.
    pub fn close(mut self, end_pts: Option<Duration>) -> Result<Segment, CloseSegmentError> {
        use CloseSegmentError::*;
        let start_pts = self.start_pts.ok_or(Empty)?;
        let end_pts = end_pts.unwrap_or(self.last_pts);
        let duration = end_pts.saturating_sub(start_pts);

        self.file.flush().map_err(Flush)?;
        let file = self.file.into_inner().map_err(|e| Flush(e.into_error()))?;
        file.sync_all().map_err(Sync)?;

        Ok(Segment {
            sequence: self.sequence,
            filename: self.filename,
            duration,
            start_pts,
            is_discontinuity: self.is_discontinuity,
            path: self.path,
        })
    }

    /// Abandons the segment and removes the partial file.
    pub fn discard(self) {
        _ = std::fs::remove_file(&self.path);
    }
}
