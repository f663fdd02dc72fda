// SPDX-License-Identifier: GPL-2.0-or-later

mod engine;
mod playlist;
mod ts;
mod writer;

pub use engine::{
    EngineConfig, EngineStats, SegmentEngine, SegmentLookup, StartEngineError, WriteUnitError,
};
pub use playlist::{event, master, media, vod, PlaylistView};
pub use ts::{MuxError, TsMuxer};
pub use writer::{segment_filename, CloseSegmentError, OpenSegmentError, Segment, SegmentWriter};

use bytes::Bytes;
use common::{
    time::Duration, ArcLogger, ArcMsgLogger, EncodedUnit, LogEntry, LogLevel, MsgLogger, Quality,
};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;

/// Entry point to the segment pipeline. Owns one engine per active quality
/// and hands out write handles to the encoder pump and read-only snapshots
/// to HTTP handlers.
pub struct HlsServer {
    logger: ArcLogger,
    segment_root: PathBuf,
    target_duration: Duration,
    retention: usize,

    engines: Mutex<HashMap<Quality, Arc<Mutex<SegmentEngine>>>>,
}

#[derive(Debug, Error)]
pub enum StartStreamError {
    #[error("start engine: {0}")]
    Start(#[from] StartEngineError),
}

#[derive(Debug, Error)]
pub enum ReadSegmentError {
    #[error("streaming not started")]
    NotStreaming,

    #[error("segment not found")]
    NotFound,

    #[error("segment is still being written")]
    NotReady,

    #[error("read segment: {0}")]
    Io(std::io::Error),
}

impl HlsServer {
    #[must_use]
    pub fn new(
        logger: ArcLogger,
        segment_root: PathBuf,
        target_duration: Duration,
        retention: usize,
    ) -> Self {
        Self {
            logger,
            segment_root,
            target_duration,
            retention,
            engines: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    /// Creates an engine for the quality and returns the write handle.
    /// Stops and replaces an existing engine for the same quality.
    pub async fn start_stream(&self, quality: Quality) -> Result<StreamWriter, StartStreamError> {
        let mut engines = self.engines.lock().await;

        if let Some(old) = engines.remove(&quality) {
            let mut old = old.lock().await;
            _ = old.stop();
            old.clear();
        }

        let mut engine = SegmentEngine::new(
            EngineConfig {
                quality,
                dir: self.segment_root.join(quality.dir_name()),
                target_duration: self.target_duration,
                retention: self.retention,
            },
            engine_logger(self.logger.clone(), quality),
        );
        engine.start()?;

        let engine = Arc::new(Mutex::new(engine));
        engines.insert(quality, engine.clone());
        Ok(StreamWriter { engine })
    }

    /// Stops the quality's engine and deletes its segment files.
    pub async fn stop_stream(&self, quality: Quality) {
        let engine = self.engines.lock().await.remove(&quality);
        if let Some(engine) = engine {
            let mut engine = engine.lock().await;
            _ = engine.stop();
            engine.clear();
        }
    }

    pub async fn stop_all(&self) {
        let engines: Vec<_> = self.engines.lock().await.drain().collect();
        for (_, engine) in engines {
            let mut engine = engine.lock().await;
            _ = engine.stop();
            engine.clear();
        }
    }

    pub async fn is_streaming(&self) -> bool {
        !self.engines.lock().await.is_empty()
    }

    /// Active qualities, highest first. The order of the master playlist.
    pub async fn active_variants(&self) -> Vec<Quality> {
        let engines = self.engines.lock().await;
        let mut variants: Vec<Quality> = engines.keys().copied().collect();
        variants.sort_unstable_by(|a, b| b.cmp(a));
        variants
    }

    /// Internally consistent snapshot for playlist generation. None if the
    /// quality has no engine.
    pub async fn playlist_view(&self, quality: Quality) -> Option<PlaylistView> {
        let engine = self.engines.lock().await.get(&quality).cloned()?;
        let engine = engine.lock().await;
        Some(engine.playlist_view())
    }

    /// Bytes of a closed segment. The file is re-opened read-only so a
    /// dropped connection mid-read cannot corrupt writer state.
    pub async fn read_segment(
        &self,
        quality: Quality,
        filename: &str,
    ) -> Result<Bytes, ReadSegmentError> {
        use ReadSegmentError::*;
        let engine = self
            .engines
            .lock()
            .await
            .get(&quality)
            .cloned()
            .ok_or(NotStreaming)?;

        let path = {
            let engine = engine.lock().await;
            match engine.lookup_segment(filename) {
                SegmentLookup::Ready(path) => path,
                SegmentLookup::NotReady => return Err(NotReady),
                SegmentLookup::NotFound => return Err(NotFound),
            }
            // Lock released before disk io.
        };

        match tokio::fs::read(&path).await {
            Ok(v) => Ok(Bytes::from(v)),
            // Evicted between lookup and read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NotFound),
            Err(e) => Err(Io(e)),
        }
    }

    pub async fn status(&self) -> Vec<VariantStatus> {
        let engines: Vec<_> = {
            let engines = self.engines.lock().await;
            engines.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        let mut out = Vec::with_capacity(engines.len());
        for (quality, engine) in engines {
            let engine = engine.lock().await;
            let view = engine.playlist_view();
            out.push(VariantStatus {
                quality,
                active: engine.is_active(),
                segment_count: view.segments.len(),
                media_sequence: view.media_sequence,
                stats: engine.stats(),
            });
        }
        out.sort_unstable_by(|a, b| b.quality.cmp(&a.quality));
        out
    }
}

#[derive(Clone, Debug)]
pub struct VariantStatus {
    pub quality: Quality,
    pub active: bool,
    pub segment_count: usize,
    pub media_sequence: u64,
    pub stats: EngineStats,
}

/// Write handle held by the encoder pump. Single producer per quality.
pub struct StreamWriter {
    engine: Arc<Mutex<SegmentEngine>>,
}

impl StreamWriter {
    pub async fn write_unit(&self, unit: &EncodedUnit) -> Result<(), WriteUnitError> {
        self.engine.lock().await.write_unit(unit)
    }

    /// Flushes the open segment. Idempotent.
    pub async fn stop(&self) -> Option<Segment> {
        self.engine.lock().await.stop()
    }
}

struct EngineLogger {
    logger: ArcLogger,
    quality: Quality,
}

impl MsgLogger for EngineLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(LogEntry::new(
            level,
            "hls",
            format!("({}) {msg}", self.quality),
        ));
    }
}

fn engine_logger(logger: ArcLogger, quality: Quality) -> ArcMsgLogger {
    Arc::new(EngineLogger { logger, quality })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::DummyLogger;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn unit(pts_secs: i64, is_keyframe: bool) -> EncodedUnit {
        EncodedUnit {
            data: Bytes::from(vec![0u8; 64]),
            pts: Duration::from_secs(u32::try_from(pts_secs).expect("positive")),
            is_keyframe,
            quality: Quality::Hd,
        }
    }

    #[tokio::test]
    async fn test_start_write_read() {
        let dir = tempdir().unwrap();
        let server = HlsServer::new(
            DummyLogger::new(),
            dir.path().to_path_buf(),
            Duration::from_secs(4),
            5,
        );

        assert!(!server.is_streaming().await);

        let writer = server.start_stream(Quality::Hd).await.unwrap();
        assert!(server.is_streaming().await);

        writer.write_unit(&unit(0, true)).await.unwrap();
        writer.write_unit(&unit(4, true)).await.unwrap();

        let view = server.playlist_view(Quality::Hd).await.unwrap();
        assert_eq!(1, view.segments.len());

        // Served bytes equal the on-disk file byte for byte.
        let got = server.read_segment(Quality::Hd, "segment0.ts").await.unwrap();
        let want = std::fs::read(dir.path().join("hd").join("segment0.ts")).unwrap();
        assert_eq!(want, got);

        // The open segment is not served.
        assert!(matches!(
            server.read_segment(Quality::Hd, "segment1.ts").await,
            Err(ReadSegmentError::NotReady)
        ));
        assert!(matches!(
            server.read_segment(Quality::Hd, "segment9.ts").await,
            Err(ReadSegmentError::NotFound)
        ));
        assert!(matches!(
            server.read_segment(Quality::Sd, "segment0.ts").await,
            Err(ReadSegmentError::NotStreaming)
        ));
    }

    #[tokio::test]
    async fn test_stop_stream_deletes_files() {
        let dir = tempdir().unwrap();
        let server = HlsServer::new(
            DummyLogger::new(),
            dir.path().to_path_buf(),
            Duration::from_secs(4),
            5,
        );

        let writer = server.start_stream(Quality::Hd).await.unwrap();
        writer.write_unit(&unit(0, true)).await.unwrap();
        writer.write_unit(&unit(4, true)).await.unwrap();

        let path = dir.path().join("hd").join("segment0.ts");
        assert!(path.exists());

        server.stop_stream(Quality::Hd).await;
        assert!(!path.exists());
        assert!(!server.is_streaming().await);
        assert!(server.playlist_view(Quality::Hd).await.is_none());
    }

    #[tokio::test]
    async fn test_active_variants_highest_first() {
        let dir = tempdir().unwrap();
        let server = HlsServer::new(
            DummyLogger::new(),
            dir.path().to_path_buf(),
            Duration::from_secs(4),
            5,
        );

        _ = server.start_stream(Quality::Sd).await.unwrap();
        _ = server.start_stream(Quality::Hd).await.unwrap();

        assert_eq!(
            vec![Quality::Hd, Quality::Sd],
            server.active_variants().await
        );
    }
}
