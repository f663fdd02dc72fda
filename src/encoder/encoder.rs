// SPDX-License-Identifier: GPL-2.0-or-later

mod codec;

#[cfg(feature = "ffmpeg")]
mod ffmpeg;

pub use codec::{
    default_codec_factory, Codec, CodecError, CodecPacket, CodecSettings, DynCodec, NewCodecFn,
};

use common::{time::Duration, ArcMsgLogger, EncodedUnit, Frame, LogLevel, Quality};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;

// Upper bound on buffered encoded units between the encoder and the
// segment engine.
pub const UNIT_QUEUE_CAPACITY: usize = 64;

// Frames in flight between `submit` and the encode task. Saturation beyond
// this drops frames instead of blocking the capture thread.
const FRAME_CHANNEL_CAPACITY: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderSettings {
    pub quality: Quality,
    pub width: u32,
    pub height: u32,

    // Bits per second.
    pub bitrate: u64,

    pub frame_rate: u32,

    // Maximum frames between keyframes.
    pub keyframe_interval: u32,
}

impl EncoderSettings {
    #[must_use]
    pub fn for_quality(quality: Quality, frame_rate: u32) -> Self {
        let (width, height) = quality.resolution();
        Self {
            quality,
            width: u32::from(width),
            height: u32::from(height),
            bitrate: quality.bitrate(),
            frame_rate,
            keyframe_interval: quality.keyframe_interval(),
        }
    }

    fn validate(&self) -> Result<(), EncoderError> {
        // H.264 4:2:0 requires even dimensions.
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(EncoderError::InvalidDimensions(self.width, self.height));
        }
        if self.frame_rate == 0 {
            return Err(EncoderError::InvalidDimensions(self.width, self.height));
        }
        Ok(())
    }

    fn codec_settings(&self) -> CodecSettings {
        CodecSettings {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            bitrate: self.bitrate,
            keyframe_interval: self.keyframe_interval,
        }
    }

    fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(1) / self.frame_rate
    }
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("already encoding")]
    AlreadyEncoding,

    #[error("invalid dimensions: {0}x{1}")]
    InvalidDimensions(u32, u32),

    #[error("encoder init: {0}")]
    EncoderInit(CodecError),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("encoder not started")]
    NotStarted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub units_emitted: u64,
    pub units_dropped: u64,
}

#[derive(Default)]
struct StatsInner {
    frames_submitted: AtomicU64,
    frames_dropped: AtomicU64,
    units_emitted: AtomicU64,
    units_dropped: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> EncoderStats {
        EncoderStats {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            units_emitted: self.units_emitted.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Single-writer H.264 encoder. Frames go in through `submit`, encoded
/// units come out of the `UnitStream` returned by `start`.
///
/// Guarantees: the first emitted unit is a keyframe, PTS never decreases,
/// keyframes are never dropped by backpressure.
pub struct H264Encoder {
    logger: ArcMsgLogger,
    new_codec: NewCodecFn,
    session: Mutex<Option<Session>>,
    stats: Arc<StatsInner>,
}

struct Session {
    frame_tx: mpsc::Sender<Frame>,
    token: CancellationToken,
    done_rx: oneshot::Receiver<()>,
}

impl H264Encoder {
    #[must_use]
    pub fn new(logger: ArcMsgLogger, new_codec: NewCodecFn) -> Self {
        Self {
            logger,
            new_codec,
            session: Mutex::new(None),
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Opens the codec and spawns the encode task. Fails with
    /// `AlreadyEncoding` while a session is active.
    pub async fn start(&self, settings: EncoderSettings) -> Result<UnitStream, EncoderError> {
        use EncoderError::*;
        settings.validate()?;

        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(AlreadyEncoding);
        }

        let codec = (self.new_codec)(&settings.codec_settings()).map_err(EncoderInit)?;

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let token = CancellationToken::new();
        let queue = Arc::new(UnitQueue::new(UNIT_QUEUE_CAPACITY, self.stats.clone()));

        tokio::spawn(run_encode_task(
            codec,
            settings,
            frame_rx,
            queue.clone(),
            token.clone(),
            self.stats.clone(),
            self.logger.clone(),
            done_tx,
        ));

        *session = Some(Session {
            frame_tx,
            token,
            done_rx,
        });
        Ok(UnitStream { queue })
    }

    /// Hands one frame to the encode task. Never blocks longer than a
    /// channel send; a saturated pipeline drops the frame and counts it.
    pub async fn submit(&self, frame: Frame) -> Result<(), EncoderError> {
        use EncoderError::*;
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(NotStarted);
        };

        self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);
        match session.frame_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(EncodingFailed("encode task exited".to_owned()))
            }
        }
    }

    /// Flushes pending output and closes the codec. Idempotent.
    pub async fn stop(&self) -> Result<(), EncoderError> {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return Ok(());
        };

        // Closing the frame channel makes the task flush and exit.
        drop(session.frame_tx);
        session.token.cancel();
        _ = session.done_rx.await;
        Ok(())
    }

    pub async fn is_encoding(&self) -> bool {
        self.session.lock().await.is_some()
    }

    #[must_use]
    pub fn stats(&self) -> EncoderStats {
        self.stats.snapshot()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_encode_task(
    mut codec: DynCodec,
    settings: EncoderSettings,
    mut frame_rx: mpsc::Receiver<Frame>,
    queue: Arc<UnitQueue>,
    token: CancellationToken,
    stats: Arc<StatsInner>,
    logger: ArcMsgLogger,
    done_tx: oneshot::Sender<()>,
) {
    let frame_interval = settings.frame_interval();
    let mut delivery = UnitDelivery {
        queue: &queue,
        stats: &stats,
        quality: settings.quality,
        frame_interval,
        first_keyframe_seen: false,
        last_pts: None,
    };

    loop {
        let frame = tokio::select! {
            () = token.cancelled() => break,
            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                frame
            }
        };

        // State juggling to run the codec off the async threads.
        let result;
        (codec, result) = tokio::task::spawn_blocking(move || {
            let mut codec = codec;
            let mut packets = Vec::new();
            let result = codec.encode(&frame, &mut packets).map(|()| packets);
            (codec, result)
        })
        .await
        .expect("join");

        match result {
            Ok(packets) => {
                for packet in packets {
                    delivery.deliver(packet).await;
                }
            }
            Err(CodecError::InvalidData) => {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                logger.log(LogLevel::Warning, "dropped frame: invalid pixel data");
            }
            Err(e) => {
                logger.log(LogLevel::Error, &format!("fatal codec error: {e}"));
                queue.close_with_error(EncoderError::EncodingFailed(e.to_string()));
                _ = done_tx.send(());
                return;
            }
        }
    }

    // Final drain so the last chunk stays keyframe aligned.
    let (_, result) = tokio::task::spawn_blocking(move || {
        let mut codec = codec;
        let mut packets = Vec::new();
        let result = codec.flush(&mut packets).map(|()| packets);
        (codec, result)
    })
    .await
    .expect("join");

    match result {
        Ok(packets) => {
            for packet in packets {
                delivery.deliver(packet).await;
            }
        }
        Err(e) => logger.log(LogLevel::Warning, &format!("flush codec: {e}")),
    }

    queue.close();
    _ = done_tx.send(());
}

struct UnitDelivery<'a> {
    queue: &'a UnitQueue,
    stats: &'a StatsInner,
    quality: Quality,
    frame_interval: std::time::Duration,
    first_keyframe_seen: bool,
    last_pts: Option<Duration>,
}

impl UnitDelivery<'_> {
    async fn deliver(&mut self, packet: CodecPacket) {
        // The stream must open on a keyframe.
        if !self.first_keyframe_seen {
            if !packet.is_keyframe {
                self.stats.units_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.first_keyframe_seen = true;
        }

        // PTS must never decrease.
        if let Some(last_pts) = self.last_pts {
            if packet.pts < last_pts {
                self.stats.units_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.last_pts = Some(packet.pts);

        let unit = EncodedUnit {
            data: packet.data,
            pts: packet.pts,
            is_keyframe: packet.is_keyframe,
            quality: self.quality,
        };
        self.queue.push(unit, self.frame_interval).await;
        self.stats.units_emitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consumer side of the encoder output.
pub struct UnitStream {
    queue: Arc<UnitQueue>,
}

impl UnitStream {
    /// Next encoded unit in PTS order. None once the session ended and the
    /// queue drained. A fatal codec error is yielded once before the end.
    pub async fn recv(&mut self) -> Option<Result<EncodedUnit, EncoderError>> {
        self.queue.pop().await
    }
}

struct QueueState {
    buf: VecDeque<EncodedUnit>,
    closed: bool,
    error: Option<EncoderError>,
}

// Bounded hand-off between the encode task and the segment pump. On
// overflow the oldest non-keyframe unit is evicted; keyframes are only ever
// delayed, never dropped.
struct UnitQueue {
    state: StdMutex<QueueState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    stats: Arc<StatsInner>,
}

impl UnitQueue {
    fn new(capacity: usize, stats: Arc<StatsInner>) -> Self {
        Self {
            state: StdMutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
                error: None,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
            stats,
        }
    }

    async fn push(&self, unit: EncodedUnit, frame_interval: std::time::Duration) {
        loop {
            {
                let mut state = self.state.lock().expect("not poisoned");
                if state.closed {
                    return;
                }
                if state.buf.len() < self.capacity {
                    state.buf.push_back(unit);
                    self.readable.notify_one();
                    return;
                }

                if let Some(pos) = state.buf.iter().position(|u| !u.is_keyframe) {
                    _ = state.buf.remove(pos);
                    self.stats.units_dropped.fetch_add(1, Ordering::Relaxed);
                    state.buf.push_back(unit);
                    self.readable.notify_one();
                    return;
                }

                if !unit.is_keyframe {
                    // Queue is all keyframes; the non-keyframe loses.
                    self.stats.units_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }

            // A keyframe against a queue full of keyframes: wait up to one
            // frame interval for the consumer, then overflow the bound
            // rather than drop it.
            if tokio::time::timeout(frame_interval, self.writable.notified())
                .await
                .is_err()
            {
                let mut state = self.state.lock().expect("not poisoned");
                if !state.closed {
                    state.buf.push_back(unit);
                    self.readable.notify_one();
                }
                return;
            }
        }
    }

    async fn pop(&self) -> Option<Result<EncodedUnit, EncoderError>> {
        loop {
            {
                let mut state = self.state.lock().expect("not poisoned");
                if let Some(unit) = state.buf.pop_front() {
                    self.writable.notify_one();
                    return Some(Ok(unit));
                }
                if state.closed {
                    return state.error.take().map(Err);
                }
            }
            self.readable.notified().await;
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("not poisoned");
        state.closed = true;
        self.readable.notify_one();
    }

    fn close_with_error(&self, error: EncoderError) {
        let mut state = self.state.lock().expect("not poisoned");
        state.closed = true;
        state.error = Some(error);
        self.readable.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::{DummyLogger, PixelFormat};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    // Deterministic stand-in codec: one packet per frame, keyframe every
    // `interval` frames, PTS passed through.
    struct TestCodec {
        interval: u32,
        count: u32,
        fail: Arc<AtomicBool>,
    }

    impl Codec for TestCodec {
        fn encode(&mut self, frame: &Frame, out: &mut Vec<CodecPacket>) -> Result<(), CodecError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(CodecError::Fatal("injected".to_owned()));
            }
            let is_keyframe = self.count % self.interval == 0;
            self.count += 1;
            out.push(CodecPacket {
                data: Bytes::from(vec![0u8; 32]),
                pts: frame.pts,
                is_keyframe,
            });
            Ok(())
        }

        fn flush(&mut self, _out: &mut Vec<CodecPacket>) -> Result<(), CodecError> {
            Ok(())
        }
    }

    fn test_factory(interval: u32, fail: Arc<AtomicBool>) -> NewCodecFn {
        Box::new(move |_| {
            Ok(Box::new(TestCodec {
                interval,
                count: 0,
                fail: fail.clone(),
            }))
        })
    }

    fn test_settings() -> EncoderSettings {
        EncoderSettings::for_quality(Quality::Hd, 30)
    }

    fn frame(pts_millis: u32) -> Frame {
        Frame {
            data: Bytes::from(vec![0u8; 16]),
            width: 1280,
            height: 720,
            format: PixelFormat::Bgra,
            pts: Duration::from_millis(pts_millis),
        }
    }

    fn new_test_encoder(interval: u32) -> (H264Encoder, Arc<AtomicBool>) {
        let fail = Arc::new(AtomicBool::new(false));
        let encoder = H264Encoder::new(DummyLogger::new(), test_factory(interval, fail.clone()));
        (encoder, fail)
    }

    #[tokio::test]
    async fn test_first_unit_is_keyframe() {
        let (encoder, _) = new_test_encoder(3);

        let mut stream = encoder.start(test_settings()).await.unwrap();
        for i in 0..6 {
            encoder.submit(frame(i * 33)).await.unwrap();
            let unit = stream.recv().await.unwrap().unwrap();
            if i == 0 {
                assert!(unit.is_keyframe);
            }
        }
        encoder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pts_non_decreasing() {
        let (encoder, _) = new_test_encoder(2);
        let mut stream = encoder.start(test_settings()).await.unwrap();

        for i in 0..10 {
            encoder.submit(frame(i * 40)).await.unwrap();
        }
        encoder.stop().await.unwrap();

        let mut last = Duration::new(-1);
        while let Some(unit) = stream.recv().await {
            let unit = unit.unwrap();
            assert!(unit.pts >= last);
            last = unit.pts;
        }
    }

    #[tokio::test]
    async fn test_already_encoding() {
        let (encoder, _) = new_test_encoder(2);
        let _stream = encoder.start(test_settings()).await.unwrap();

        assert!(matches!(
            encoder.start(test_settings()).await,
            Err(EncoderError::AlreadyEncoding)
        ));

        // A new session is possible after stop.
        encoder.stop().await.unwrap();
        encoder.start(test_settings()).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_dimensions() {
        let (encoder, _) = new_test_encoder(2);
        let mut settings = test_settings();
        settings.width = 0;
        assert!(matches!(
            encoder.start(settings).await,
            Err(EncoderError::InvalidDimensions(0, _))
        ));

        let mut settings = test_settings();
        settings.height = 719;
        assert!(matches!(
            encoder.start(settings).await,
            Err(EncoderError::InvalidDimensions(_, 719))
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (encoder, _) = new_test_encoder(2);
        _ = encoder.start(test_settings()).await.unwrap();

        encoder.stop().await.unwrap();
        encoder.stop().await.unwrap();
        assert!(!encoder.is_encoding().await);
    }

    #[tokio::test]
    async fn test_submit_without_start() {
        let (encoder, _) = new_test_encoder(2);
        assert!(matches!(
            encoder.submit(frame(0)).await,
            Err(EncoderError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_fatal_codec_error_surfaces_in_stream() {
        let (encoder, fail) = new_test_encoder(1);
        let mut stream = encoder.start(test_settings()).await.unwrap();

        fail.store(true, Ordering::Relaxed);
        encoder.submit(frame(0)).await.unwrap();

        match stream.recv().await {
            Some(Err(EncoderError::EncodingFailed(_))) => {}
            other => panic!("expected encoding failure, got {other:?}"),
        }
        assert!(stream.recv().await.is_none());
    }

    fn test_unit(pts_millis: u32, is_keyframe: bool) -> EncodedUnit {
        EncodedUnit {
            data: Bytes::new(),
            pts: Duration::from_millis(pts_millis),
            is_keyframe,
            quality: Quality::Hd,
        }
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_non_keyframe() {
        let stats = Arc::new(StatsInner::default());
        let queue = UnitQueue::new(3, stats.clone());
        let interval = std::time::Duration::from_millis(5);

        queue.push(test_unit(0, true), interval).await;
        queue.push(test_unit(1, false), interval).await;
        queue.push(test_unit(2, false), interval).await;
        // Overflow evicts the unit at pts=1.
        queue.push(test_unit(3, false), interval).await;

        assert_eq!(1, stats.units_dropped.load(Ordering::Relaxed));

        let mut got = Vec::new();
        queue.close();
        while let Some(Ok(unit)) = queue.pop().await {
            got.push(unit.pts.as_millis());
        }
        assert_eq!(vec![0, 2, 3], got);
    }

    #[tokio::test]
    async fn test_queue_never_drops_keyframes() {
        let stats = Arc::new(StatsInner::default());
        let queue = UnitQueue::new(2, stats.clone());
        let interval = std::time::Duration::from_millis(1);

        queue.push(test_unit(0, true), interval).await;
        queue.push(test_unit(1, true), interval).await;
        // Queue full of keyframes; after the grace interval the bound is
        // exceeded instead of dropping.
        queue.push(test_unit(2, true), interval).await;

        assert_eq!(0, stats.units_dropped.load(Ordering::Relaxed));

        queue.close();
        let mut got = Vec::new();
        while let Some(Ok(unit)) = queue.pop().await {
            got.push(unit.pts.as_millis());
        }
        assert_eq!(vec![0, 1, 2], got);
    }
}
