// SPDX-License-Identifier: GPL-2.0-or-later

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    time::{Duration, SECOND},
    Frame, FrameSource, PixelFormat,
};
use tokio::sync::mpsc;

/// Adapter for push-style capture producers. The capture subsystem pushes
/// frames into the sender half; the pipeline pulls them out of the
/// `FrameSource` half.
#[must_use]
pub fn push_bridge(buffer: usize) -> (PushSender, PushSource) {
    let (tx, rx) = mpsc::channel(buffer);
    (PushSender { tx }, PushSource { rx: Some(rx) })
}

pub struct PushSender {
    tx: mpsc::Sender<Frame>,
}

impl PushSender {
    /// Hands a frame to the pipeline. Returns false when the buffer is full
    /// or the source was stopped; the frame is discarded in both cases.
    pub fn push(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

pub struct PushSource {
    rx: Option<mpsc::Receiver<Frame>>,
}

#[async_trait]
impl FrameSource for PushSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.as_mut()?.recv().await
    }

    async fn stop(&mut self) {
        self.rx = None;
    }
}

/// Deterministic synthetic frame source. A moving gradient paced at the
/// configured frame rate, so the full pipeline can run without a real
/// capture stack.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_rate: u32,
    index: u64,
    paced: bool,
    stopped: bool,
}

impl TestPatternSource {
    #[must_use]
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
            index: 0,
            paced: true,
            stopped: false,
        }
    }

    /// Unpaced variant for tests that should not sleep.
    #[must_use]
    pub fn unpaced(width: u32, height: u32, frame_rate: u32) -> Self {
        let mut source = Self::new(width, height, frame_rate);
        source.paced = false;
        source
    }

    fn frame_pts(&self) -> Duration {
        let nanos = i64::try_from(self.index)
            .unwrap_or(i64::MAX)
            .saturating_mul(SECOND)
            / i64::from(self.frame_rate.max(1));
        Duration::new(nanos)
    }

    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    fn render(&self) -> Bytes {
        let width = self.width as usize;
        let height = self.height as usize;
        let mut data = vec![0u8; width * height * 4];

        // Horizontal gradient with a vertical bar sweeping one pixel per
        // frame.
        let bar = (self.index as usize) % width.max(1);
        for y in 0..height {
            for x in 0..width {
                let i = (y * width + x) * 4;
                let on_bar = x.abs_diff(bar) < 4;
                data[i] = (x * 255 / width.max(1)) as u8; // B
                data[i + 1] = (y * 255 / height.max(1)) as u8; // G
                data[i + 2] = if on_bar { 255 } else { 32 }; // R
                data[i + 3] = 255; // A
            }
        }
        Bytes::from(data)
    }
}

#[async_trait]
impl FrameSource for TestPatternSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        if self.stopped {
            return None;
        }

        if self.paced && self.index > 0 {
            let interval = std::time::Duration::from_secs(1) / self.frame_rate.max(1);
            tokio::time::sleep(interval).await;
        }

        let frame = Frame {
            data: self.render(),
            width: self.width,
            height: self.height,
            format: PixelFormat::Bgra,
            pts: self.frame_pts(),
        };
        self.index += 1;
        Some(frame)
    }

    async fn stop(&mut self) {
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_pattern_is_deterministic() {
        let mut a = TestPatternSource::unpaced(64, 36, 30);
        let mut b = TestPatternSource::unpaced(64, 36, 30);

        let frame_a = a.next_frame().await.unwrap();
        let frame_b = b.next_frame().await.unwrap();
        assert_eq!(frame_a.data, frame_b.data);
        assert_eq!(Duration::new(0), frame_a.pts);
        assert_eq!(64 * 36 * 4, frame_a.data.len());
    }

    #[tokio::test]
    async fn test_pattern_pts_advances() {
        let mut source = TestPatternSource::unpaced(16, 16, 25);
        let first = source.next_frame().await.unwrap();
        let second = source.next_frame().await.unwrap();
        assert_eq!(Duration::new(0), first.pts);
        assert_eq!(Duration::from_millis(40), second.pts);
    }

    #[tokio::test]
    async fn test_pattern_stop() {
        let mut source = TestPatternSource::unpaced(16, 16, 25);
        source.next_frame().await.unwrap();
        source.stop().await;
        assert!(source.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_push_bridge() {
        let (sender, mut source) = push_bridge(2);

        let frame = Frame {
            data: Bytes::from_static(&[0, 0, 0, 255]),
            width: 1,
            height: 1,
            format: PixelFormat::Bgra,
            pts: Duration::new(0),
        };
        assert!(sender.push(frame.clone()));
        assert!(sender.push(frame.clone()));
        // Buffer full.
        assert!(!sender.push(frame.clone()));

        assert!(source.next_frame().await.is_some());
        source.stop().await;
        assert!(source.next_frame().await.is_none());
        assert!(!sender.push(frame));
    }
}
