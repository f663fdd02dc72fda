// SPDX-License-Identifier: GPL-2.0-or-later

use bytes::Bytes;
use common::{time::Duration, Frame};
use thiserror::Error;

/// Settings the codec is opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecSettings {
    pub width: u32,
    pub height: u32,

    // Expected frames per second. Also the pacing unit for backpressure.
    pub frame_rate: u32,

    // Target bitrate in bits per second.
    pub bitrate: u64,

    // Maximum number of frames between keyframes.
    pub keyframe_interval: u32,
}

/// One compressed access unit out of the codec. The payload is an Annex B
/// H.264 byte stream aligned on NAL unit boundaries.
#[derive(Clone, Debug)]
pub struct CodecPacket {
    pub data: Bytes,
    pub pts: Duration,
    pub is_keyframe: bool,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec init: {0}")]
    Init(String),

    // The frame could not be consumed but the codec is still usable.
    #[error("invalid input data")]
    InvalidData,

    // The codec is broken and the session must end.
    #[error("encode: {0}")]
    Fatal(String),
}

/// Seam between the encoder pipeline and the actual H.264 implementation.
/// The production backend lives behind the `ffmpeg` cargo feature.
pub trait Codec: Send {
    /// Consumes one raw frame and appends any finished packets to `out`.
    fn encode(&mut self, frame: &Frame, out: &mut Vec<CodecPacket>) -> Result<(), CodecError>;

    /// Drains buffered packets at end of stream.
    fn flush(&mut self, out: &mut Vec<CodecPacket>) -> Result<(), CodecError>;
}

pub type DynCodec = Box<dyn Codec>;

/// Codec constructor injected into the encoder. Explicit so tests can
/// substitute their own implementation.
pub type NewCodecFn = Box<dyn Fn(&CodecSettings) -> Result<DynCodec, CodecError> + Send + Sync>;

/// The backend compiled into this build.
#[must_use]
pub fn default_codec_factory() -> NewCodecFn {
    #[cfg(feature = "ffmpeg")]
    {
        Box::new(|settings| crate::ffmpeg::FfmpegCodec::new(settings))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Box::new(|_| {
            Err(CodecError::Init(
                "built without an H.264 backend, enable the 'ffmpeg' feature".to_owned(),
            ))
        })
    }
}
