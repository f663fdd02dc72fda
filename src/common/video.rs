// SPDX-License-Identifier: GPL-2.0-or-later

use crate::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Closed set of stream qualities. Each quality carries its target
/// resolution, bitrate, keyframe interval and on-disk directory name.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Sd,
    Hd,
    FullHd,
}

impl Quality {
    #[must_use]
    pub fn all() -> [Quality; 3] {
        [Quality::Sd, Quality::Hd, Quality::FullHd]
    }

    #[must_use]
    pub fn resolution(&self) -> (u16, u16) {
        match self {
            Quality::Sd => (854, 480),
            Quality::Hd => (1280, 720),
            Quality::FullHd => (1920, 1080),
        }
    }

    // Target bitrate in bits per second.
    #[must_use]
    pub fn bitrate(&self) -> u64 {
        match self {
            Quality::Sd => 1_000_000,
            Quality::Hd => 2_500_000,
            Quality::FullHd => 5_000_000,
        }
    }

    // Maximum number of frames between keyframes.
    #[must_use]
    pub fn keyframe_interval(&self) -> u32 {
        60
    }

    // Directory name under the segment root. Equal to the lowercase label.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Quality::Sd => "sd",
            Quality::Hd => "hd",
            Quality::FullHd => "fullhd",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown quality: '{0}'")]
pub struct ParseQualityError(String);

impl FromStr for Quality {
    type Err = ParseQualityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sd" => Ok(Quality::Sd),
            "hd" => Ok(Quality::Hd),
            "fullhd" => Ok(Quality::FullHd),
            _ => Err(ParseQualityError(s.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra,
    Nv12,
    Yuv420p,
}

impl PixelFormat {
    // Size in bytes of one frame at the given dimensions.
    #[must_use]
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = usize::try_from(width).unwrap_or(0) * usize::try_from(height).unwrap_or(0);
        match self {
            PixelFormat::Bgra => pixels * 4,
            PixelFormat::Nv12 | PixelFormat::Yuv420p => pixels + pixels / 2,
        }
    }
}

/// One raw video frame. Created by the frame source, consumed once by the
/// encoder, never stored.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    // Presentation time relative to the start of the capture session.
    pub pts: Duration,
}

/// One encoded H.264 chunk. A plain value owned by the receiver.
#[derive(Clone, Debug)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub pts: Duration,
    pub is_keyframe: bool,
    pub quality: Quality,
}

impl fmt::Display for EncodedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pts: {:?}, len: {}, IDR: {}",
            self.pts,
            self.data.len(),
            self.is_keyframe
        )
    }
}

/// Pull source of raw frames. The capture subsystem implements this;
/// everything downstream only sees the trait.
#[async_trait]
pub trait FrameSource {
    // Next frame in presentation order. None means the source ended.
    async fn next_frame(&mut self) -> Option<Frame>;

    // Tears the source down. Further `next_frame` calls return None.
    async fn stop(&mut self);
}

pub type DynFrameSource = Box<dyn FrameSource + Send>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("sd", Quality::Sd)]
    #[test_case("hd", Quality::Hd)]
    #[test_case("fullhd", Quality::FullHd)]
    fn test_parse_quality(input: &str, want: Quality) {
        assert_eq!(want, input.parse().unwrap());
        assert_eq!(input, want.dir_name());
    }

    #[test]
    fn test_parse_quality_unknown() {
        assert_eq!(
            ParseQualityError("4k".to_owned()),
            Quality::from_str("4k").unwrap_err()
        );
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(16, PixelFormat::Bgra.frame_size(2, 2));
        assert_eq!(6, PixelFormat::Nv12.frame_size(2, 2));
        assert_eq!(6, PixelFormat::Yuv420p.frame_size(2, 2));
    }
}
