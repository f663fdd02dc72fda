// SPDX-License-Identifier: GPL-2.0-or-later

use crate::codec::{Codec, CodecError, CodecPacket, CodecSettings, DynCodec};
use bytes::Bytes;
use common::{time::Duration, Frame, PixelFormat};
use ffmpeg_next::{self as ffmpeg, codec, encoder, frame, software, Packet, Rational};

// Packet timestamps are carried in microseconds.
const TIME_BASE: (i32, i32) = (1, 1_000_000);

/// H.264 backend on top of ffmpeg. Prefers libx264. Parameter sets stay
/// inline in the bitstream (no global header) so every keyframe is
/// self-contained, which MPEG-TS segments need.
pub struct FfmpegCodec {
    settings: CodecSettings,
    encoder: encoder::video::Video,
    scaler: Option<software::scaling::Context>,
}

impl FfmpegCodec {
    pub fn new(settings: &CodecSettings) -> Result<DynCodec, CodecError> {
        use CodecError::*;
        ffmpeg::init().map_err(|e| Init(format!("ffmpeg init: {e}")))?;

        let h264 = encoder::find_by_name("libx264")
            .or_else(|| encoder::find(codec::Id::H264))
            .ok_or_else(|| Init("no H.264 encoder available".to_owned()))?;

        let ctx = codec::context::Context::new();
        let mut video = ctx
            .encoder()
            .video()
            .map_err(|e| Init(format!("video encoder: {e}")))?;

        video.set_width(settings.width);
        video.set_height(settings.height);
        video.set_format(ffmpeg::format::Pixel::YUV420P);
        video.set_time_base(Rational::new(TIME_BASE.0, TIME_BASE.1));
        video.set_frame_rate(Some(Rational::new(
            i32::try_from(settings.frame_rate).map_err(|_| Init("frame rate".to_owned()))?,
            1,
        )));
        video.set_bit_rate(
            usize::try_from(settings.bitrate).map_err(|_| Init("bitrate".to_owned()))?,
        );

        // Keyframe cadence and no B-frames, straight on the context.
        unsafe {
            let p = video.as_mut_ptr();
            (*p).gop_size =
                i32::try_from(settings.keyframe_interval).map_err(|_| Init("gop".to_owned()))?;
            (*p).max_b_frames = 0;
        }

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("preset", "veryfast");
        opts.set("tune", "zerolatency");

        let opened = video
            .open_as_with(h264, opts)
            .map_err(|e| Init(format!("open H.264 encoder: {e}")))?;

        Ok(Box::new(Self {
            settings: *settings,
            encoder: opened,
            scaler: None,
        }))
    }

    fn convert(&mut self, input: &Frame) -> Result<frame::Video, CodecError> {
        use CodecError::*;
        let src_format = match input.format {
            PixelFormat::Bgra => ffmpeg::format::Pixel::BGRA,
            PixelFormat::Nv12 => ffmpeg::format::Pixel::NV12,
            PixelFormat::Yuv420p => ffmpeg::format::Pixel::YUV420P,
        };

        if input.data.len() < input.format.frame_size(input.width, input.height) {
            return Err(InvalidData);
        }

        let mut src = frame::Video::new(src_format, input.width, input.height);
        copy_planes(&mut src, input)?;

        if input.width == self.settings.width
            && input.height == self.settings.height
            && input.format == PixelFormat::Yuv420p
        {
            return Ok(src);
        }

        let scaler = match &mut self.scaler {
            Some(v) => v,
            None => {
                let scaler = software::scaling::Context::get(
                    src_format,
                    input.width,
                    input.height,
                    ffmpeg::format::Pixel::YUV420P,
                    self.settings.width,
                    self.settings.height,
                    software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| Fatal(format!("create scaler: {e}")))?;
                self.scaler.insert(scaler)
            }
        };

        let mut dst = frame::Video::new(
            ffmpeg::format::Pixel::YUV420P,
            self.settings.width,
            self.settings.height,
        );
        scaler
            .run(&src, &mut dst)
            .map_err(|e| Fatal(format!("scale: {e}")))?;
        Ok(dst)
    }

    fn drain(&mut self, out: &mut Vec<CodecPacket>) {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            let pts_micros = packet.pts().unwrap_or(0);
            out.push(CodecPacket {
                data: Bytes::copy_from_slice(packet.data().unwrap_or(&[])),
                pts: Duration::new(pts_micros.saturating_mul(1000)),
                is_keyframe: packet.flags().contains(ffmpeg::packet::Flags::KEY),
            });
            packet = Packet::empty();
        }
    }
}

// Stride-aware copy of the capture buffer into an ffmpeg frame. Planar
// formats carry their planes contiguously in the source buffer.
fn copy_planes(dst: &mut frame::Video, src: &Frame) -> Result<(), CodecError> {
    let height = usize::try_from(src.height).map_err(|_| CodecError::InvalidData)?;
    let width = usize::try_from(src.width).map_err(|_| CodecError::InvalidData)?;

    let plane_count = dst.planes();
    let mut offset = 0;
    for plane in 0..plane_count {
        let stride = dst.stride(plane);
        let (rows, row_bytes) = match (src.format, plane) {
            (PixelFormat::Bgra, _) => (height, width * 4),
            (PixelFormat::Nv12, 0) | (PixelFormat::Yuv420p, 0) => (height, width),
            (PixelFormat::Nv12, _) => (height / 2, width),
            (PixelFormat::Yuv420p, _) => (height / 2, width / 2),
        };

        for row in 0..rows {
            let src_start = offset + row * row_bytes;
            let src_end = src_start + row_bytes;
            if src_end > src.data.len() {
                return Err(CodecError::InvalidData);
            }
            let dst_start = row * stride;
            dst.data_mut(plane)[dst_start..dst_start + row_bytes]
                .copy_from_slice(&src.data[src_start..src_end]);
        }
        offset += rows * row_bytes;
    }
    Ok(())
}

impl Codec for FfmpegCodec {
    fn encode(&mut self, frame: &Frame, out: &mut Vec<CodecPacket>) -> Result<(), CodecError> {
        let mut input = self.convert(frame)?;
        input.set_pts(Some(*frame.pts / 1000));

        self.encoder
            .send_frame(&input)
            .map_err(|e| CodecError::Fatal(format!("send frame: {e}")))?;
        self.drain(out);
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<CodecPacket>) -> Result<(), CodecError> {
        self.encoder
            .send_eof()
            .map_err(|e| CodecError::Fatal(format!("send eof: {e}")))?;
        self.drain(out);
        Ok(())
    }
}
