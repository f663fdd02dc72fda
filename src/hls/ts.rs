// SPDX-License-Identifier: GPL-2.0-or-later

use common::time::Duration;
use mpeg2ts::{
    es::{StreamId, StreamType},
    pes::PesHeader,
    time::{ClockReference, Timestamp},
    ts::{
        payload, AdaptationField, ContinuityCounter, EsInfo, Pid, ProgramAssociation,
        TransportScramblingControl, TsHeader, TsPacket, TsPacketWriter, TsPayload, VersionNumber,
        WriteTsPacket,
    },
};
use std::io::Write;
use thiserror::Error;

const PMT_PID: u16 = 4096;
const VIDEO_ES_PID: u16 = 256;
const PES_VIDEO_STREAM_ID: u8 = 224;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("timestamp out of range: {0:?}")]
    Timestamp(Duration),

    #[error("{0}")]
    Ts(mpeg2ts::Error),
}

impl From<mpeg2ts::Error> for MuxError {
    fn from(e: mpeg2ts::Error) -> Self {
        Self::Ts(e)
    }
}

/// Packetizes one video elementary stream into MPEG-TS. One muxer per
/// segment file; PAT and PMT are written once at the start.
pub struct TsMuxer {
    continuity: ContinuityCounter,
}

impl TsMuxer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            continuity: ContinuityCounter::default(),
        }
    }

    /// Writes PAT and PMT. Must be called once before any video.
    pub fn write_header<W: Write>(
        &mut self,
        writer: &mut TsPacketWriter<W>,
    ) -> Result<(), MuxError> {
        writer.write_ts_packet(&pat_packet()?)?;
        writer.write_ts_packet(&pmt_packet()?)?;
        Ok(())
    }

    /// Writes one access unit as a PES packet spread over TS packets.
    /// `data` is an Annex B H.264 byte stream.
    pub fn write_video<W: Write>(
        &mut self,
        writer: &mut TsPacketWriter<W>,
        pts: Duration,
        data: &[u8],
        is_keyframe: bool,
    ) -> Result<(), MuxError> {
        let timestamp = to_timestamp(pts)?;

        let mut header = ts_header(VIDEO_ES_PID, self.continuity)?;

        let mut remaining = data;
        let first = payload::Bytes::new(&remaining[..remaining.len().min(payload::Bytes::MAX_SIZE)])?;
        remaining = &remaining[first.len()..];

        // PCR rides on keyframe packets so players can lock on at segment
        // boundaries.
        let adaptation_field = is_keyframe.then(|| AdaptationField {
            discontinuity_indicator: false,
            random_access_indicator: true,
            es_priority_indicator: false,
            pcr: Some(ClockReference::from(timestamp)),
            opcr: None,
            splice_countdown: None,
            transport_private_data: Vec::new(),
            extension: None,
        });

        let packet = TsPacket {
            header: header.clone(),
            adaptation_field,
            payload: Some(TsPayload::Pes(payload::Pes {
                header: PesHeader {
                    stream_id: StreamId::new(PES_VIDEO_STREAM_ID),
                    priority: false,
                    data_alignment_indicator: true,
                    copyright: false,
                    original_or_copy: false,
                    pts: Some(timestamp),
                    dts: None,
                    escr: None,
                },
                pes_packet_len: 0,
                data: first,
            })),
        };
        writer.write_ts_packet(&packet)?;
        header.continuity_counter.increment();

        while !remaining.is_empty() {
            let chunk =
                payload::Bytes::new(&remaining[..remaining.len().min(payload::Bytes::MAX_SIZE)])?;
            remaining = &remaining[chunk.len()..];

            let packet = TsPacket {
                header: header.clone(),
                adaptation_field: None,
                payload: Some(TsPayload::Raw(chunk)),
            };
            writer.write_ts_packet(&packet)?;
            header.continuity_counter.increment();
        }

        self.continuity = header.continuity_counter;
        Ok(())
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

// 90kHz ticks. Wraps at 2^33 so roughly 26.5 hours fit.
fn to_timestamp(pts: Duration) -> Result<Timestamp, MuxError> {
    let nanos = u64::try_from(*pts).map_err(|_| MuxError::Timestamp(pts))?;
    let ticks = (nanos / 100_000) * 9;
    Timestamp::new(ticks + 1).map_err(|_| MuxError::Timestamp(pts))
}

fn ts_header(pid: u16, continuity_counter: ContinuityCounter) -> Result<TsHeader, MuxError> {
    Ok(TsHeader {
        transport_error_indicator: false,
        transport_priority: false,
        pid: Pid::new(pid)?,
        transport_scrambling_control: TransportScramblingControl::NotScrambled,
        continuity_counter,
    })
}

fn pat_packet() -> Result<TsPacket, MuxError> {
    Ok(TsPacket {
        header: ts_header(0, ContinuityCounter::default())?,
        adaptation_field: None,
        payload: Some(TsPayload::Pat(payload::Pat {
            transport_stream_id: 1,
            version_number: VersionNumber::default(),
            table: vec![ProgramAssociation {
                program_num: 1,
                program_map_pid: Pid::new(PMT_PID)?,
            }],
        })),
    })
}

fn pmt_packet() -> Result<TsPacket, MuxError> {
    Ok(TsPacket {
        header: ts_header(PMT_PID, ContinuityCounter::default())?,
        adaptation_field: None,
        payload: Some(TsPayload::Pmt(payload::Pmt {
            program_num: 1,
            pcr_pid: Some(Pid::new(VIDEO_ES_PID)?),
            version_number: VersionNumber::default(),
            program_info: Vec::new(),
            es_info: vec![EsInfo {
                stream_type: StreamType::H264,
                elementary_pid: Pid::new(VIDEO_ES_PID)?,
                descriptors: Vec::new(),
            }],
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TS_PACKET_SIZE: usize = 188;

    #[test]
    fn test_header_is_two_packets() {
        let mut buf = Vec::new();
        let mut writer = TsPacketWriter::new(&mut buf);
        TsMuxer::new().write_header(&mut writer).unwrap();
        assert_eq!(2 * TS_PACKET_SIZE, buf.len());

        // Sync byte at the start of every packet.
        assert_eq!(0x47, buf[0]);
        assert_eq!(0x47, buf[TS_PACKET_SIZE]);
    }

    #[test]
    fn test_write_video_packetizes() {
        let mut buf = Vec::new();
        let mut writer = TsPacketWriter::new(&mut buf);
        let mut muxer = TsMuxer::new();
        muxer.write_header(&mut writer).unwrap();

        let data = vec![0u8; 1000];
        muxer
            .write_video(&mut writer, Duration::from_secs(1), &data, true)
            .unwrap();

        assert_eq!(0, buf.len() % TS_PACKET_SIZE);
        assert!(buf.len() > 2 * TS_PACKET_SIZE);
        for packet in buf.chunks(TS_PACKET_SIZE) {
            assert_eq!(0x47, packet[0]);
        }
    }

    #[test]
    fn test_timestamp_out_of_range() {
        // 2^33 ticks at 90kHz is just over 26.5 hours.
        let too_far = Duration::from_hours(27);
        assert!(matches!(
            to_timestamp(too_far),
            Err(MuxError::Timestamp(_))
        ));

        to_timestamp(Duration::from_hours(26)).unwrap();
    }
}
