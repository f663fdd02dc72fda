// SPDX-License-Identifier: GPL-2.0-or-later

use crate::writer::Segment;
use common::{time::Duration, Quality};
use std::fmt::Write;

/// Immutable snapshot of one quality's segment window. Regenerated on
/// demand, never mutated.
#[derive(Clone, Debug)]
pub struct PlaylistView {
    pub quality: Quality,

    // Sequence number of the first listed segment. Advances by exactly the
    // number of evicted segments.
    pub media_sequence: u64,

    pub segments: Vec<Segment>,
}

/// Master playlist over the given variants, in the given order.
#[must_use]
pub fn master(variants: &[Quality], frame_rate: f64, base_url: &str) -> String {
    let mut out = String::with_capacity(256);
    out += "#EXTM3U\n";
    out += "#EXT-X-VERSION:3\n";

    for quality in variants {
        let (width, height) = quality.resolution();
        _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={width}x{height},FRAME-RATE={frame_rate:.3}",
            quality.bitrate(),
        );
        out += &join_url(base_url, &format!("{}/index.m3u8", quality.dir_name()));
        out += "\n";
    }

    out
}

/// Live sliding-window media playlist.
#[must_use]
pub fn media(view: &PlaylistView, target: Duration, base_url: &str) -> String {
    media_with_type(view, target, base_url, None, false)
}

/// Event playlist. The caller passes the full segment history; nothing is
/// ever removed from an event playlist.
#[must_use]
pub fn event(view: &PlaylistView, target: Duration, base_url: &str) -> String {
    media_with_type(view, target, base_url, Some("EVENT"), false)
}

/// VOD playlist with a terminating end-list marker.
#[must_use]
pub fn vod(view: &PlaylistView, target: Duration, base_url: &str) -> String {
    media_with_type(view, target, base_url, Some("VOD"), true)
}

fn media_with_type(
    view: &PlaylistView,
    target: Duration,
    base_url: &str,
    playlist_type: Option<&str>,
    end_list: bool,
) -> String {
    let mut out = String::with_capacity(512);
    out += "#EXTM3U\n";
    out += "#EXT-X-VERSION:3\n";
    _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target_duration(view, target));
    if let Some(playlist_type) = playlist_type {
        _ = writeln!(out, "#EXT-X-PLAYLIST-TYPE:{playlist_type}");
    }
    _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", view.media_sequence);

    for segment in &view.segments {
        if segment.is_discontinuity {
            out += "#EXT-X-DISCONTINUITY\n";
        }
        _ = writeln!(out, "#EXTINF:{:.3},", segment.duration.as_secs_f64());
        out += &segment_url(view.quality, &segment.filename, base_url);
        out += "\n";
    }

    if end_list {
        out += "#EXT-X-ENDLIST\n";
    }

    out
}

// EXTINF rounded to the nearest integer must be <= EXT-X-TARGETDURATION, so
// the ceiling of the longest segment wins over the configured target.
fn target_duration(view: &PlaylistView, target: Duration) -> i64 {
    let mut ret = target.as_secs_ceil();
    for segment in &view.segments {
        let v = segment.duration.as_secs_ceil();
        if v > ret {
            ret = v;
        }
    }
    ret
}

// Media playlists sit next to their segments, so URLs stay relative unless
// a base was configured.
fn segment_url(quality: Quality, filename: &str, base_url: &str) -> String {
    if base_url.is_empty() {
        return filename.to_owned();
    }
    join_url(base_url, &format!("{}/{filename}", quality.dir_name()))
}

fn join_url(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_owned();
    }
    format!("{}/{path}", base.trim_end_matches('/'))
}
