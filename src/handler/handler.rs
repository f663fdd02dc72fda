// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::unused_async)]

#[cfg(test)]
mod test;

use auth::{ArcAuth, AuthError, AuthedUser, LoginCredentials};
use axum::{
    extract::{Path, Query, Request, State},
    response::{IntoResponse, Response},
    Json,
};
use common::{Principal, Quality, Session, SessionId};
use encoder::H264Encoder;
use hls::{HlsServer, ReadSegmentError};
use http::{header, StatusCode};
use log::request_log::{RequestLog, RequestLogQuery};
use session::{ArcSessionManager, SessionError};
use std::{str::FromStr, sync::Arc};
use web::{reason, StreamToken};

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/MP2T";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
        value.to_string(),
    )
        .into_response()
}

fn playlist_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

pub async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

pub async fn version_handler() -> Response {
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
    )
}

#[derive(Clone)]
pub struct StreamState {
    pub hls: Arc<HlsServer>,
    pub frame_rate: f64,
    pub base_url: String,
}

pub async fn master_playlist_handler(State(s): State<StreamState>) -> Response {
    if !s.hls.is_streaming().await {
        return reason(StatusCode::SERVICE_UNAVAILABLE, "streaming not started");
    }

    let variants = s.hls.active_variants().await;
    playlist_response(hls::master(&variants, s.frame_rate, &s.base_url))
}

pub async fn media_playlist_handler(
    State(s): State<StreamState>,
    Path(quality): Path<String>,
) -> Response {
    let Ok(quality) = Quality::from_str(&quality) else {
        return reason(StatusCode::BAD_REQUEST, "unknown quality");
    };

    let Some(view) = s.hls.playlist_view(quality).await else {
        return reason(StatusCode::NOT_FOUND, "no segments");
    };
    // An empty media playlist is useless to a player.
    if view.segments.is_empty() {
        return reason(StatusCode::NOT_FOUND, "no segments");
    }

    playlist_response(hls::media(&view, s.hls.target_duration(), &s.base_url))
}

#[derive(Clone)]
pub struct SegmentState {
    pub hls: Arc<HlsServer>,
    pub sessions: ArcSessionManager,
}

pub async fn segment_handler(
    State(s): State<SegmentState>,
    Path((quality, segment)): Path<(String, String)>,
    request: Request,
) -> Response {
    let Ok(quality) = Quality::from_str(&quality) else {
        return reason(StatusCode::BAD_REQUEST, "unknown quality");
    };

    // Fetching media counts as viewer activity.
    if let Some(StreamToken(token)) = request.extensions().get::<StreamToken>() {
        _ = s.sessions.touch(*token).await;
    }

    match s.hls.read_segment(quality, &segment).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)],
            bytes,
        )
            .into_response(),
        Err(ReadSegmentError::NotReady) => reason(StatusCode::NOT_FOUND, "segment not ready"),
        Err(ReadSegmentError::NotFound | ReadSegmentError::NotStreaming) => {
            reason(StatusCode::NOT_FOUND, "segment not found")
        }
        Err(ReadSegmentError::Io(_)) => {
            reason(StatusCode::INTERNAL_SERVER_ERROR, "segment read failed")
        }
    }
}

fn session_json(session: &Session) -> serde_json::Value {
    serde_json::json!({
        "token": session.id.to_string(),
        "expiresAt": *session.expires_at,
    })
}

pub async fn login_handler(
    State(auth): State<ArcAuth>,
    Json(credentials): Json<LoginCredentials>,
) -> Response {
    match auth.login(credentials).await {
        Ok(session) => json_response(StatusCode::OK, &session_json(&session)),
        Err(e @ (AuthError::InvalidCredentials | AuthError::Required)) => {
            reason(StatusCode::UNAUTHORIZED, &e.to_string())
        }
        Err(e @ AuthError::UnsupportedMethod(_)) => {
            reason(StatusCode::BAD_REQUEST, &e.to_string())
        }
    }
}

pub async fn logout_handler(State(auth): State<ArcAuth>, request: Request) -> Response {
    let Some(token) = query_token(request.uri().query().unwrap_or("")) else {
        return reason(StatusCode::BAD_REQUEST, "token required");
    };
    auth.logout(token).await;
    StatusCode::OK.into_response()
}

pub async fn stream_start_handler(
    State(sessions): State<ArcSessionManager>,
    request: Request,
) -> Response {
    let principal = request
        .extensions()
        .get::<AuthedUser>()
        .map_or(Principal::Anonymous, |user| user.principal.clone());

    match sessions.acquire_stream(principal).await {
        Ok(session) => json_response(StatusCode::OK, &session_json(&session)),
        Err(e @ SessionError::StreamInUse) => {
            reason(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
        Err(e) => reason(StatusCode::UNAUTHORIZED, &e.to_string()),
    }
}

pub async fn stream_stop_handler(
    State(sessions): State<ArcSessionManager>,
    request: Request,
) -> Response {
    let Some(token) = query_token(request.uri().query().unwrap_or("")) else {
        return reason(StatusCode::BAD_REQUEST, "token required");
    };
    sessions.release(token).await;
    StatusCode::OK.into_response()
}

#[derive(Clone)]
pub struct AdminState {
    pub hls: Arc<HlsServer>,
    pub encoder: Arc<H264Encoder>,
    pub auth: ArcAuth,
    pub sessions: ArcSessionManager,
}

pub async fn admin_status_handler(State(s): State<AdminState>) -> Response {
    let encoder_stats = s.encoder.stats();
    let variants: Vec<serde_json::Value> = s
        .hls
        .status()
        .await
        .into_iter()
        .map(|v| {
            serde_json::json!({
                "quality": v.quality.dir_name(),
                "active": v.active,
                "segmentCount": v.segment_count,
                "mediaSequence": v.media_sequence,
                "segmentsCreated": v.stats.segments_created,
                "segmentsEvicted": v.stats.segments_evicted,
                "writeFailures": v.stats.write_failures,
            })
        })
        .collect();

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "streaming": s.hls.is_streaming().await,
            "variants": variants,
            "encoder": {
                "framesSubmitted": encoder_stats.frames_submitted,
                "framesDropped": encoder_stats.frames_dropped,
                "unitsEmitted": encoder_stats.units_emitted,
                "unitsDropped": encoder_stats.units_dropped,
            },
            "activeStreamSessions": s.sessions.active_count().await,
        }),
    )
}

pub async fn admin_requests_handler(
    State(request_log): State<Arc<RequestLog>>,
    Query(query): Query<RequestLogQuery>,
) -> Response {
    let records = request_log.query(&query).await;
    match serde_json::to_value(&records) {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(_) => reason(StatusCode::INTERNAL_SERVER_ERROR, "serialize records"),
    }
}

pub async fn admin_sessions_handler(State(s): State<AdminState>) -> Response {
    let viewer = s.auth.sessions().await;
    let stream = s.sessions.sessions().await;
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "viewer": viewer,
            "stream": stream,
        }),
    )
}

pub async fn admin_session_delete_handler(
    State(s): State<AdminState>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = SessionId::from_str(&id) else {
        return reason(StatusCode::BAD_REQUEST, "invalid session id");
    };

    let revoked = s.auth.revoke(id).await;
    let stream = s.sessions.validate(id).await;
    if stream {
        s.sessions.release(id).await;
    }

    if revoked || stream {
        StatusCode::OK.into_response()
    } else {
        reason(StatusCode::NOT_FOUND, "session not found")
    }
}

fn query_token(query: &str) -> Option<SessionId> {
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("token") {
            return parts.next().unwrap_or("").parse().ok();
        }
    }
    None
}
