// SPDX-License-Identifier: GPL-2.0-or-later

use crate::ratelimit::{path_matches, ArcRateLimiter};
use auth::{ArcAuth, AuthedUser};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use common::{
    time::ArcClock, ArcLogger, AuthMethod, LogEntry, LogLevel, Principal, SessionId,
};
use http::{header, StatusCode};
use log::request_log::{RequestLog, RequestRecord};
use session::ArcSessionManager;
use std::{net::SocketAddr, sync::Arc, time::Instant};

/// Realm presented in `WWW-Authenticate` challenges.
pub const REALM: &str = "CursorWindow";

// Body excerpts stored in the request log are capped at this many bytes.
const BODY_EXCERPT_LIMIT: usize = 256;
const BODY_BUFFER_LIMIT: usize = 64 * 1024;

/// Error response body: a short machine-readable reason.
#[must_use]
pub fn reason(status: StatusCode, reason: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        serde_json::json!({ "reason": reason }).to_string(),
    )
        .into_response()
}

/// Stream token attached to the request by the session layer.
#[derive(Clone, Copy, Debug)]
pub struct StreamToken(pub SessionId);

#[derive(Clone, Debug)]
pub struct RequestLogSettings {
    pub log_requests: bool,
    pub log_request_body: bool,
    pub log_response_body: bool,
    pub log_performance: bool,
    pub excluded_paths: Vec<String>,
}

#[derive(Clone)]
pub struct RequestLogState {
    pub request_log: Arc<RequestLog>,
    pub logger: ArcLogger,
    pub settings: Arc<RequestLogSettings>,
    pub clock: ArcClock,
}

/// Outermost layer: records every request in the ring, including ones the
/// inner layers reject.
pub async fn request_log(
    State(s): State<RequestLogState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    if s.settings
        .excluded_paths
        .iter()
        .any(|pattern| path_matches(pattern, &path))
    {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let remote_ip = remote_ip(&request);

    let (request, request_body) = if s.settings.log_request_body {
        buffer_request(request).await
    } else {
        (request, None)
    };

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = i64::try_from(start.elapsed().as_nanos()).unwrap_or(i64::MAX);

    let (response, response_body) = if s.settings.log_response_body {
        buffer_response(response).await
    } else {
        (response, None)
    };

    let status = response.status().as_u16();
    let record = RequestRecord {
        time: s.clock.now(),
        method: method.clone(),
        path: path.clone(),
        status,
        remote_ip,
        duration: common::time::Duration::new(duration),
        request_body,
        response_body,
    };
    s.request_log.record(record).await;

    if s.settings.log_requests {
        let msg = if s.settings.log_performance {
            format!("{method} {path} -> {status} ({}ms)", duration / 1_000_000)
        } else {
            format!("{method} {path} -> {status}")
        };
        s.logger.log(LogEntry::new(LogLevel::Debug, "http", msg));
    }

    response
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: ArcRateLimiter,
    pub enabled: bool,
}

pub async fn rate_limit(State(s): State<RateLimitState>, request: Request, next: Next) -> Response {
    if !s.enabled {
        return next.run(request).await;
    }

    // The principal when an earlier layer resolved one, the address
    // otherwise.
    let identity = request
        .extensions()
        .get::<AuthedUser>()
        .map_or_else(|| remote_ip(&request), |user| user.principal.to_string());

    if !s.limiter.check(&identity, request.uri().path()).await {
        return reason(StatusCode::TOO_MANY_REQUESTS, "too many requests");
    }
    next.run(request).await
}

#[derive(Clone)]
pub struct AuthState {
    pub auth: ArcAuth,
    pub sessions: ArcSessionManager,
    pub require_stream_auth: bool,
    pub require_admin_auth: bool,
}

/// Blocks unauthenticated requests to the stream surface. A valid stream
/// token counts as authentication; it was only ever issued to an
/// authenticated client.
pub async fn stream_auth(State(s): State<AuthState>, mut request: Request, next: Next) -> Response {
    if !s.require_stream_auth {
        return next.run(request).await;
    }

    let query = request.uri().query().unwrap_or("").to_owned();
    if let Some(user) = s.auth.validate_request(request.headers(), &query).await {
        request.extensions_mut().insert(user);
        return next.run(request).await;
    }

    if let Some(token) = token_param(&query) {
        if s.sessions.validate(token).await {
            request.extensions_mut().insert(AuthedUser {
                principal: Principal::Anonymous,
                method: AuthMethod::StreamToken,
                session: Some(token),
            });
            return next.run(request).await;
        }
    }

    unauthorized(&s)
}

/// Only allows requests that validate against the configured credential
/// method. Stream tokens do not grant admin access.
pub async fn admin_auth(State(s): State<AuthState>, mut request: Request, next: Next) -> Response {
    if !s.require_admin_auth {
        return next.run(request).await;
    }

    let query = request.uri().query().unwrap_or("").to_owned();
    if let Some(user) = s.auth.validate_request(request.headers(), &query).await {
        request.extensions_mut().insert(user);
        return next.run(request).await;
    }

    unauthorized(&s)
}

#[derive(Clone)]
pub struct StreamSessionState {
    pub sessions: ArcSessionManager,
    pub enforce: bool,
}

/// Requires a live stream session token on the stream surface.
pub async fn stream_session(
    State(s): State<StreamSessionState>,
    mut request: Request,
    next: Next,
) -> Response {
    if !s.enforce {
        return next.run(request).await;
    }

    let query = request.uri().query().unwrap_or("");
    let Some(token) = token_param(query) else {
        return reason(StatusCode::UNAUTHORIZED, "stream session required");
    };
    if !s.sessions.validate(token).await {
        return reason(StatusCode::UNAUTHORIZED, "invalid or expired stream token");
    }

    request.extensions_mut().insert(StreamToken(token));
    next.run(request).await
}

// Per-request ceiling on handler time.
const HANDLER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub async fn handler_timeout(request: Request, next: Next) -> Response {
    match tokio::time::timeout(HANDLER_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => reason(StatusCode::REQUEST_TIMEOUT, "request timed out"),
    }
}

fn unauthorized(s: &AuthState) -> Response {
    let mut response = reason(StatusCode::UNAUTHORIZED, "unauthorized");
    // Only the basic method uses a standard HTTP auth scheme, so it is the
    // only one with a challenge to advertise. Token and api-key
    // credentials ride in their own headers or query parameters.
    match s.auth.method() {
        AuthMethod::Basic => {
            if let Ok(value) = http::HeaderValue::from_str(&format!("Basic realm=\"{REALM}\"")) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
        }
        AuthMethod::None
        | AuthMethod::ApiKey
        | AuthMethod::Token
        | AuthMethod::ICloud
        | AuthMethod::StreamToken => {}
    }
    response
}

fn remote_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |info| info.0.ip().to_string())
}

fn token_param(query: &str) -> Option<SessionId> {
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("token") {
            return parts.next().unwrap_or("").parse().ok();
        }
    }
    None
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out: String = text.chars().take(BODY_EXCERPT_LIMIT).collect();
    if text.len() > out.len() {
        out.push('…');
    }
    out
}

async fn buffer_request(request: Request) -> (Request, Option<String>) {
    let (parts, body) = request.into_parts();
    match axum::body::to_bytes(body, BODY_BUFFER_LIMIT).await {
        Ok(bytes) => {
            let text = (!bytes.is_empty()).then(|| excerpt(&bytes));
            (Request::from_parts(parts, Body::from(bytes)), text)
        }
        Err(_) => (Request::from_parts(parts, Body::empty()), None),
    }
}

async fn buffer_response(response: Response) -> (Response, Option<String>) {
    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, BODY_BUFFER_LIMIT).await {
        Ok(bytes) => {
            let text = (!bytes.is_empty()).then(|| excerpt(&bytes));
            (Response::from_parts(parts, Body::from(bytes)), text)
        }
        Err(_) => (Response::from_parts(parts, Body::empty()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_token_param() {
        let id = SessionId::new();
        let query = format!("a=b&token={id}&c=d");
        assert_eq!(Some(id), token_param(&query));
        assert_eq!(None, token_param("a=b"));
        assert_eq!(None, token_param("token=not-a-uuid"));
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "x".repeat(1000);
        let got = excerpt(long.as_bytes());
        assert!(got.chars().count() <= BODY_EXCERPT_LIMIT + 1);
        assert!(got.ends_with('…'));

        assert_eq!("short", excerpt(b"short"));
    }
}
