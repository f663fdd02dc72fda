// SPDX-License-Identifier: GPL-2.0-or-later

pub mod cors;
pub mod middleware;
pub mod ratelimit;

pub use cors::{cors, CorsSettings};
pub use middleware::{
    admin_auth, handler_timeout, rate_limit, reason, request_log, stream_auth, stream_session,
    AuthState, RateLimitState, RequestLogSettings, RequestLogState, StreamSessionState,
    StreamToken, REALM,
};
pub use ratelimit::{
    path_matches, ArcRateLimiter, RateLimitSettings, RateLimiter, DEFAULT_CLEANUP_INTERVAL,
};
