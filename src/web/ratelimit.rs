// SPDX-License-Identifier: GPL-2.0-or-later

use common::time::{ArcClock, Duration, UnixNano};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type ArcRateLimiter = Arc<RateLimiter>;

// Admission window.
const WINDOW: Duration = Duration::new(60 * common::time::SECOND);

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::new(5 * 60 * common::time::SECOND);

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub requests_per_minute: u32,

    // Glob patterns; matching paths are never limited.
    pub excluded_paths: Vec<String>,

    // Fraction of the limit granted to authentication endpoints, in (0, 1].
    pub auth_endpoint_multiplier: f64,
}

/// Sliding-window request admission per identity: the authenticated
/// principal when present, otherwise the client address.
pub struct RateLimiter {
    settings: RateLimitSettings,
    state: Mutex<HashMap<String, VecDeque<UnixNano>>>,
    clock: ArcClock,
}

impl RateLimiter {
    #[must_use]
    pub fn new(settings: RateLimitSettings, clock: ArcClock) -> ArcRateLimiter {
        Arc::new(Self {
            settings,
            state: Mutex::new(HashMap::new()),
            clock,
        })
    }

    /// Admits or rejects one request. Admitted requests are recorded.
    pub async fn check(&self, identity: &str, path: &str) -> bool {
        if self.is_excluded(path) {
            return true;
        }

        let limit = self.effective_limit(path);
        let now = self.clock.now();
        let window_start = now.sub_duration(WINDOW).unwrap_or(UnixNano::new(0));

        let mut state = self.state.lock().await;
        let requests = state.entry(identity.to_owned()).or_default();

        while requests.front().is_some_and(|t| t.before(window_start)) {
            requests.pop_front();
        }

        if requests.len() >= usize::try_from(limit).unwrap_or(usize::MAX) {
            return false;
        }
        requests.push_back(now);
        true
    }

    /// Drops identities with no requests inside the window. Called from the
    /// janitor on the configured interval.
    pub async fn cleanup(&self) {
        let window_start = self
            .clock
            .now()
            .sub_duration(WINDOW)
            .unwrap_or(UnixNano::new(0));

        let mut state = self.state.lock().await;
        state.retain(|_, requests| requests.back().is_some_and(|t| !t.before(window_start)));
    }

    pub async fn tracked_identities(&self) -> usize {
        self.state.lock().await.len()
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.settings
            .excluded_paths
            .iter()
            .any(|pattern| path_matches(pattern, path))
    }

    #[allow(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn effective_limit(&self, path: &str) -> u32 {
        let limit = self.settings.requests_per_minute;
        if path.starts_with("/auth") {
            let scaled = (f64::from(limit) * self.settings.auth_endpoint_multiplier) as u32;
            return scaled.max(1);
        }
        limit
    }
}

/// Glob match where `*` matches any run of characters.
#[must_use]
pub fn path_matches(pattern: &str, path: &str) -> bool {
    fn inner(pattern: &[u8], path: &[u8]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], path) || (!path.is_empty() && inner(pattern, &path[1..]))
            }
            (Some(p), Some(c)) if p == c => inner(&pattern[1..], &path[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), path.as_bytes())
}
