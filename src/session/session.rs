// SPDX-License-Identifier: GPL-2.0-or-later

use common::{
    time::{ArcClock, Duration, UnixNano},
    ArcMsgLogger, AuthMethod, LogLevel, Principal, Session, SessionId, SessionObfuscated,
};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;

pub type ArcSessionManager = Arc<SessionManager>;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::new(60 * common::time::SECOND);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("stream is in use")]
    StreamInUse,

    #[error("invalid token")]
    InvalidToken,

    #[error("session expired")]
    Expired,
}

/// Issues and polices stream tokens. In single-viewer mode at most one
/// valid stream session exists at any moment; acquisition is serialized on
/// the table lock, so exactly one concurrent `acquire_stream` wins.
pub struct SessionManager {
    single_viewer: bool,
    idle_timeout: Duration,
    session_duration: Duration,

    sessions: Mutex<HashMap<SessionId, Session>>,

    clock: ArcClock,
    logger: ArcMsgLogger,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        single_viewer: bool,
        idle_timeout: Duration,
        session_duration: Duration,
        clock: ArcClock,
        logger: ArcMsgLogger,
    ) -> ArcSessionManager {
        Arc::new(Self {
            single_viewer,
            idle_timeout,
            session_duration,
            sessions: Mutex::new(HashMap::new()),
            clock,
            logger,
        })
    }

    /// Issues a new stream token. Fails with `StreamInUse` while another
    /// valid session exists and single-viewer mode is enabled.
    pub async fn acquire_stream(&self, principal: Principal) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;

        if self.single_viewer && sessions.values().any(|s| self.is_live(s, now)) {
            return Err(SessionError::StreamInUse);
        }

        let session = Session {
            id: SessionId::new(),
            principal,
            auth_method: AuthMethod::StreamToken,
            created_at: now,
            expires_at: now
                .add_duration(self.session_duration)
                .unwrap_or(UnixNano::MAX),
            last_activity: now,
        };
        sessions.insert(session.id, session.clone());

        self.logger
            .log(LogLevel::Info, &format!("stream session acquired: {}", session.id));
        Ok(session)
    }

    /// Marks the session as active now.
    pub async fn touch(&self, token: SessionId) -> Result<(), SessionError> {
        use SessionError::*;
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&token).ok_or(InvalidToken)?;
        if !self.is_live(session, now) {
            return Err(Expired);
        }
        session.last_activity = now;
        Ok(())
    }

    /// True iff the token belongs to a live stream session.
    pub async fn validate(&self, token: SessionId) -> bool {
        let now = self.clock.now();
        let sessions = self.sessions.lock().await;
        sessions.get(&token).is_some_and(|s| self.is_live(s, now))
    }

    /// Clears the session. Idempotent.
    pub async fn release(&self, token: SessionId) {
        if self.sessions.lock().await.remove(&token).is_some() {
            self.logger
                .log(LogLevel::Info, &format!("stream session released: {token}"));
        }
    }

    /// Evicts sessions idle past the timeout or past their expiry. Invoked
    /// periodically by the janitor, at least once per second.
    pub async fn reap(&self) {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| self.is_live(session, now));
        let reaped = before - sessions.len();
        if reaped > 0 {
            self.logger
                .log(LogLevel::Debug, &format!("reaped {reaped} idle stream sessions"));
        }
    }

    pub async fn active_count(&self) -> usize {
        let now = self.clock.now();
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|s| self.is_live(s, now)).count()
    }

    pub async fn sessions(&self) -> Vec<SessionObfuscated> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<SessionObfuscated> = sessions.values().map(Session::obfuscate).collect();
        list.sort_by_key(|s| *s.created_at);
        list
    }

    fn is_live(&self, session: &Session, now: UnixNano) -> bool {
        if !session.is_valid(now) {
            return false;
        }
        let idle = now.sub(session.last_activity).unwrap_or(Duration::new(0));
        idle < self.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{time::ManualClock, DummyLogger};
    use pretty_assertions::assert_eq;

    fn new_test_manager(single_viewer: bool) -> (Arc<ManualClock>, ArcSessionManager) {
        let clock = ManualClock::new(UnixNano::new(0));
        let manager = SessionManager::new(
            single_viewer,
            DEFAULT_IDLE_TIMEOUT,
            Duration::from_hours(1),
            clock.clone(),
            DummyLogger::new(),
        );
        (clock, manager)
    }

    #[tokio::test]
    async fn test_single_viewer() {
        let (_, manager) = new_test_manager(true);

        let first = manager.acquire_stream(Principal::Anonymous).await.unwrap();
        assert_eq!(AuthMethod::StreamToken, first.auth_method);

        assert_eq!(
            Err(SessionError::StreamInUse),
            manager
                .acquire_stream(Principal::Anonymous)
                .await
                .map(|_| ())
        );

        // Releasing makes the manager acquirable again.
        manager.release(first.id).await;
        manager.acquire_stream(Principal::Anonymous).await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_viewer() {
        let (_, manager) = new_test_manager(false);
        manager.acquire_stream(Principal::Anonymous).await.unwrap();
        manager.acquire_stream(Principal::Anonymous).await.unwrap();
        assert_eq!(2, manager.active_count().await);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let (_, manager) = new_test_manager(true);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.acquire_stream(Principal::Anonymous).await.is_ok()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(1, winners);
    }

    #[tokio::test]
    async fn test_touch_extends_session() {
        let (clock, manager) = new_test_manager(true);
        let session = manager.acquire_stream(Principal::Anonymous).await.unwrap();

        // Keep touching past the idle timeout.
        for _ in 0..4 {
            clock.advance(Duration::from_secs(30));
            manager.touch(session.id).await.unwrap();
        }
        assert!(manager.validate(session.id).await);

        // Without touches the session goes idle.
        clock.advance(Duration::from_secs(61));
        assert!(!manager.validate(session.id).await);
        assert_eq!(Err(SessionError::Expired), manager.touch(session.id).await);
    }

    #[tokio::test]
    async fn test_touch_unknown_token() {
        let (_, manager) = new_test_manager(true);
        assert_eq!(
            Err(SessionError::InvalidToken),
            manager.touch(SessionId::new()).await
        );
    }

    #[tokio::test]
    async fn test_reap() {
        let (clock, manager) = new_test_manager(true);
        let session = manager.acquire_stream(Principal::Anonymous).await.unwrap();

        clock.advance(Duration::from_secs(61));
        manager.reap().await;
        assert_eq!(0, manager.sessions().await.len());

        // An idle holder no longer blocks acquisition.
        assert!(manager.acquire_stream(Principal::Anonymous).await.is_ok());
        assert_eq!(Err(SessionError::InvalidToken), manager.touch(session.id).await);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_, manager) = new_test_manager(true);
        let session = manager.acquire_stream(Principal::Anonymous).await.unwrap();
        manager.release(session.id).await;
        manager.release(session.id).await;
    }
}
