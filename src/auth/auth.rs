// SPDX-License-Identifier: GPL-2.0-or-later

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use common::{
    time::{ArcClock, Duration},
    ArcMsgLogger, AuthMethod, LogLevel, Principal, Session, SessionId, SessionObfuscated, Username,
};
use headers::authorization::{Basic, Credentials};
use http::{HeaderMap, HeaderValue};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::{runtime::Handle, sync::Mutex};

pub type ArcAuth = Arc<AuthManager>;

/// Validated identity attached to a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthedUser {
    pub principal: Principal,
    pub method: AuthMethod,
    pub session: Option<SessionId>,
}

pub type ValidateResponse = Option<AuthedUser>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    Required,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("unsupported auth method: '{0}'")]
    UnsupportedMethod(AuthMethod),
}

#[derive(Debug, Error)]
pub enum NewAuthError {
    #[error("method 'basic' requires username and password")]
    MissingBasicCredentials,

    #[error("method 'apikey' requires api_key")]
    MissingApiKey,

    #[error("hash password: {0}")]
    HashPassword(String),
}

/// Credentials presented to the login endpoint. A closed set; dispatch is
/// by variant.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum LoginCredentials {
    Basic {
        username: Username,
        password: String,
    },

    ApiKey {
        #[serde(rename = "apiKey")]
        api_key: String,
    },

    Token {
        token: String,
    },

    ICloud {
        #[serde(rename = "deviceId")]
        device_id: String,

        #[serde(rename = "identityToken")]
        identity_token: String,
    },
}

#[derive(Clone, Debug)]
pub struct AuthSettings {
    pub method: AuthMethod,
    pub username: Option<Username>,

    // Plain password from the config. Hashed once on startup and dropped.
    pub password: Option<String>,

    pub api_key: Option<String>,
    pub session_duration: Duration,
}

struct AuthData {
    password_hash: Option<String>,
    username: Option<Username>,
    api_key_digest: Option<[u8; 32]>,

    sessions: HashMap<SessionId, Session>,

    // Caches successful Authorization header validations so each request
    // doesn't pay the argon2 cost.
    response_cache: HashMap<String, ValidateResponse>,
}

/// Validates credentials and owns the session table.
///
/// The enabled method is a closed variant; anything else is rejected with
/// `UnsupportedMethod`. Secret comparisons are constant-time with respect
/// to the stored secret: passwords go through argon2, API keys are
/// compared as SHA-256 digests. The token method carries no static secret
/// at all; its credential is a session id minted on startup and rotated
/// through the login endpoint.
pub struct AuthManager {
    method: AuthMethod,
    session_duration: Duration,

    data: Mutex<AuthData>,

    // Limit parallel hashing operations to mitigate resource exhaustion
    // attacks.
    hash_lock: Mutex<()>,

    clock: ArcClock,
    logger: ArcMsgLogger,
    rt_handle: Handle,
}

impl AuthManager {
    pub async fn new(
        rt_handle: Handle,
        settings: AuthSettings,
        clock: ArcClock,
        logger: ArcMsgLogger,
    ) -> Result<ArcAuth, NewAuthError> {
        use NewAuthError::*;

        let password_hash = match settings.method {
            AuthMethod::Basic => {
                let (Some(_), Some(password)) = (&settings.username, &settings.password) else {
                    return Err(MissingBasicCredentials);
                };
                Some(hash_password(&rt_handle, password.clone()).await?)
            }
            AuthMethod::ApiKey => {
                if settings.api_key.is_none() {
                    return Err(MissingApiKey);
                }
                None
            }
            AuthMethod::None | AuthMethod::Token | AuthMethod::ICloud | AuthMethod::StreamToken => {
                None
            }
        };

        let api_key_digest = settings.api_key.as_deref().map(digest);

        let manager = Arc::new(Self {
            method: settings.method,
            session_duration: settings.session_duration,
            data: Mutex::new(AuthData {
                password_hash,
                username: settings.username,
                api_key_digest,
                sessions: HashMap::new(),
                response_cache: HashMap::new(),
            }),
            hash_lock: Mutex::new(()),
            clock,
            logger,
            rt_handle,
        });

        // The token method has no static secret. Mint the first session on
        // startup; clients rotate it through the login endpoint.
        if manager.method == AuthMethod::Token {
            let session = manager
                .new_session(Principal::Anonymous, AuthMethod::Token)
                .await;
            manager.logger.log(
                LogLevel::Notice,
                &format!("generated access token: {}", session.id),
            );
        }

        Ok(manager)
    }

    #[must_use]
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Validates raw request credentials: the Authorization header, the
    /// `X-API-Key` header or `api_key` query parameter, or a previously
    /// issued session token. Returns None for anything invalid.
    pub async fn validate_request(&self, headers: &HeaderMap<HeaderValue>, query: &str) -> ValidateResponse {
        if self.method == AuthMethod::None {
            return Some(AuthedUser {
                principal: Principal::Anonymous,
                method: AuthMethod::None,
                session: None,
            });
        }

        // Sessions are accepted for every method once issued. For the
        // token method they are the only credential.
        if let Some(token) = token_from_request(headers, query) {
            if let Some(user) = self.validate_token(token).await {
                return Some(user);
            }
        }

        match self.method {
            AuthMethod::Basic => self.validate_basic_header(headers).await,
            AuthMethod::ApiKey => self.validate_api_key_request(headers, query).await,
            AuthMethod::None | AuthMethod::Token | AuthMethod::ICloud | AuthMethod::StreamToken => {
                None
            }
        }
    }

    /// Validates explicit login credentials and issues a session.
    pub async fn login(&self, credentials: LoginCredentials) -> Result<Session, AuthError> {
        use AuthError::*;
        match (self.method, credentials) {
            (AuthMethod::None, _) => {
                Ok(self.new_session(Principal::Anonymous, AuthMethod::None).await)
            }
            (AuthMethod::Basic, LoginCredentials::Basic { username, password }) => {
                if !self.check_basic(&username, &password).await {
                    self.log_failed_login(&username);
                    return Err(InvalidCredentials);
                }
                Ok(self
                    .new_session(Principal::User(username), AuthMethod::Basic)
                    .await)
            }
            (AuthMethod::ApiKey, LoginCredentials::ApiKey { api_key }) => {
                if !self.check_api_key(&api_key).await {
                    return Err(InvalidCredentials);
                }
                Ok(self
                    .new_session(Principal::Anonymous, AuthMethod::ApiKey)
                    .await)
            }
            // The credential is itself a session id. A valid one rotates
            // into a fresh session with a new expiry.
            (AuthMethod::Token, LoginCredentials::Token { token }) => {
                let Ok(token) = token.parse::<SessionId>() else {
                    return Err(InvalidCredentials);
                };
                let principal = {
                    let now = self.clock.now();
                    let data = self.data.lock().await;
                    let Some(session) = data.sessions.get(&token) else {
                        return Err(InvalidCredentials);
                    };
                    if !session.is_valid(now) {
                        return Err(InvalidCredentials);
                    }
                    session.principal.clone()
                };
                Ok(self.new_session(principal, AuthMethod::Token).await)
            }
            // The pair is validated by the device registry upstream; an
            // opaque non-empty pair yields a session here.
            (
                AuthMethod::ICloud,
                LoginCredentials::ICloud {
                    device_id,
                    identity_token,
                },
            ) => {
                if device_id.is_empty() || identity_token.is_empty() {
                    return Err(InvalidCredentials);
                }
                let principal = match Username::try_from(device_id) {
                    Ok(v) => Principal::User(v),
                    Err(_) => Principal::Anonymous,
                };
                Ok(self.new_session(principal, AuthMethod::ICloud).await)
            }
            (method, _) => Err(UnsupportedMethod(method)),
        }
    }

    /// True iff the session exists and has not expired. Bumps the
    /// session's last activity.
    pub async fn validate_token(&self, token: SessionId) -> ValidateResponse {
        let now = self.clock.now();
        let mut data = self.data.lock().await;
        let session = data.sessions.get_mut(&token)?;
        if !session.is_valid(now) {
            return None;
        }
        session.last_activity = now;
        Some(AuthedUser {
            principal: session.principal.clone(),
            method: session.auth_method,
            session: Some(session.id),
        })
    }

    /// Removes the session. Idempotent.
    pub async fn logout(&self, token: SessionId) {
        self.data.lock().await.sessions.remove(&token);
    }

    /// Drops expired sessions. Called from the janitor.
    pub async fn prune(&self) {
        let now = self.clock.now();
        let mut data = self.data.lock().await;
        data.sessions.retain(|_, session| session.is_valid(now));
    }

    pub async fn sessions(&self) -> Vec<SessionObfuscated> {
        let data = self.data.lock().await;
        let mut list: Vec<SessionObfuscated> =
            data.sessions.values().map(Session::obfuscate).collect();
        list.sort_by_key(|s| *s.created_at);
        list
    }

    pub async fn revoke(&self, id: SessionId) -> bool {
        self.data.lock().await.sessions.remove(&id).is_some()
    }

    async fn new_session(&self, principal: Principal, method: AuthMethod) -> Session {
        let now = self.clock.now();
        let session = Session {
            id: SessionId::new(),
            principal,
            auth_method: method,
            created_at: now,
            expires_at: now
                .add_duration(self.session_duration)
                .unwrap_or(common::time::UnixNano::MAX),
            last_activity: now,
        };
        self.data
            .lock()
            .await
            .sessions
            .insert(session.id, session.clone());
        session
    }

    /// Should always take the same amount of time to run, even when the
    /// username or password is invalid.
    async fn validate_basic_header(&self, headers: &HeaderMap<HeaderValue>) -> ValidateResponse {
        let auth_header = headers.get("Authorization")?;
        let auth_header_str = auth_header.to_str().ok()?;
        let decoded = Basic::decode(auth_header)?;

        let username = Username::try_from(decoded.username().to_owned()).ok()?;

        {
            let data = self.data.lock().await;
            if let Some(res) = data.response_cache.get(auth_header_str) {
                return res.clone();
            }
        }

        if self.check_basic(&username, decoded.password()).await {
            let response = Some(AuthedUser {
                principal: Principal::User(username),
                method: AuthMethod::Basic,
                session: None,
            });
            // Only cache valid responses.
            self.data
                .lock()
                .await
                .response_cache
                .insert(auth_header_str.to_owned(), response.clone());
            response
        } else {
            self.log_failed_login(&username);
            None
        }
    }

    async fn validate_api_key_request(
        &self,
        headers: &HeaderMap<HeaderValue>,
        query: &str,
    ) -> ValidateResponse {
        let presented = api_key_from_request(headers, query)?;
        if !self.check_api_key(&presented).await {
            return None;
        }
        Some(AuthedUser {
            principal: Principal::Anonymous,
            method: AuthMethod::ApiKey,
            session: None,
        })
    }

    async fn check_basic(&self, username: &Username, password: &str) -> bool {
        let (stored_username, hash) = {
            let data = self.data.lock().await;
            let Some(stored_username) = data.username.clone() else {
                return false;
            };
            let Some(hash) = data.password_hash.clone() else {
                return false;
            };
            (stored_username, hash)
        };

        if *username != stored_username {
            // Burn the same hashing time for unknown users.
            _ = self.passwords_match(hash, password.to_owned()).await;
            return false;
        }
        self.passwords_match(hash, password.to_owned()).await
    }

    async fn check_api_key(&self, presented: &str) -> bool {
        let data = self.data.lock().await;
        let Some(stored) = data.api_key_digest else {
            return false;
        };
        digest(presented) == stored
    }

    async fn passwords_match(&self, hash: String, plaintext: String) -> bool {
        // Lock hash_lock to prevent parallel password verifications.
        let _hash_guard = self.hash_lock.lock().await;

        self.rt_handle
            .spawn_blocking(move || {
                let Ok(parsed_hash) = PasswordHash::new(&hash) else {
                    return false;
                };
                Argon2::default()
                    .verify_password(plaintext.as_bytes(), &parsed_hash)
                    .is_ok()
            })
            .await
            .unwrap_or(false)
    }

    fn log_failed_login(&self, username: &str) {
        self.logger
            .log(LogLevel::Warning, &format!("failed login: username: '{username}'"));
    }
}

async fn hash_password(rt_handle: &Handle, plain_password: String) -> Result<String, NewAuthError> {
    rt_handle
        .spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(plain_password.as_bytes(), &salt)
                .map(|v| v.to_string())
                .map_err(|e| NewAuthError::HashPassword(e.to_string()))
        })
        .await
        .map_err(|e| NewAuthError::HashPassword(e.to_string()))?
}

fn digest(input: &str) -> [u8; 32] {
    Sha256::digest(input.as_bytes()).into()
}

fn token_from_request(headers: &HeaderMap<HeaderValue>, query: &str) -> Option<SessionId> {
    if let Some(header) = headers.get("X-Auth-Token") {
        if let Ok(v) = header.to_str() {
            if let Ok(id) = v.parse() {
                return Some(id);
            }
        }
    }
    query_param(query, "token")?.parse().ok()
}

fn api_key_from_request(headers: &HeaderMap<HeaderValue>, query: &str) -> Option<String> {
    if let Some(header) = headers.get("X-API-Key") {
        if let Ok(v) = header.to_str() {
            return Some(v.to_owned());
        }
    }
    query_param(query, "api_key")
}

// Minimal single-parameter lookup; the query strings here are tiny.
fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(key) {
            return Some(parts.next().unwrap_or("").to_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{time::ManualClock, time::UnixNano, DummyLogger};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    async fn new_test_auth(method: AuthMethod) -> (Arc<ManualClock>, ArcAuth) {
        let clock = ManualClock::new(UnixNano::new(0));
        let auth = AuthManager::new(
            Handle::current(),
            AuthSettings {
                method,
                username: Some("admin".parse().unwrap()),
                password: Some("pass1".to_owned()),
                api_key: Some("key123".to_owned()),
                session_duration: Duration::from_hours(1),
            },
            clock.clone(),
            DummyLogger::new(),
        )
        .await
        .unwrap();
        (clock, auth)
    }

    fn basic_headers(username: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            headers::Authorization::basic(username, password).0.encode(),
        );
        headers
    }

    #[test_case("admin", "pass1", true; "ok")]
    #[test_case("admin", "wrong", false; "wrong_password")]
    #[test_case("nil", "pass1", false; "unknown_user")]
    #[tokio::test]
    async fn test_validate_basic(username: &str, password: &str, want: bool) {
        let (_, auth) = new_test_auth(AuthMethod::Basic).await;
        let got = auth
            .validate_request(&basic_headers(username, password), "")
            .await;
        assert_eq!(want, got.is_some());
    }

    #[tokio::test]
    async fn test_basic_response_cache() {
        let (_, auth) = new_test_auth(AuthMethod::Basic).await;
        let headers = basic_headers("admin", "pass1");

        assert!(auth.validate_request(&headers, "").await.is_some());
        // Second validation hits the cache.
        assert!(auth.validate_request(&headers, "").await.is_some());
        assert_eq!(1, auth.data.lock().await.response_cache.len());
    }

    #[tokio::test]
    async fn test_validate_api_key() {
        let (_, auth) = new_test_auth(AuthMethod::ApiKey).await;

        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", HeaderValue::from_static("key123"));
        assert!(auth.validate_request(&headers, "").await.is_some());

        let empty = HeaderMap::new();
        assert!(auth.validate_request(&empty, "api_key=key123").await.is_some());
        assert!(auth.validate_request(&empty, "api_key=wrong").await.is_none());
        assert!(auth.validate_request(&empty, "").await.is_none());
    }

    #[tokio::test]
    async fn test_login_and_token() {
        let (clock, auth) = new_test_auth(AuthMethod::Basic).await;

        let session = auth
            .login(LoginCredentials::Basic {
                username: "admin".parse().unwrap(),
                password: "pass1".to_owned(),
            })
            .await
            .unwrap();

        assert!(auth.validate_token(session.id).await.is_some());

        // Sessions also satisfy request validation.
        let empty = HeaderMap::new();
        let query = format!("token={}", session.id);
        assert!(auth.validate_request(&empty, &query).await.is_some());

        // Expired sessions are rejected.
        clock.advance(Duration::from_hours(2));
        assert!(auth.validate_token(session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let (_, auth) = new_test_auth(AuthMethod::Basic).await;
        let got = auth
            .login(LoginCredentials::Basic {
                username: "admin".parse().unwrap(),
                password: "wrong".to_owned(),
            })
            .await;
        assert_eq!(Err(AuthError::InvalidCredentials), got);
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let (_, auth) = new_test_auth(AuthMethod::Basic).await;
        let got = auth
            .login(LoginCredentials::ApiKey {
                api_key: "key123".to_owned(),
            })
            .await;
        assert_eq!(Err(AuthError::UnsupportedMethod(AuthMethod::Basic)), got);
    }

    #[tokio::test]
    async fn test_token_method_mints_startup_token() {
        let (_, auth) = new_test_auth(AuthMethod::Token).await;

        let seeded = auth.sessions().await;
        assert_eq!(1, seeded.len());
        assert_eq!(AuthMethod::Token, seeded[0].auth_method);

        // The minted token is the credential.
        let query = format!("token={}", seeded[0].id);
        let got = auth
            .validate_request(&HeaderMap::new(), &query)
            .await
            .unwrap();
        assert_eq!(AuthMethod::Token, got.method);
    }

    #[tokio::test]
    async fn test_token_method_rejects_basic_credentials() {
        let (_, auth) = new_test_auth(AuthMethod::Token).await;

        // A Basic Authorization header is not a token.
        assert!(auth
            .validate_request(&basic_headers("admin", "pass1"), "")
            .await
            .is_none());

        let got = auth
            .login(LoginCredentials::Basic {
                username: "admin".parse().unwrap(),
                password: "pass1".to_owned(),
            })
            .await;
        assert_eq!(Err(AuthError::UnsupportedMethod(AuthMethod::Token)), got);
    }

    #[tokio::test]
    async fn test_token_login_rotates() {
        let (clock, auth) = new_test_auth(AuthMethod::Token).await;

        let token = auth.sessions().await[0].id;
        clock.advance(Duration::from_minutes(30));
        let fresh = auth
            .login(LoginCredentials::Token {
                token: token.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(AuthMethod::Token, fresh.auth_method);
        assert_ne!(token, fresh.id);

        // The rotated session outlives the original.
        clock.advance(Duration::from_minutes(40));
        assert!(auth.validate_token(token).await.is_none());
        assert!(auth.validate_token(fresh.id).await.is_some());

        // Garbage and unknown tokens are rejected.
        let got = auth
            .login(LoginCredentials::Token {
                token: "not-a-uuid".to_owned(),
            })
            .await
            .map(|_| ());
        assert_eq!(Err(AuthError::InvalidCredentials), got);

        let got = auth
            .login(LoginCredentials::Token {
                token: SessionId::new().to_string(),
            })
            .await
            .map(|_| ());
        assert_eq!(Err(AuthError::InvalidCredentials), got);
    }

    #[tokio::test]
    async fn test_icloud_pairing() {
        let (_, auth) = new_test_auth(AuthMethod::ICloud).await;

        let session = auth
            .login(LoginCredentials::ICloud {
                device_id: "device1".to_owned(),
                identity_token: "opaque".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(AuthMethod::ICloud, session.auth_method);

        let got = auth
            .login(LoginCredentials::ICloud {
                device_id: String::new(),
                identity_token: "opaque".to_owned(),
            })
            .await;
        assert_eq!(Err(AuthError::InvalidCredentials), got);
    }

    #[tokio::test]
    async fn test_prune_and_revoke() {
        let (clock, auth) = new_test_auth(AuthMethod::Basic).await;

        let session = auth
            .login(LoginCredentials::Basic {
                username: "admin".parse().unwrap(),
                password: "pass1".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(1, auth.sessions().await.len());

        clock.advance(Duration::from_hours(2));
        auth.prune().await;
        assert_eq!(0, auth.sessions().await.len());

        let session2 = auth
            .login(LoginCredentials::Basic {
                username: "admin".parse().unwrap(),
                password: "pass1".to_owned(),
            })
            .await
            .unwrap();
        assert!(auth.revoke(session2.id).await);
        assert!(!auth.revoke(session.id).await);
    }

    #[tokio::test]
    async fn test_method_none_allows_everything() {
        let (_, auth) = new_test_auth(AuthMethod::None).await;
        let got = auth.validate_request(&HeaderMap::new(), "").await.unwrap();
        assert_eq!(AuthMethod::None, got.method);
        assert_eq!(Principal::Anonymous, got.principal);
    }
}
