// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{time::UnixNano, Username};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

// Opaque session identifier.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session id")]
pub struct ParseSessionIdError;

impl FromStr for SessionId {
    type Err = ParseSessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s).map_err(|_| ParseSessionIdError)?))
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Closed set of authentication methods. The first five can be enabled in
/// the config. `StreamToken` is only ever attached to sessions issued by the
/// stream session manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    None,
    Basic,
    ApiKey,
    Token,
    ICloud,
    StreamToken,
}

impl AuthMethod {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Basic => "basic",
            AuthMethod::ApiKey => "apikey",
            AuthMethod::Token => "token",
            AuthMethod::ICloud => "icloud",
            AuthMethod::StreamToken => "streamtoken",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown auth method: '{0}'")]
pub struct ParseAuthMethodError(String);

// Only the configurable subset parses. `StreamToken` is internal.
impl FromStr for AuthMethod {
    type Err = ParseAuthMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AuthMethod::None),
            "basic" => Ok(AuthMethod::Basic),
            "apikey" => Ok(AuthMethod::ApiKey),
            "token" => Ok(AuthMethod::Token),
            "icloud" => Ok(AuthMethod::ICloud),
            _ => Err(ParseAuthMethodError(s.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for AuthMethod {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    User(Username),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Anonymous => write!(f, "anonymous"),
            Principal::User(name) => write!(f, "{name}"),
        }
    }
}

/// One authenticated session.
///
/// Invariant: `created_at <= last_activity <= expires_at` for a valid
/// session.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub principal: Principal,
    pub auth_method: AuthMethod,
    pub created_at: UnixNano,
    pub expires_at: UnixNano,
    pub last_activity: UnixNano,
}

impl Session {
    #[must_use]
    pub fn is_valid(&self, now: UnixNano) -> bool {
        self.expires_at.after(now)
    }

    #[must_use]
    pub fn obfuscate(&self) -> SessionObfuscated {
        SessionObfuscated {
            id: self.id,
            principal: self.principal.to_string(),
            auth_method: self.auth_method,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Session without the fields that could be replayed.
#[derive(Clone, Debug, Serialize)]
pub struct SessionObfuscated {
    pub id: SessionId,
    pub principal: String,

    #[serde(rename = "authMethod")]
    pub auth_method: AuthMethod,

    #[serde(rename = "createdAt")]
    pub created_at: UnixNano,

    #[serde(rename = "expiresAt")]
    pub expires_at: UnixNano,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Duration;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("none", AuthMethod::None)]
    #[test_case("basic", AuthMethod::Basic)]
    #[test_case("apikey", AuthMethod::ApiKey)]
    #[test_case("token", AuthMethod::Token)]
    #[test_case("icloud", AuthMethod::ICloud)]
    fn test_parse_auth_method(input: &str, want: AuthMethod) {
        assert_eq!(want, input.parse().unwrap());
    }

    #[test]
    fn test_parse_auth_method_internal() {
        // The stream token method cannot be configured.
        AuthMethod::from_str("streamtoken").unwrap_err();
    }

    #[test]
    fn test_session_id_round_trip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_session_validity() {
        let now = UnixNano::new(1000);
        let session = Session {
            id: SessionId::new(),
            principal: Principal::Anonymous,
            auth_method: AuthMethod::Token,
            created_at: now,
            expires_at: now.add_duration(Duration::from_secs(1)).unwrap(),
            last_activity: now,
        };
        assert!(session.is_valid(now));
        assert!(!session.is_valid(session.expires_at));
    }
}
