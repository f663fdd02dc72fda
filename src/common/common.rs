// SPDX-License-Identifier: GPL-2.0-or-later

pub mod session;
pub mod time;
pub mod video;

pub use session::*;
pub use video::*;

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, ops::Deref, str::FromStr, sync::Arc};
use thiserror::Error;

pub type ArcLogger = Arc<dyn ILogger + Send + Sync>;

pub trait ILogger {
    /// Send log.
    fn log(&self, _: LogEntry) {}
}

/// Log entry. The logger applies the timestamp.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: LogSource,
    pub message: LogMessage,
}

impl LogEntry {
    #[allow(clippy::needless_pass_by_value)]
    #[must_use]
    pub fn new(level: LogLevel, source: &'static str, message: String) -> Self {
        let source: LogSource = source.try_into().expect("source should be valid");
        let message = match LogMessage::try_from(message) {
            Ok(v) => v,
            Err(e) => LogMessage::try_from(format!("bad message: {e}"))
                .expect("error message should be a valid log message"),
        };
        Self {
            level,
            source,
            message,
        }
    }
}

/// Severity of the log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very verbose debugging information.
    Trace,

    /// Verbose debugging information.
    Debug,

    /// Standard information.
    Info,

    /// Noteworthy but expected events.
    Notice,

    /// Something may require attention.
    Warning,

    /// Something requires attention.
    Error,

    /// The process cannot continue.
    Critical,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseLogLevelError {
    #[error("unknown log level: '{0}'")]
    UnknownLevel(String),
}

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "notice" => Ok(LogLevel::Notice),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            _ => Err(ParseLogLevelError::UnknownLevel(s.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[macro_export]
macro_rules! impl_deserialize_try_from_and_display {
    ($type:ident) => {
        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                String::deserialize(deserializer)?
                    .try_into()
                    .map_err(serde::de::Error::custom)
            }
        }

        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

pub const LOG_SOURCE_MAX_LENGTH: usize = 16;

#[repr(transparent)]
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, PartialOrd, Ord)]
pub struct LogSource(Cow<'static, str>);
impl_deserialize_try_from_and_display!(LogSource);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseLogSourceError {
    #[error("empty string")]
    Empty,

    #[error("invalid characters: '{0}'")]
    InvalidChars(String),

    #[error("too long")]
    TooLong,
}

impl TryFrom<String> for LogSource {
    type Error = ParseLogSourceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        use ParseLogSourceError::*;
        if s.is_empty() {
            return Err(Empty);
        }
        if !s.chars().all(char::is_alphanumeric) {
            return Err(InvalidChars(s));
        }
        if s.len() > LOG_SOURCE_MAX_LENGTH {
            return Err(TooLong);
        }
        Ok(Self(Cow::Owned(s)))
    }
}

impl TryFrom<&'static str> for LogSource {
    type Error = ParseLogSourceError;

    fn try_from(s: &'static str) -> Result<Self, Self::Error> {
        use ParseLogSourceError::*;
        if s.is_empty() {
            return Err(Empty);
        }
        if !s.chars().all(char::is_alphanumeric) {
            return Err(InvalidChars(s.to_owned()));
        }
        if s.len() > LOG_SOURCE_MAX_LENGTH {
            return Err(TooLong);
        }
        Ok(Self(Cow::Borrowed(s)))
    }
}

impl Deref for LogSource {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LogMessage(String);
impl_deserialize_try_from_and_display!(LogMessage);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseLogMessageError {
    #[error("empty string")]
    Empty,

    #[error("too long")]
    TooLong,
}

const LOG_MESSAGE_MAX_LENGTH: usize = 1024 * 4;

impl TryFrom<String> for LogMessage {
    type Error = ParseLogMessageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err(ParseLogMessageError::Empty);
        }
        if s.len() > LOG_MESSAGE_MAX_LENGTH {
            return Err(ParseLogMessageError::TooLong);
        }
        Ok(Self(s))
    }
}

impl Deref for LogMessage {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct DummyLogger;

impl DummyLogger {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(DummyLogger {})
    }
}

impl ILogger for DummyLogger {
    fn log(&self, _: LogEntry) {}
}

impl MsgLogger for DummyLogger {
    fn log(&self, _level: LogLevel, _msg: &str) {}
}

pub type ArcMsgLogger = Arc<dyn MsgLogger + Send + Sync>;

/// Logger scoped to a single component. Implementations prepend the
/// component context before forwarding to the main logger.
pub trait MsgLogger {
    fn log(&self, level: LogLevel, msg: &str);
}

#[repr(transparent)]
#[derive(Clone, Debug, Hash, Serialize, PartialEq, Eq)]
pub struct Username(String);
impl_deserialize_try_from_and_display!(Username);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseUsernameError {
    #[error("empty string")]
    Empty,

    #[error("invalid character: '{0}'")]
    InvalidChar(char),

    #[error("too long")]
    TooLong,
}

const USERNAME_MAX_LENGTH: usize = 64;
const ALLOWED_USERNAME_CHARS: [char; 2] = ['-', '_'];

impl TryFrom<String> for Username {
    type Error = ParseUsernameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        use ParseUsernameError::*;
        if s.is_empty() {
            return Err(Empty);
        }
        for c in s.chars() {
            if (!c.is_alphanumeric() || c.is_uppercase()) && !ALLOWED_USERNAME_CHARS.contains(&c) {
                return Err(InvalidChar(c));
            }
        }
        if s.len() > USERNAME_MAX_LENGTH {
            return Err(TooLong);
        }
        Ok(Self(s))
    }
}

impl FromStr for Username {
    type Err = ParseUsernameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

impl Deref for Username {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
