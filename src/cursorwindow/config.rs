// SPDX-License-Identifier: GPL-2.0-or-later

use common::{time::Duration, AuthMethod, LogLevel, Quality, Username};
use serde::Deserialize;
use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;
use web::CorsSettings;

/// Main config. Parsed from TOML and validated before anything starts.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub cors: CorsConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
    pub stream: StreamConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub stream_timeout_minutes: u32,
    pub auto_start: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthConfig {
    pub method: AuthMethod,
    pub require_admin_auth: bool,
    pub require_stream_auth: bool,
    pub username: Option<Username>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub token_ttl_hours: u32,
    pub single_viewer_only: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age_seconds: u32,
    pub allow_credentials: bool,
}

impl CorsConfig {
    #[must_use]
    pub fn as_settings(&self) -> CorsSettings {
        CorsSettings {
            enabled: self.enabled,
            allowed_origins: self.allowed_origins.clone(),
            allowed_methods: self.allowed_methods.clone(),
            allowed_headers: self.allowed_headers.clone(),
            max_age_seconds: self.max_age_seconds,
            allow_credentials: self.allow_credentials,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub excluded_paths: Vec<String>,
    pub auth_endpoint_multiplier: f64,
    pub cleanup_interval_minutes: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub log_requests: bool,
    pub log_request_body: bool,
    pub log_response_body: bool,
    pub log_performance: bool,
    pub excluded_paths: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    pub quality: Quality,
    pub target_segment_seconds: f64,
    pub retention: usize,
    pub base_url: String,
    pub segment_dir: PathBuf,
    pub frame_rate: u32,

    // Run the synthetic frame source instead of a real capture producer.
    pub test_pattern: bool,
}

impl Config {
    pub fn new(config_path: &PathBuf) -> Result<Config, ConfigNewError> {
        use ConfigNewError::*;
        if !config_path.exists() {
            print!(
                "\n\nGenerating '{}' and exiting..\n\n\n",
                config_path.to_string_lossy()
            );

            let cwd = std::env::current_dir().map_err(GetCwd)?;
            generate_config(config_path, &cwd)?;
            std::process::exit(0);
        }

        let config_toml = fs::read_to_string(config_path).map_err(ReadFile)?;
        Ok(parse_config(&config_toml)?)
    }

    #[must_use]
    pub fn target_segment_duration(&self) -> Duration {
        Duration::from_secs_f64(self.stream.target_segment_seconds)
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_hours(self.auth.token_ttl_hours)
    }

    #[must_use]
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_minutes(self.server.stream_timeout_minutes)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_minutes(self.rate_limit.cleanup_interval_minutes)
    }
}

#[derive(Debug, Error)]
pub enum ConfigNewError {
    #[error("read config file: {0}")]
    ReadFile(std::io::Error),

    #[error("generate config: {0}")]
    Generate(#[from] GenerateConfigError),

    #[error("parse config: {0}")]
    Parse(#[from] ParseConfigError),

    #[error("get current working directory: {0}")]
    GetCwd(std::io::Error),
}

#[derive(Debug, Error)]
pub enum GenerateConfigError {
    #[error("create file: {0}")]
    CreateFile(std::io::Error),

    #[error("templater error: {0}")]
    AddTemplate(upon::Error),

    #[error("render template: {0}")]
    RenderTemplate(upon::Error),

    #[error("get parent directory")]
    GetParentDir(),

    #[error("create directory: {0}")]
    CreateDir(std::io::Error),

    #[error("write file: {0}")]
    WriteFile(std::io::Error),
}

fn generate_config(path: &Path, cwd: &Path) -> Result<(), GenerateConfigError> {
    use GenerateConfigError::*;

    let data = HashMap::from([("cwd", cwd)]);

    let mut engine = upon::Engine::new();
    engine
        .add_template("config", CONFIG_TEMPLATE)
        .map_err(AddTemplate)?;

    let config = engine
        .get_template("config")
        .expect("template should just have been added")
        .render(data)
        .to_string()
        .map_err(RenderTemplate)?;

    let config_dir = path.parent().ok_or(GetParentDir())?;
    fs::create_dir_all(config_dir).map_err(CreateDir)?;

    let mut file = File::create(path).map_err(CreateFile)?;
    write!(file, "{config}").map_err(WriteFile)?;

    Ok(())
}

const CONFIG_TEMPLATE: &str = include_str!("./default_config.tpl");

#[derive(Debug, Error)]
pub enum ParseConfigError {
    #[error("{0}")]
    DeserializeToml(#[from] toml::de::Error),

    #[error("port cannot be zero")]
    ZeroPort,

    #[error("stream_timeout_minutes must be at least 1")]
    StreamTimeoutTooSmall,

    #[error("auth_endpoint_multiplier must be in (0, 1], got {0}")]
    InvalidMultiplier(f64),

    #[error("target_segment_seconds must be positive, got {0}")]
    InvalidTargetDuration(f64),

    #[error("retention must be at least 1")]
    ZeroRetention,

    #[error("frame_rate must be at least 1")]
    ZeroFrameRate,

    #[error("segment_dir is not absolute: '{0}'")]
    PathNotAbsolute(PathBuf),

    #[error("create segment dir: {0} {1}")]
    CreateSegmentDir(PathBuf, std::io::Error),

    #[error("canonicalize path: {0:?} {1}")]
    Canonicalize(PathBuf, std::io::Error),

    #[error("auth method '{0}' requires username and password")]
    MissingCredentials(AuthMethod),

    #[error("auth method 'apikey' requires api_key")]
    MissingApiKey,
}

fn parse_config(config_toml: &str) -> Result<Config, ParseConfigError> {
    use ParseConfigError::*;
    let raw: RawConfig = toml::from_str(config_toml)?;

    if raw.server.port == 0 {
        return Err(ZeroPort);
    }
    if raw.server.stream_timeout_minutes < 1 {
        return Err(StreamTimeoutTooSmall);
    }
    if raw.rate_limit.auth_endpoint_multiplier <= 0.0
        || raw.rate_limit.auth_endpoint_multiplier > 1.0
    {
        return Err(InvalidMultiplier(raw.rate_limit.auth_endpoint_multiplier));
    }
    if raw.stream.target_segment_seconds <= 0.0 {
        return Err(InvalidTargetDuration(raw.stream.target_segment_seconds));
    }
    if raw.stream.retention == 0 {
        return Err(ZeroRetention);
    }
    if raw.stream.frame_rate == 0 {
        return Err(ZeroFrameRate);
    }

    match raw.auth.method {
        AuthMethod::Basic => {
            if raw.auth.username.is_none() || raw.auth.password.is_none() {
                return Err(MissingCredentials(raw.auth.method));
            }
        }
        AuthMethod::ApiKey => {
            if raw.auth.api_key.is_none() {
                return Err(MissingApiKey);
            }
        }
        // The token method needs no static credentials; its first token is
        // minted at startup.
        AuthMethod::None | AuthMethod::Token | AuthMethod::ICloud | AuthMethod::StreamToken => {}
    }

    if !raw.stream.segment_dir.is_absolute() {
        return Err(PathNotAbsolute(raw.stream.segment_dir));
    }
    std::fs::create_dir_all(&raw.stream.segment_dir)
        .map_err(|e| CreateSegmentDir(raw.stream.segment_dir.clone(), e))?;
    let segment_dir = raw
        .stream
        .segment_dir
        .canonicalize()
        .map_err(|e| Canonicalize(raw.stream.segment_dir, e))?;

    Ok(Config {
        server: ServerConfig {
            host: raw.server.host,
            port: raw.server.port,
            stream_timeout_minutes: raw.server.stream_timeout_minutes,
            auto_start: raw.server.auto_start,
        },
        auth: AuthConfig {
            method: raw.auth.method,
            require_admin_auth: raw.auth.require_admin_auth,
            require_stream_auth: raw.auth.require_stream_auth,
            username: raw.auth.username,
            password: raw.auth.password,
            api_key: raw.auth.api_key,
            token_ttl_hours: raw.auth.token_ttl_hours,
            single_viewer_only: raw.auth.single_viewer_only,
        },
        cors: CorsConfig {
            enabled: raw.cors.enabled,
            allowed_origins: raw.cors.allowed_origins,
            allowed_methods: raw.cors.allowed_methods,
            allowed_headers: raw.cors.allowed_headers,
            max_age_seconds: raw.cors.max_age_seconds,
            allow_credentials: raw.cors.allow_credentials,
        },
        rate_limit: RateLimitConfig {
            enabled: raw.rate_limit.enabled,
            requests_per_minute: raw.rate_limit.requests_per_minute,
            excluded_paths: raw.rate_limit.excluded_paths,
            auth_endpoint_multiplier: raw.rate_limit.auth_endpoint_multiplier,
            cleanup_interval_minutes: raw.rate_limit.cleanup_interval_minutes,
        },
        logging: LoggingConfig {
            level: raw.logging.level,
            log_requests: raw.logging.log_requests,
            log_request_body: raw.logging.log_request_body,
            log_response_body: raw.logging.log_response_body,
            log_performance: raw.logging.log_performance,
            excluded_paths: raw.logging.excluded_paths,
        },
        stream: StreamConfig {
            quality: raw.stream.quality,
            target_segment_seconds: raw.stream.target_segment_seconds,
            retention: raw.stream.retention,
            base_url: raw.stream.base_url,
            segment_dir,
            frame_rate: raw.stream.frame_rate,
            test_pattern: raw.stream.test_pattern,
        },
    })
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,

    #[serde(default)]
    auth: RawAuth,

    #[serde(default)]
    cors: RawCors,

    #[serde(default)]
    rate_limit: RawRateLimit,

    #[serde(default)]
    logging: RawLogging,

    stream: RawStream,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawServer {
    host: String,
    port: u16,
    stream_timeout_minutes: u32,
    auto_start: bool,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            stream_timeout_minutes: 60,
            auto_start: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawAuth {
    method: AuthMethod,
    require_admin_auth: bool,
    require_stream_auth: bool,
    username: Option<Username>,
    password: Option<String>,
    api_key: Option<String>,
    token_ttl_hours: u32,
    single_viewer_only: bool,
}

impl Default for RawAuth {
    fn default() -> Self {
        Self {
            method: AuthMethod::None,
            require_admin_auth: true,
            require_stream_auth: true,
            username: None,
            password: None,
            api_key: None,
            token_ttl_hours: 1,
            single_viewer_only: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawCors {
    enabled: bool,
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age_seconds: u32,
    allow_credentials: bool,
}

impl Default for RawCors {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: vec!["GET".to_owned(), "POST".to_owned(), "OPTIONS".to_owned()],
            allowed_headers: vec![
                "Authorization".to_owned(),
                "Content-Type".to_owned(),
                "X-API-Key".to_owned(),
                "X-Auth-Token".to_owned(),
            ],
            max_age_seconds: 600,
            allow_credentials: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawRateLimit {
    enabled: bool,
    requests_per_minute: u32,
    excluded_paths: Vec<String>,
    auth_endpoint_multiplier: f64,
    cleanup_interval_minutes: u32,
}

impl Default for RawRateLimit {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 120,
            excluded_paths: vec!["/health".to_owned()],
            auth_endpoint_multiplier: 0.5,
            cleanup_interval_minutes: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawLogging {
    level: LogLevel,
    log_requests: bool,
    log_request_body: bool,
    log_response_body: bool,
    log_performance: bool,
    excluded_paths: Vec<String>,
}

impl Default for RawLogging {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_requests: true,
            log_request_body: false,
            log_response_body: false,
            log_performance: false,
            excluded_paths: vec!["/health".to_owned()],
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStream {
    #[serde(default = "default_quality")]
    quality: Quality,

    #[serde(default = "default_target_segment_seconds")]
    target_segment_seconds: f64,

    #[serde(default = "default_retention")]
    retention: usize,

    #[serde(default)]
    base_url: String,

    segment_dir: PathBuf,

    #[serde(default = "default_frame_rate")]
    frame_rate: u32,

    #[serde(default = "default_test_pattern")]
    test_pattern: bool,
}

fn default_quality() -> Quality {
    Quality::Hd
}

fn default_target_segment_seconds() -> f64 {
    4.0
}

fn default_retention() -> usize {
    5
}

fn default_frame_rate() -> u32 {
    30
}

fn default_test_pattern() -> bool {
    true
}
