// SPDX-License-Identifier: GPL-2.0-or-later

use crate::config::{Config, ConfigNewError};
use auth::{ArcAuth, AuthManager, AuthSettings, NewAuthError};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use capture::TestPatternSource;
use common::{
    time::{new_system_clock, ArcClock},
    ArcLogger, ArcMsgLogger, FrameSource, ILogger, LogEntry, LogLevel, MsgLogger,
};
use encoder::{EncoderError, EncoderSettings, H264Encoder};
use handler::{
    admin_requests_handler, admin_session_delete_handler, admin_sessions_handler,
    admin_status_handler, health_handler, login_handler, logout_handler, master_playlist_handler,
    media_playlist_handler, segment_handler, stream_start_handler, stream_stop_handler,
    version_handler, AdminState, SegmentState, StreamState,
};
use hls::{HlsServer, StartStreamError, StreamWriter, WriteUnitError};
use log::{
    request_log::{RequestLog, DEFAULT_REQUEST_LOG_CAPACITY},
    Logger,
};
use session::{ArcSessionManager, SessionManager, DEFAULT_IDLE_TIMEOUT};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    signal,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use web::{
    cors, ArcRateLimiter, AuthState, RateLimitSettings, RateLimiter, RequestLogSettings,
    RequestLogState, StreamSessionState,
};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("create config: {0}")]
    NewConfig(#[from] ConfigNewError),

    #[error("create authenticator: {0}")]
    NewAuth(#[from] NewAuthError),

    #[error("parse host address '{0}': {1}")]
    ParseHost(String, std::net::AddrParseError),

    #[error("listen on sigterm: {0}")]
    SigTermListener(std::io::Error),
}

pub async fn run(rt_handle: Handle, config_path: &PathBuf) -> Result<(), RunError> {
    // Initialize app.
    let mut app = App::new(rt_handle, config_path).await?;
    app.setup_routes();

    // Run app.
    let mut shutdown_complete_rx = app.run().await?;
    // Block until app stops.
    shutdown_complete_rx.recv().await;

    Ok(())
}

pub struct App {
    token: CancellationToken,
    config: Config,
    clock: ArcClock,
    logger: Arc<Logger>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    auth: ArcAuth,
    sessions: ArcSessionManager,
    limiter: ArcRateLimiter,
    request_log: Arc<RequestLog>,
    hls: Arc<HlsServer>,
    encoder: Arc<H264Encoder>,
    router: Router,
}

impl App {
    pub async fn new(rt_handle: Handle, config_path: &PathBuf) -> Result<App, RunError> {
        let token = CancellationToken::new();
        let config = Config::new(config_path)?;
        let clock = new_system_clock();
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel::<()>(1);

        let logger = Arc::new(Logger::new(config.logging.level));
        let arc_logger: ArcLogger = logger.clone();

        let auth = AuthManager::new(
            rt_handle,
            AuthSettings {
                method: config.auth.method,
                username: config.auth.username.clone(),
                password: config.auth.password.clone(),
                api_key: config.auth.api_key.clone(),
                session_duration: config.token_ttl(),
            },
            clock.clone(),
            source_logger(arc_logger.clone(), "auth"),
        )
        .await?;

        let sessions = SessionManager::new(
            config.auth.single_viewer_only,
            DEFAULT_IDLE_TIMEOUT,
            config.stream_timeout(),
            clock.clone(),
            source_logger(arc_logger.clone(), "session"),
        );

        let limiter = RateLimiter::new(
            RateLimitSettings {
                requests_per_minute: config.rate_limit.requests_per_minute,
                excluded_paths: config.rate_limit.excluded_paths.clone(),
                auth_endpoint_multiplier: config.rate_limit.auth_endpoint_multiplier,
            },
            clock.clone(),
        );

        let request_log = Arc::new(RequestLog::new(DEFAULT_REQUEST_LOG_CAPACITY));

        let hls = Arc::new(HlsServer::new(
            arc_logger.clone(),
            config.stream.segment_dir.clone(),
            config.target_segment_duration(),
            config.stream.retention,
        ));

        let encoder = Arc::new(H264Encoder::new(
            source_logger(arc_logger, "encoder"),
            encoder::default_codec_factory(),
        ));

        Ok(App {
            token,
            config,
            clock,
            logger,
            shutdown_complete_tx,
            shutdown_complete_rx,
            auth,
            sessions,
            limiter,
            request_log,
            hls,
            encoder,
            router: Router::new(),
        })
    }

    pub fn setup_routes(&mut self) {
        let auth_state = AuthState {
            auth: self.auth.clone(),
            sessions: self.sessions.clone(),
            require_stream_auth: self.config.auth.require_stream_auth,
            require_admin_auth: self.config.auth.require_admin_auth,
        };
        let session_state = StreamSessionState {
            sessions: self.sessions.clone(),
            enforce: self.config.auth.require_stream_auth,
        };
        let stream_state = StreamState {
            hls: self.hls.clone(),
            frame_rate: f64::from(self.config.stream.frame_rate),
            base_url: self.config.stream.base_url.clone(),
        };
        let segment_state = SegmentState {
            hls: self.hls.clone(),
            sessions: self.sessions.clone(),
        };
        let admin_state = AdminState {
            hls: self.hls.clone(),
            encoder: self.encoder.clone(),
            auth: self.auth.clone(),
            sessions: self.sessions.clone(),
        };

        // Auth before session, per the middleware ordering.
        let stream_layers = ServiceBuilder::new()
            .layer(middleware::from_fn_with_state(
                auth_state.clone(),
                web::stream_auth,
            ))
            .layer(middleware::from_fn_with_state(
                session_state,
                web::stream_session,
            ));

        let router = Router::new()
            .route("/health", get(health_handler))
            .route("/version", get(version_handler))
            // Login.
            .route(
                "/auth/login",
                post(login_handler).with_state(self.auth.clone()),
            )
            // Logout.
            .route(
                "/auth/logout",
                post(logout_handler).with_state(self.auth.clone()),
            )
            // Master playlist.
            .route(
                "/stream/master.m3u8",
                get(master_playlist_handler)
                    .with_state(stream_state.clone())
                    .route_layer(stream_layers.clone()),
            )
            // Media playlist.
            .route(
                "/stream/{quality}/index.m3u8",
                get(media_playlist_handler)
                    .with_state(stream_state)
                    .route_layer(stream_layers.clone()),
            )
            // Segment data.
            .route(
                "/stream/{quality}/{segment}",
                get(segment_handler)
                    .with_state(segment_state)
                    .route_layer(stream_layers),
            )
            // Stream session acquisition. Authenticated, but no stream
            // token exists yet at this point.
            .route(
                "/stream/start",
                post(stream_start_handler)
                    .with_state(self.sessions.clone())
                    .route_layer(middleware::from_fn_with_state(
                        auth_state.clone(),
                        web::stream_auth,
                    )),
            )
            .route(
                "/stream/stop",
                post(stream_stop_handler)
                    .with_state(self.sessions.clone())
                    .route_layer(middleware::from_fn_with_state(
                        auth_state.clone(),
                        web::stream_auth,
                    )),
            )
            // Admin surface.
            .route(
                "/admin/status",
                get(admin_status_handler)
                    .with_state(admin_state.clone())
                    .route_layer(middleware::from_fn_with_state(
                        auth_state.clone(),
                        web::admin_auth,
                    )),
            )
            .route(
                "/admin/requests",
                get(admin_requests_handler)
                    .with_state(self.request_log.clone())
                    .route_layer(middleware::from_fn_with_state(
                        auth_state.clone(),
                        web::admin_auth,
                    )),
            )
            .route(
                "/admin/sessions",
                get(admin_sessions_handler)
                    .with_state(admin_state.clone())
                    .route_layer(middleware::from_fn_with_state(
                        auth_state.clone(),
                        web::admin_auth,
                    )),
            )
            .route(
                "/admin/sessions/{id}",
                delete(admin_session_delete_handler)
                    .with_state(admin_state)
                    .route_layer(middleware::from_fn_with_state(auth_state, web::admin_auth)),
            );

        // Outermost first: request log, CORS, rate limit, timeout.
        self.router = router.layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    RequestLogState {
                        request_log: self.request_log.clone(),
                        logger: self.logger.clone(),
                        settings: Arc::new(RequestLogSettings {
                            log_requests: self.config.logging.log_requests,
                            log_request_body: self.config.logging.log_request_body,
                            log_response_body: self.config.logging.log_response_body,
                            log_performance: self.config.logging.log_performance,
                            excluded_paths: self.config.logging.excluded_paths.clone(),
                        }),
                        clock: self.clock.clone(),
                    },
                    web::request_log,
                ))
                .layer(middleware::from_fn_with_state(
                    Arc::new(self.config.cors.as_settings()),
                    cors,
                ))
                .layer(middleware::from_fn_with_state(
                    web::RateLimitState {
                        limiter: self.limiter.clone(),
                        enabled: self.config.rate_limit.enabled,
                    },
                    web::rate_limit,
                ))
                .layer(middleware::from_fn(web::handler_timeout)),
        );
    }

    // `App` must be dropped when this returns.
    pub async fn run(self) -> Result<mpsc::Receiver<()>, RunError> {
        let host: IpAddr = self
            .config
            .server
            .host
            .parse()
            .map_err(|e| RunError::ParseHost(self.config.server.host.clone(), e))?;
        let addr = SocketAddr::new(host, self.config.server.port);

        self.logger.log(LogEntry::new(
            LogLevel::Info,
            "app",
            format!("serving on {addr}"),
        ));

        spawn_janitor(
            self.token.clone(),
            self.shutdown_complete_tx.clone(),
            self.sessions.clone(),
            self.auth.clone(),
            self.limiter.clone(),
            self.config.cleanup_interval(),
        );

        if self.config.server.auto_start {
            start_streaming(
                self.token.clone(),
                self.shutdown_complete_tx.clone(),
                &self.config,
                self.encoder.clone(),
                self.hls.clone(),
                self.logger.clone(),
            )
            .await;
        }

        let (server_exited_tx, server_exited_rx) = oneshot::channel();
        tokio::spawn(start_server(
            self.token.child_token(),
            self.shutdown_complete_tx.clone(),
            server_exited_tx,
            addr,
            self.router,
        ));

        // Teardown on cancellation.
        {
            let token = self.token.clone();
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            let encoder = self.encoder.clone();
            let hls = self.hls.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                _ = encoder.stop().await;
                hls.stop_all().await;
                drop(shutdown_complete_tx);
            });
        }

        // Shutdown conditions.
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(RunError::SigTermListener)?;
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    match result {
                        Ok(()) => eprintln!("\nreceived interrupt, stopping..\n"),
                        Err(e) => eprintln!("\ninterrupt error: {e}"),
                    }
                }
                _ = sigterm.recv() => eprintln!("\nreceived terminate, stopping..\n"),
                res = server_exited_rx => {
                    if let Err(e) = res {
                        eprintln!("server error: {e}");
                    }
                },
            }
            self.token.cancel();
        });

        Ok(self.shutdown_complete_rx)
    }
}

struct SourceLogger {
    logger: ArcLogger,
    source: &'static str,
}

impl MsgLogger for SourceLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger
            .log(LogEntry::new(level, self.source, msg.to_owned()));
    }
}

fn source_logger(logger: ArcLogger, source: &'static str) -> ArcMsgLogger {
    Arc::new(SourceLogger { logger, source })
}

fn spawn_janitor(
    token: CancellationToken,
    shutdown_complete: mpsc::Sender<()>,
    sessions: ArcSessionManager,
    auth: ArcAuth,
    limiter: ArcRateLimiter,
    cleanup_interval: common::time::Duration,
) {
    tokio::spawn(async move {
        let _shutdown_complete = shutdown_complete;
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        let cleanup_every = u64::try_from(cleanup_interval.as_millis() / 1000).unwrap_or(300);
        let mut seconds: u64 = 0;
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = ticker.tick() => {
                    sessions.reap().await;
                    auth.prune().await;
                    seconds += 1;
                    if seconds >= cleanup_every.max(1) {
                        limiter.cleanup().await;
                        seconds = 0;
                    }
                }
            }
        }
    });
}

/// Starts the capture → encode → segment pipeline for the configured
/// quality. Failures are logged; the HTTP surface stays up either way.
async fn start_streaming(
    token: CancellationToken,
    shutdown_complete: mpsc::Sender<()>,
    config: &Config,
    encoder: Arc<H264Encoder>,
    hls: Arc<HlsServer>,
    logger: ArcLogger,
) {
    let log = |level, msg: &str| {
        logger.log(LogEntry::new(level, "stream", msg.to_owned()));
    };

    if !config.stream.test_pattern {
        log(
            LogLevel::Notice,
            "no capture source configured, streaming is idle until one connects",
        );
        return;
    }

    let quality = config.stream.quality;
    let settings = EncoderSettings::for_quality(quality, config.stream.frame_rate);

    let units = match encoder.start(settings).await {
        Ok(v) => v,
        Err(e) => {
            log(LogLevel::Error, &format!("start encoder: {e}"));
            return;
        }
    };
    let writer = match hls.start_stream(quality).await {
        Ok(v) => v,
        Err(e @ StartStreamError::Start(_)) => {
            log(LogLevel::Error, &format!("start stream: {e}"));
            _ = encoder.stop().await;
            return;
        }
    };

    let source = TestPatternSource::new(settings.width, settings.height, settings.frame_rate);
    spawn_frame_feed(
        token.clone(),
        shutdown_complete.clone(),
        Box::new(source),
        encoder,
        logger.clone(),
    );
    spawn_segment_pump(token, shutdown_complete, units, writer, logger);
}

fn spawn_frame_feed(
    token: CancellationToken,
    shutdown_complete: mpsc::Sender<()>,
    mut source: Box<dyn FrameSource + Send>,
    encoder: Arc<H264Encoder>,
    logger: ArcLogger,
) {
    tokio::spawn(async move {
        let _shutdown_complete = shutdown_complete;
        loop {
            let frame = tokio::select! {
                () = token.cancelled() => break,
                frame = source.next_frame() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    frame
                }
            };
            if let Err(e) = encoder.submit(frame).await {
                if !matches!(e, EncoderError::NotStarted) {
                    logger.log(LogEntry::new(
                        LogLevel::Error,
                        "stream",
                        format!("submit frame: {e}"),
                    ));
                }
                break;
            }
        }
        source.stop().await;
        _ = encoder.stop().await;
    });
}

fn spawn_segment_pump(
    token: CancellationToken,
    shutdown_complete: mpsc::Sender<()>,
    mut units: encoder::UnitStream,
    writer: StreamWriter,
    logger: ArcLogger,
) {
    tokio::spawn(async move {
        let _shutdown_complete = shutdown_complete;
        let log = |level, msg: &str| {
            logger.log(LogEntry::new(level, "stream", msg.to_owned()));
        };
        loop {
            let result = tokio::select! {
                () = token.cancelled() => break,
                result = units.recv() => {
                    let Some(result) = result else {
                        break;
                    };
                    result
                }
            };
            match result {
                Ok(unit) => match writer.write_unit(&unit).await {
                    Ok(()) => {}
                    Err(e @ WriteUnitError::EngineDegraded(_)) => {
                        log(LogLevel::Error, &format!("stopping stream: {e}"));
                        break;
                    }
                    Err(e) => log(LogLevel::Warning, &format!("write unit: {e}")),
                },
                Err(e) => {
                    log(LogLevel::Error, &format!("encoder failed: {e}"));
                    break;
                }
            }
        }
        // Flush the open segment before exiting.
        _ = writer.stop().await;
    });
}

#[derive(Debug, Error)]
enum ServerError {
    #[error("bind: {0}")]
    Bind(std::io::Error),

    #[error("{0}")]
    Server(std::io::Error),
}

async fn start_server(
    token: CancellationToken,
    _shutdown_complete: mpsc::Sender<()>,
    on_exit: oneshot::Sender<Result<(), ServerError>>,
    addr: SocketAddr,
    router: Router,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(v) => v,
        Err(e) => {
            let _ = on_exit.send(Err(ServerError::Bind(e)));
            return;
        }
    };
    let graceful = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await });
    let _ = on_exit.send(graceful.await.map_err(ServerError::Server));
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::{header, Request, StatusCode};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn new_test_app(extra_sections: &str) -> (TempDir, App) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("cursorwindow.toml");
        let segment_dir = temp_dir.path().join("segments");
        std::fs::write(
            &config_path,
            format!(
                "
                {extra_sections}

                [stream]
                segment_dir = \"{}\"
                test_pattern = false
            ",
                segment_dir.to_str().unwrap()
            ),
        )
        .unwrap();

        let mut app = App::new(Handle::current(), &config_path).await.unwrap();
        app.setup_routes();
        (temp_dir, app)
    }

    #[tokio::test]
    async fn test_health_route() {
        let (_dir, app) = new_test_app("").await;

        let response = app
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, response.status());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!("OK", body);
    }

    #[tokio::test]
    async fn test_stream_requires_auth() {
        let auth = "
            [auth]
            method = \"basic\"
            username = \"admin\"
            password = \"pass1\"
        ";
        let (_dir, app) = new_test_app(auth).await;

        let response = app
            .router
            .oneshot(
                Request::get("/stream/hd/index.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::UNAUTHORIZED, response.status());
        assert_eq!(
            "Basic realm=\"CursorWindow\"",
            response.headers().get(header::WWW_AUTHENTICATE).unwrap()
        );
    }

    #[tokio::test]
    async fn test_master_playlist_route_not_streaming() {
        let (_dir, app) = new_test_app("").await;

        // Auth method none: authenticated, but no stream session token.
        let response = app
            .router
            .clone()
            .oneshot(
                Request::get("/stream/master.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::UNAUTHORIZED, response.status());

        // Acquire a stream session, then the playlist route answers.
        let response = app
            .router
            .clone()
            .oneshot(Request::post("/stream/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, response.status());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = value["token"].as_str().unwrap();

        let response = app
            .router
            .clone()
            .oneshot(
                Request::get(format!("/stream/master.m3u8?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, response.status());
    }

    #[tokio::test]
    async fn test_admin_requires_auth() {
        let auth = "
            [auth]
            method = \"apikey\"
            api_key = \"key123\"
        ";
        let (_dir, app) = new_test_app(auth).await;

        let response = app
            .router
            .clone()
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::UNAUTHORIZED, response.status());

        let response = app
            .router
            .clone()
            .oneshot(
                Request::get("/admin/status")
                    .header("X-API-Key", "key123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, response.status());
    }

    #[tokio::test]
    async fn test_request_log_records_requests() {
        let (_dir, app) = new_test_app("").await;

        _ = app
            .router
            .clone()
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let response = app
            .router
            .clone()
            .oneshot(Request::get("/admin/requests").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, response.status());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let records: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(records
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r["path"] == "/version"));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_over_limit() {
        let rate_limit = "
            [rate_limit]
            requests_per_minute = 2
        ";
        let (_dir, app) = new_test_app(rate_limit).await;

        for _ in 0..2 {
            let response = app
                .router
                .clone()
                .oneshot(Request::get("/version").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(StatusCode::OK, response.status());
        }

        let response = app
            .router
            .clone()
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::TOO_MANY_REQUESTS, response.status());

        // Excluded paths keep working.
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, response.status());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (_dir, app) = new_test_app("").await;

        let response = app
            .router
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }
}
