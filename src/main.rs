//! QrDrop server binary.
//!
//! Receives PDF uploads (single-shot or chunked), keeps finished files in a
//! bounded in-memory store or forwards them to Google Drive, and returns a
//! public link for the browser to render as a QR code. The main entry point
//! builds the Axum router, configures TLS, and starts HTTP/HTTPS listeners.

mod artifact;
mod auth;
mod background;
mod config;
mod drive;
mod error;
mod files;
mod http;
mod logging;
mod session;
mod sink;
mod status;
mod tls;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::artifact::ArtifactStore;
use crate::auth::AuthConfig;
use crate::background::spawn_background_tasks;
use crate::config::{Args, MULTIPART_OVERHEAD, SinkKind, limit};
use crate::drive::{DriveConfig, DriveSink};
use crate::error::ApiError;
use crate::http::{RequestScheme, build_cors_layer, resolve_client_ip};
use crate::session::{ChunkSessionStore, SessionLimits};
use crate::sink::ArtifactSink;
use crate::status::StartedAt;
use crate::upload::Uploader;

shadow!(build);

/// Request body ceilings per upload route (`None` disables the limit).
#[derive(Clone, Copy, Debug)]
struct BodyLimits {
    chunk: Option<u64>,
    file: Option<u64>,
}

/// Starts the QrDrop server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    let store = Arc::new(ArtifactStore::new(args.artifact_capacity));
    let sessions = Arc::new(ChunkSessionStore::new(SessionLimits {
        max_chunk_size: limit(args.chunk_max_size),
        max_total_size: limit(args.chunked_max_size),
        max_chunks: limit(args.upload_max_chunks),
        max_sessions: limit(args.upload_max_sessions),
    }));
    let sink: Arc<dyn ArtifactSink> = match args.sink {
        SinkKind::Local => store.clone(),
        SinkKind::Drive => Arc::new(DriveSink::new(DriveConfig::from_args(&args)?)?),
    };
    info!(sink = ?args.sink, capacity = store.capacity(), "artifact sink ready");

    let uploader = Arc::new(Uploader::new(
        sessions.clone(),
        sink,
        limit(args.upload_max_size),
        args.public_url.clone(),
    ));
    let auth_config = Arc::new(AuthConfig::new(
        args.access_password.clone(),
        Duration::from_secs(args.auth_session_ttl_secs),
        Duration::from_secs(args.login_window_secs),
        args.login_max_attempts,
        Duration::from_secs(args.login_lockout_secs),
    ));
    spawn_background_tasks(
        auth_config.clone(),
        sessions,
        limit(args.upload_session_ttl_secs).map(Duration::from_secs),
    );

    let mut app = build_router(
        uploader,
        store,
        auth_config,
        BodyLimits {
            chunk: limit(args.chunk_max_size),
            file: limit(args.upload_max_size),
        },
    );
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_app = app.clone().layer(Extension(RequestScheme::Http));
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(http_app.into_make_service_with_connect_info::<SocketAddr>());

    let https_server = if args.disable_https {
        None
    } else {
        let https_addr = SocketAddr::new(host, args.https_port);
        let tls_config = tls::build_rustls_config(&args, host).await?;
        info!("🔒 Starting HTTPS server at {}", https_addr);
        let https_app = app.layer(Extension(RequestScheme::Https));
        Some(
            axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(https_app.into_make_service_with_connect_info::<SocketAddr>()),
        )
    };
    let https_server = async move {
        match https_server {
            Some(server) => server.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// Builds the API router; callers add the CORS layer and the per-listener
/// `RequestScheme` extension.
fn build_router(
    uploader: Arc<Uploader>,
    store: Arc<ArtifactStore>,
    auth_config: Arc<AuthConfig>,
    limits: BodyLimits,
) -> Router {
    Router::new()
        .route(
            "/api/upload-chunk",
            post(upload::upload_chunk).layer(body_limit(limits.chunk)),
        )
        .route("/api/upload-chunk/{upload_id}", delete(upload::abort_upload))
        .route(
            "/api/upload",
            post(upload::upload_file).layer(body_limit(limits.file)),
        )
        .route("/api/file/{id}", get(files::serve_artifact))
        .route("/api/view/{id}", get(files::serve_artifact))
        .route("/api/status", get(status::get_status))
        .route("/api/version", get(status::get_version_info))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .fallback(|| async { ApiError::NotFound("Not found".into()) })
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(uploader))
        .layer(Extension(store))
        .layer(Extension(auth_config))
        .layer(Extension(StartedAt(Instant::now())))
}

fn body_limit(limit: Option<u64>) -> DefaultBodyLimit {
    match limit {
        Some(limit) => DefaultBodyLimit::max((limit + MULTIPART_OVERHEAD) as usize),
        None => DefaultBodyLimit::disable(),
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
