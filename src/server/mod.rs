//! HTTP front-end.
//!
//! Every request that is not a health probe, the status endpoint, or a
//! WebSocket upgrade is translated into a wire request and dispatched to
//! the worker pool. Pool errors map onto gateway status codes: worker
//! failures become 502, timeouts 504, exhaustion and shutdown 503.

use crate::config::Config;
use crate::error::{MembraneError, Result};
use crate::pool::{Pool, PoolStats, Watcher};
use crate::protocol::message::RequestHeaders;
use crate::websocket::{self, Registry, RegistryStats};
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared state handed to every handler.
pub struct AppState {
    pub pool: Arc<Pool>,
    pub registry: Option<Arc<Registry<Arc<Pool>>>>,
}

#[derive(Serialize)]
struct StatusResponse {
    pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    websocket: Option<RegistryStats>,
}

/// Start the pool and serve HTTP until a shutdown signal arrives.
pub async fn run(cfg: Config) -> Result<()> {
    let pool = Pool::new(cfg.pool.clone(), cfg.php.clone());
    pool.start().await?;

    let registry = cfg.websocket.enabled.then(|| {
        Arc::new(Registry::new(
            Arc::clone(&pool),
            cfg.websocket.max_connections,
        ))
    });

    let watcher = if cfg.watch.enabled {
        let watcher = Watcher::new(cfg.watch.dirs.clone(), cfg.watch.interval.get());
        let reload_pool = Arc::clone(&pool);
        watcher.start(Box::new(move || {
            let pool = Arc::clone(&reload_pool);
            tokio::spawn(async move {
                if let Err(e) = pool.reload().await {
                    error!(error = %e, "watch-triggered reload failed");
                }
            });
        }));
        Some(watcher)
    } else {
        None
    };

    #[cfg(unix)]
    spawn_reload_listener(Arc::clone(&pool));

    let state = Arc::new(AppState {
        pool: Arc::clone(&pool),
        registry,
    });
    let app = build_router(&cfg, state);

    let addr = cfg.listen_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MembraneError::Config(format!("binding {}: {}", addr, e)))?;
    info!(address = %addr, "http server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutdown signal received");
    if let Some(watcher) = &watcher {
        watcher.stop();
    }
    pool.stop().await?;
    Ok(())
}

fn build_router(cfg: &Config, state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status));
    if cfg.websocket.enabled {
        app = app.route(&cfg.websocket.path, get(websocket::ws_handler));
    }
    app.fallback(handle_php)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.pool.stats();
    if stats.idle_workers > 0 {
        (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
            .into_response()
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        pool: state.pool.stats(),
        websocket: state.registry.as_ref().map(|r| r.stats()),
    })
}

/// Translate an HTTP request into a worker turn and its reply back into an
/// HTTP response.
async fn handle_php(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            warn!(error = %e, "reading request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let mut headers = HashMap::new();
    for name in parts.headers.keys() {
        let joined = parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        headers.insert(name.as_str().to_string(), joined);
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let request_headers = RequestHeaders {
        method: parts.method.to_string(),
        uri: parts.uri.path().to_string(),
        query_string: parts.uri.query().unwrap_or("").to_string(),
        headers,
        remote_addr: addr.to_string(),
        server_port: extract_port(&host),
        server_name: host,
        protocol: format!("{:?}", parts.version),
    };

    match state.pool.exec(request_headers, body).await {
        Ok((response, response_body)) => {
            let mut http_response = Response::new(Body::from(response_body));
            *http_response.status_mut() =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
            for (name, value) in &response.headers {
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        http_response.headers_mut().insert(name, value);
                    }
                    _ => warn!(header = %name, "dropping invalid response header"),
                }
            }
            http_response
        }
        Err(e) => error_response(e),
    }
}

fn error_response(err: MembraneError) -> Response {
    let status = match &err {
        MembraneError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        MembraneError::PoolExhausted { .. } | MembraneError::Shutdown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::BAD_GATEWAY,
    };
    error!(error = %err, status = %status, "worker exec failed");
    (status, err.to_string()).into_response()
}

/// Port carried in the Host header; defaults to 80.
fn extract_port(host: &str) -> String {
    match host.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            port.to_string()
        }
        _ => "80".to_string(),
    }
}

/// SIGUSR1 requests a zero-downtime worker reload.
#[cfg(unix)]
fn spawn_reload_listener(pool: Arc<Pool>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGUSR1 handler");
                return;
            }
        };
        while stream.recv().await.is_some() {
            info!("SIGUSR1 received, reloading workers");
            if let Err(e) = pool.reload().await {
                error!(error = %e, "reload failed");
            }
        }
    });
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_port() {
        assert_eq!(extract_port("app.example.com:8443"), "8443");
        assert_eq!(extract_port("app.example.com"), "80");
        assert_eq!(extract_port(""), "80");
        assert_eq!(extract_port("bad:port:"), "80");
    }

    #[test]
    fn test_error_response_status_mapping() {
        let cases = [
            (
                MembraneError::RequestTimeout {
                    elapsed: std::time::Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                MembraneError::PoolExhausted {
                    waited: std::time::Duration::from_secs(1),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (MembraneError::Shutdown, StatusCode::SERVICE_UNAVAILABLE),
            (
                MembraneError::WorkerReported("boom".to_string()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(err).status(), expected);
        }
    }
}
