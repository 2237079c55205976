//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use axum::http::HeaderName;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::store::ArtifactStore;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind to
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            enable_cors: true,
        }
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Server start time, for uptime
    pub start_time: Instant,
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<ArtifactStore>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, store: Arc<ArtifactStore>) -> Self {
        Self {
            start_time: Instant::now(),
            pipeline: Arc::new(pipeline),
            store,
        }
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
        router
            .layer(PropagateRequestIdLayer::new(request_id.clone()))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &Request| {
                        if req.uri().path().starts_with("/health") {
                            return Span::none();
                        }
                        let request_id = req
                            .headers()
                            .get(REQUEST_ID_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        tracing::info_span!(
                            "request",
                            method = %req.method(),
                            uri = %req.uri(),
                            request_id,
                        )
                    })
                    .on_request(|_req: &Request, span: &Span| {
                        if span.is_disabled() {
                            return;
                        }
                        tracing::debug!(parent: span, "started processing request");
                    })
                    .on_response(
                        |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                            if span.is_disabled() {
                                return;
                            }
                            tracing::info!(
                                parent: span,
                                status = res.status().as_u16(),
                                latency_ms = latency.as_millis() as u64,
                                "finished processing request"
                            );
                        },
                    )
                    .on_failure(
                        |class: tower_http::classify::ServerErrorsFailureClass,
                         latency: Duration,
                         span: &Span| {
                            if span.is_disabled() {
                                return;
                            }
                            tracing::error!(
                                parent: span,
                                %class,
                                latency_ms = latency.as_millis() as u64,
                                "request failed"
                            );
                        },
                    ),
            )
            .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
    }

    /// Start the server and run until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid address: {}", e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await?;

        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
