//! API server setup and configuration.

use axum::Router;
use axum::extract::Request;
use chrono_tz::Tz;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::config::ServerConfig;
use crate::database::repositories::HeartbeatStore;
use crate::error::Result;
use crate::registry::StreamRegistry;
use crate::scheduler::SchedulerStats;
use crate::status::StatusAggregator;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub registry: Arc<StreamRegistry>,
    pub aggregator: Arc<StatusAggregator>,
    pub store: Option<Arc<dyn HeartbeatStore>>,
    pub scheduler_stats: Option<Arc<SchedulerStats>>,
    /// Display timezone for timestamps.
    pub timezone: Tz,
}

impl AppState {
    pub fn new(registry: Arc<StreamRegistry>, aggregator: Arc<StatusAggregator>) -> Self {
        Self {
            start_time: Instant::now(),
            registry,
            aggregator,
            store: None,
            scheduler_stats: None,
            timezone: Tz::UTC,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn HeartbeatStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_scheduler_stats(mut self, stats: Arc<SchedulerStats>) -> Self {
        self.scheduler_stats = Some(stats);
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ServerConfig, state: AppState, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            state,
            cancel_token,
        }
    }

    fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());

        if self.config.cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        // Health probes are polled often; keep them out of the request log.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    if req.uri().path().starts_with("/health") {
                        Span::none()
                    } else {
                        let mut make_span =
                            tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::DEBUG);
                        use tower_http::trace::MakeSpan;
                        make_span.make_span(req)
                    }
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                        if span.is_disabled() {
                            return;
                        }
                        let on_response =
                            tower_http::trace::DefaultOnResponse::new().level(tracing::Level::DEBUG);
                        use tower_http::trace::OnResponse;
                        on_response.on_response(res, latency, span);
                    },
                ),
        )
    }

    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| crate::Error::Api(format!("Invalid address: {}", e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await
            .map_err(|e| crate::Error::Api(format!("Server error: {}", e)))?;

        Ok(())
    }
}
