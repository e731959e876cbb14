//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the pipeline fallback handler
//! - Wire up middleware (request ID, tracing, timeout, body limit, Server header)
//! - Bind server to listener
//! - Dispatch requests through the current route table
//! - Swap in rebuilt route tables on config reload
//! - Observability (metrics, correlation IDs)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::cgi::env::SERVER_SOFTWARE;
use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::http::request::{MakeRequestUuid, Request, X_REQUEST_ID};
use crate::lifecycle::ShutdownListener;
use crate::observability::metrics;
use crate::routing::{build_routes, BuildError, RouteTable};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<ArcSwap<RouteTable>>,
}

/// HTTP server for the pipeline engine.
pub struct HttpServer {
    router: Router,
    config: ServerConfig,
    routes: Arc<ArcSwap<RouteTable>>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    ///
    /// Builds the initial route table, which starts any networks the
    /// configuration declares, so this must run inside a Tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, BuildError> {
        let table = build_routes(&config)?;
        tracing::info!(routes = table.len(), "Route table built");

        let routes = Arc::new(ArcSwap::from_pointee(table));
        let state = AppState {
            routes: Arc::clone(&routes),
        };
        let router = Self::build_router(&config, state);

        Ok(Self { router, config, routes })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ServerConfig, state: AppState) -> Router {
        let mut router = Router::new()
            .fallback(pipeline_handler)
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::SERVER,
                HeaderValue::from_static(SERVER_SOFTWARE),
            ));

        if config.timeouts.request_secs > 0 {
            router = router.layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)));
        }

        router
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// The Axum router, for driving the server without a listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Rebuild the route table from `config` and swap it in.
    ///
    /// Requests already dispatched finish on the old table. On error the
    /// current table stays in place.
    pub fn reload(&self, config: &ServerConfig) -> Result<(), BuildError> {
        swap_routes(&self.routes, config)
    }

    /// Run the server until `shutdown` fires, accepting connections on the
    /// given listener and applying configurations from `config_updates`.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ServerConfig>,
        shutdown: ShutdownListener,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let routes = Arc::clone(&self.routes);
        let bind_address = self.config.listener.bind_address.clone();
        let mut reload_stop = shutdown.clone();
        let reloader = tokio::spawn(async move {
            loop {
                let config = tokio::select! {
                    _ = reload_stop.wait() => break,
                    update = config_updates.recv() => match update {
                        Some(config) => config,
                        None => break,
                    },
                };
                if config.listener.bind_address != bind_address {
                    tracing::warn!(
                        configured = %config.listener.bind_address,
                        active = %bind_address,
                        "Listener changes need a restart; applying routes only"
                    );
                }
                if let Err(e) = swap_routes(&routes, &config) {
                    tracing::error!(error = %e, "Failed to rebuild routes, keeping current table");
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown = shutdown;
                shutdown.wait().await;
                tracing::info!("Shutdown requested, draining connections");
            })
            .await?;

        reloader.abort();
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

fn swap_routes(routes: &ArcSwap<RouteTable>, config: &ServerConfig) -> Result<(), BuildError> {
    let table = build_routes(config)?;
    let count = table.len();
    let previous = routes.swap(Arc::new(table));
    tracing::info!(routes = count, previous = previous.len(), "Route table swapped");
    Ok(())
}

/// Fallback handler: every request goes through the route table.
async fn pipeline_handler(State(state): State<AppState>, request: axum::http::Request<Body>) -> Response {
    let start = Instant::now();
    let table = state.routes.load_full();

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let request_id = parts
        .headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let Some(route) = table.lookup(parts.uri.path()) else {
        tracing::debug!(request_id = %request_id, path = %parts.uri.path(), "No route matched");
        metrics::record_request("none", StatusCode::NOT_FOUND.as_u16(), start);
        return (StatusCode::NOT_FOUND, "404 page not found\n").into_response();
    };

    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        route = %route.pattern.as_str(),
        "Dispatching request"
    );

    let req = Request::from_parts(&parts, remote).with_route(route.pattern.as_str());
    let conn = Connection::new(body);
    let conn = route.handler.serve(conn, req).await;
    let response = conn.into_response();

    metrics::record_request(route.pattern.as_str(), response.status().as_u16(), start);
    response
}
