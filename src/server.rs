mod handlers;
mod responses;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::hub::Hub;
use crate::infrastructure::{HttpTransport, InMemorySubscriptionStore};
use crate::server::handlers::{health::health_check, hub::handshake, publish::publish};
use axum::http::Method;
use axum::{
    Router,
    routing::{get, post},
};
use color_eyre::eyre::{Context, Result};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
/// The global application state shared between all request handlers.
pub(crate) struct AppState {
    hub: Arc<Hub>,
}

pub struct Server {
    router: Router,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Creates a hub server backed by the in-memory store and the HTTP transport.
    pub async fn new(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new().wrap_err("Failed to build HTTP client")?;
        let hub = Hub::from_config(
            &config.hub,
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(transport),
        );
        Self::with_hub(config, Arc::new(hub)).await
    }

    /// Creates a server around an already wired hub.
    pub async fn with_hub(config: &Config, hub: Arc<Hub>) -> Result<Self> {
        let trace_layer =
            TraceLayer::new_for_http().make_span_with(|request: &'_ axum::extract::Request<_>| {
                let uri = request.uri().to_string();
                tracing::info_span!("request", method = %request.method(), uri)
            });

        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

        let state = AppState { hub };

        let router = Router::new()
            .route("/health", get(health_check))
            .route("/hub", post(handshake))
            .route("/publish", post(publish))
            .layer(cors_layer)
            .layer(trace_layer)
            .with_state(state);

        let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await
            .wrap_err_with(|| format!("Failed to bind to port {}", config.server.port))?;
        let local_addr = listener
            .local_addr()
            .wrap_err("Failed to read listener address")?;

        Ok(Self {
            router,
            listener,
            local_addr,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Runs the hub server.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Server listening on {}", self.local_addr);
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }
}
