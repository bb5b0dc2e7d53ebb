//! `HubServer`: Axum HTTP + `WebSocket` gateway and its background tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use talkie_core::{
    IdentityVerifier, InMemoryDirectory, MembershipLookup, MessageStore, PresenceObserver,
    ReadTracker,
};

use crate::bus::{BusBridge, MessageBus, Publisher};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse, OnlineResponse};
use crate::presence::{announce_presence, forward_presence};
use crate::shutdown::{Phase, ShutdownCoordinator};
use crate::websocket::dispatcher::EventDispatcher;
use crate::websocket::pump::{PumpContext, run_connection};
use crate::websocket::registry::Registry;

/// External systems the hub consults while handling events.
#[derive(Clone)]
pub struct Collaborators {
    /// Conversation membership.
    pub membership: Arc<dyn MembershipLookup>,
    /// Chat message persistence.
    pub messages: Arc<dyn MessageStore>,
    /// Read receipt persistence.
    pub receipts: Arc<dyn ReadTracker>,
    /// Told about every presence transition.
    pub presence: Arc<dyn PresenceObserver>,
}

impl Collaborators {
    /// Back every collaborator with one in-memory directory.
    pub fn in_memory(directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            membership: directory.clone(),
            messages: directory.clone(),
            receipts: directory.clone(),
            presence: directory,
        }
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    pump: Arc<PumpContext>,
    verifier: Arc<dyn IdentityVerifier>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

/// The connection hub for one process.
pub struct HubServer {
    config: ServerConfig,
    state: AppState,
}

impl HubServer {
    /// Build the hub and spawn its background tasks: the registry control
    /// loop, the bus subscription and both presence consumers.
    ///
    /// The bus subscription is open by the time this returns.
    pub async fn start(
        config: ServerConfig,
        bus: Arc<dyn MessageBus>,
        collaborators: Collaborators,
        verifier: Arc<dyn IdentityVerifier>,
        metrics: PrometheusHandle,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let (registry, control) = Registry::new(&config.hub);
        let announce_rx = registry.subscribe_presence();
        let observe_rx = registry.subscribe_presence();
        let publisher = Publisher::new(Arc::clone(&bus));

        shutdown.track(
            Phase::Intake,
            tokio::spawn(Arc::clone(&registry).run(control, shutdown.token(Phase::Intake))),
        );
        shutdown.track(
            Phase::Presence,
            tokio::spawn(announce_presence(
                announce_rx,
                publisher.clone(),
                shutdown.token(Phase::Presence),
            )),
        );
        shutdown.track(
            Phase::Presence,
            tokio::spawn(forward_presence(
                observe_rx,
                collaborators.presence,
                shutdown.token(Phase::Presence),
            )),
        );
        shutdown.track(
            Phase::Bus,
            BusBridge::new(Arc::clone(&bus), Arc::clone(&registry), config.resubscribe_delay)
                .start(shutdown.token(Phase::Bus))
                .await,
        );

        let dispatcher = Arc::new(EventDispatcher::new(
            collaborators.membership,
            collaborators.messages,
            collaborators.receipts,
            publisher,
        ));
        let pump = Arc::new(PumpContext {
            registry: Arc::clone(&registry),
            dispatcher,
            config: config.hub.clone(),
        });
        info!(bus = bus.name(), "hub started");

        Self {
            config,
            state: AppState {
                registry,
                pump,
                verifier,
                shutdown,
                metrics,
                start_time: Instant::now(),
            },
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/online", get(online_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.state.shutdown.token(Phase::Intake);
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "http server failed");
            }
        });
        self.state.shutdown.track(Phase::Intake, handle);
        info!(%addr, "listening");
        Ok(addr)
    }

    /// Stop accepting connections and close every open connection, then let
    /// the presence consumers report the resulting `offline` transitions
    /// before the bus subscription closes. `timeout` bounds the whole stop.
    pub async fn shutdown_gracefully(&self, timeout: Option<Duration>) {
        self.state.shutdown.graceful_shutdown(timeout).await;
        info!("hub stopped");
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.state.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    token: Option<String>,
}

/// Token from `?token=` or, failing that, an `Authorization: Bearer` header.
fn bearer_token<'a>(params: &'a ConnectParams, headers: &'a HeaderMap) -> &'a str {
    if let Some(token) = params.token.as_deref() {
        return token;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// GET /ws: authenticate, then upgrade and run the connection pumps.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down");
    }
    let identity = match state.verifier.verify(bearer_token(&params, &headers)) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "rejected connection attempt");
            return error_response(StatusCode::UNAUTHORIZED, &e.to_string());
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(user_id = %identity.user_id, error = %rejection, "websocket upgrade rejected");
            return rejection.into_response();
        }
    };

    let pump = Arc::clone(&state.pump);
    // Transport ceiling only; the pump enforces the real limit and closes
    // with 1009 instead of dropping the socket.
    let ceiling = pump.config.max_frame_bytes.saturating_mul(4);
    upgrade
        .max_message_size(ceiling)
        .on_upgrade(move |socket| async move {
            let (writer, reader) = socket.split();
            run_connection(writer, reader, identity, pump).await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let online = state.registry.online_user_ids().await.len();
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.registry.connection_count(),
        online,
    ))
}

/// GET /online
async fn online_handler(State(state): State<AppState>) -> Json<OnlineResponse> {
    Json(OnlineResponse {
        user_ids: state.registry.online_user_ids().await,
    })
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}
