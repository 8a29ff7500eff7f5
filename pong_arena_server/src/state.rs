use std::sync::Arc;

use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Json, Router};
use tokio::sync::broadcast;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;

use crate::api;
use crate::auth::{self, SessionGate};
use crate::chat::{spawn_chat, BrokerHandle, HubHandle};
use crate::config::Config;
use crate::game::{MatchRegistry, RuntimeDeps};
use crate::store::Store;
use crate::tournament::TournamentService;
use crate::ws;

/// Root context constructed once at startup; component handles are passed
/// explicitly instead of living in module globals.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<Store>,
    pub gate: Arc<SessionGate>,
    pub registry: Arc<MatchRegistry>,
    pub hub: HubHandle,
    pub invites: BrokerHandle,
    pub tournaments: Arc<TournamentService>,
    pub shutdown: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(cfg: Config) -> Self {
        let cfg = Arc::new(cfg);
        let store = Arc::new(Store::new());
        let (shutdown, _) = broadcast::channel(4);
        let gate = Arc::new(SessionGate::new(
            &cfg.access_secret,
            cfg.access_ttl_secs,
            store.clone(),
        ));
        let tournaments = Arc::new(TournamentService::new(store.clone(), shutdown.clone()));
        let registry = Arc::new(MatchRegistry::new());
        let (hub, invites) = spawn_chat(cfg.clone(), store.clone(), shutdown.clone());

        Self {
            cfg,
            store,
            gate,
            registry,
            hub,
            invites,
            tournaments,
            shutdown,
        }
    }

    pub fn runtime_deps(&self) -> RuntimeDeps {
        RuntimeDeps {
            cfg: self.cfg.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            tournaments: self.tournaments.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Build the full router: REST behind the session middleware, the three
/// socket endpoints, and the OpenAPI document.
pub fn router(state: AppState) -> Router {
    let api = api::api_router().layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_session,
    ));

    Router::new()
        .route("/openapi.json", get(serve_openapi))
        .merge(api)
        .route("/ws/chat", get(ws::chat::handle_chat_ws))
        .route("/ws/pong/:match_id", get(ws::pong::handle_pong_ws))
        .route("/ws/tournament", get(ws::tournament::handle_tournament_ws))
        .layer(cors_layer(&state.cfg))
        .with_state(state)
}

async fn serve_openapi() -> impl IntoResponse {
    Json(api::ApiDoc::openapi())
}

fn cors_layer(cfg: &Config) -> CorsLayer {
    if cfg.cors_origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = cfg
        .cors_origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}
