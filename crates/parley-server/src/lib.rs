use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::middleware::require_auth;
use parley_api::{conversations, users};
use parley_db::Database;
use parley_gateway::connection;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::router::MessageRouter;
use parley_types::api::Claims;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    dispatcher: Dispatcher,
    jwt_secret: String,
}

/// Assemble the full application: public auth routes, the protected read
/// path, and the WebSocket gateway, all sharing one store and one presence
/// dispatcher.
pub fn build_app(db: Arc<Database>, jwt_secret: String) -> Router {
    let dispatcher = Dispatcher::new();
    let router = MessageRouter::new(db.clone(), dispatcher.clone());
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: jwt_secret.clone(),
        router,
    });

    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/users", get(users::list_users))
        .route("/users/{user_id}/messages", get(conversations::get_messages))
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}/read",
            put(conversations::mark_read),
        )
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state.clone());

    let ws_route = Router::new().route("/gateway", get(ws_upgrade)).with_state(ServerState {
        app: app_state,
        dispatcher,
        jwt_secret,
    });

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct GatewayAuth {
    token: Option<String>,
}

/// The token is validated before the upgrade completes, so no gateway handler
/// ever runs for an unauthenticated socket and a rejected attempt leaves no
/// registration behind.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(auth): Query<GatewayAuth>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = auth.token else {
        return (StatusCode::UNAUTHORIZED, "missing gateway token").into_response();
    };

    let claims = match decode::<Claims>(
        &token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data.claims,
        Err(e) => {
            warn!("Gateway auth failed: {}", e);
            return (StatusCode::UNAUTHORIZED, "invalid gateway token").into_response();
        }
    };

    let dispatcher = state.dispatcher.clone();
    let router = state.app.router.clone();
    let db = state.app.db.clone();
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, dispatcher, router, db, claims.sub, claims.username)
    })
}
