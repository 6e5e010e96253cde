use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use device_link::{select_port, spawn_link_manager, TokioSerialBackend};
use futures::{SinkExt, StreamExt};
use sequencer::spawn_sequencer;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{PlaybackState, Recipe, SystemStatus},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use storage::Storage;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;
mod status;
#[cfg(test)]
mod test_support;

use api::{ApiContext, Reply};
use app_state::AppState;
use config::{load_settings, prepare_database_url};
use status::spawn_status_broadcaster;

const MAX_REQUEST_BYTES: usize = 256 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct PortSummary {
    path: String,
    manufacturer: Option<String>,
    serial_number: Option<String>,
    /// Whether discovery would pick this port.
    selected: bool,
}

type HttpError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let (events, _) = broadcast::channel(256);
    let backend = Arc::new(TokioSerialBackend);
    let link = spawn_link_manager(settings.link_config(), backend.clone(), Some(events.clone()));
    let sequencer = spawn_sequencer(Arc::new(link.clone()), Some(events.clone()));
    spawn_status_broadcaster(link.subscribe(), sequencer.subscribe(), events.clone());

    let state = AppState {
        api: ApiContext {
            storage,
            link,
            sequencer,
        },
        backend,
        port_identifiers: settings.port_identifiers.clone(),
        events,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(http_status))
        .route("/ports", get(http_list_ports))
        .route("/recipes", get(http_list_recipes).post(http_save_recipe))
        .route("/recipes/stop", post(http_stop_recipe))
        .route("/recipes/:recipe_id", delete(http_delete_recipe))
        .route("/recipes/:recipe_id/activate", post(http_activate_recipe))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn http_error(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        http_error(ApiError::new(
            ErrorCode::Unavailable,
            format!("storage unavailable: {e}"),
        ))
    })?;
    Ok("ok")
}

async fn http_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    Json(api::system_status(&state.api))
}

async fn http_list_ports(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PortSummary>>, HttpError> {
    let ports = state.backend.list_ports().await.map_err(|e| {
        http_error(ApiError::new(ErrorCode::Unavailable, e.to_string()))
    })?;
    let chosen = select_port(&ports, &state.port_identifiers);
    Ok(Json(
        ports
            .into_iter()
            .map(|port| PortSummary {
                selected: chosen.as_deref() == Some(port.path.as_str()),
                path: port.path,
                manufacturer: port.manufacturer,
                serial_number: port.serial_number,
            })
            .collect(),
    ))
}

async fn http_list_recipes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Recipe>>, HttpError> {
    let recipes = api::list_recipes(&state.api).await.map_err(http_error)?;
    Ok(Json(recipes))
}

async fn http_save_recipe(
    State(state): State<Arc<AppState>>,
    Json(recipe): Json<Recipe>,
) -> Result<Json<Vec<Recipe>>, HttpError> {
    let recipes = api::save_recipe(&state.api, recipe)
        .await
        .map_err(http_error)?;
    let _ = state.events.send(ServerEvent::RecipesUpdated {
        recipes: recipes.clone(),
    });
    Ok(Json(recipes))
}

async fn http_delete_recipe(
    State(state): State<Arc<AppState>>,
    Path(recipe_id): Path<String>,
) -> Result<Json<Vec<Recipe>>, HttpError> {
    let recipes = api::delete_recipe(&state.api, &recipe_id)
        .await
        .map_err(http_error)?;
    let _ = state.events.send(ServerEvent::RecipesUpdated {
        recipes: recipes.clone(),
    });
    Ok(Json(recipes))
}

async fn http_activate_recipe(
    State(state): State<Arc<AppState>>,
    Path(recipe_id): Path<String>,
) -> Result<StatusCode, HttpError> {
    api::activate_recipe(&state.api, &recipe_id)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::ACCEPTED)
}

async fn http_stop_recipe(State(state): State<Arc<AppState>>) -> (StatusCode, Json<PlaybackState>) {
    (StatusCode::ACCEPTED, Json(api::stop_recipe(&state.api).await))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let _ = direct_tx.send(ServerEvent::StatusUpdate {
        status: api::system_status(&state.api),
    });
    debug!("ws: session attached");

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(event) => event,
                    None => break,
                },
                broadcast = events_rx.recv() => match broadcast {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ws: session lagging, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => api::handle_request(&state.api, request).await,
            Err(err) => Err(ApiError::new(
                ErrorCode::Validation,
                format!("invalid request: {err}"),
            )),
        };
        match reply {
            Ok(Reply::None) => {}
            Ok(Reply::Direct(event)) => {
                let _ = direct_tx.send(event);
            }
            Ok(Reply::Broadcast(event)) => {
                let _ = state.events.send(event);
            }
            Err(err) => {
                warn!(code = ?err.code, message = %err.message, "ws: request failed");
                let _ = direct_tx.send(ServerEvent::Error(err));
            }
        }
    }

    debug!("ws: session detached");
    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
