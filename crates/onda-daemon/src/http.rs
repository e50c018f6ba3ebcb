//! HTTP control API — the remote-control surface for a phone or browser on
//! the same network.  Thin: every handler just forwards a `Command` into
//! the DaemonCore loop.

use crate::core::DaemonEvent;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use onda_proto::protocol::Command;
use onda_proto::resilience::Phase;
use onda_proto::state::StateManager;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Serialize)]
struct ApiState {
    station_name: String,
    station_url: String,
    phase: Phase,
    is_playing: bool,
    online: bool,
    volume: f32,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app_state = HttpState {
            state_manager,
            event_tx,
        };

        let app = Router::new()
            .route("/api/state", get(get_state))
            .route("/api/play", get(play).post(play))
            .route("/api/reload", get(reload).post(reload))
            .route("/api/pause", get(pause).post(pause))
            .route("/api/toggle", get(toggle).post(toggle))
            .route("/api/volume/:volume", get(set_volume).post(set_volume))
            .route("/api/volume", get(get_volume))
            .layer(CorsLayer::permissive())
            .with_state(app_state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<ApiState> {
    let daemon_state = state.state_manager.get_state().await;
    Json(ApiState {
        station_name: daemon_state.station_name.clone(),
        station_url: daemon_state.station_url.clone(),
        phase: daemon_state.phase,
        is_playing: daemon_state.is_playing(),
        online: daemon_state.online,
        volume: daemon_state.volume,
    })
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward command from HTTP API");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn play(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: play");
    send(&state, Command::Play { force_reload: false }).await
}

async fn reload(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: forced-reload play");
    send(&state, Command::Play { force_reload: true }).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: pause");
    send(&state, Command::Pause).await
}

async fn toggle(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: toggle");
    send(&state, Command::TogglePause).await
}

async fn set_volume(
    State(state): State<HttpState>,
    axum::extract::Path(volume): axum::extract::Path<i32>,
) -> StatusCode {
    let vol = (volume as f32 / 100.0).clamp(0.0, 1.0);
    info!("HTTP API: set volume to {}%", volume);
    send(&state, Command::Volume { value: vol }).await
}

async fn get_volume(State(state): State<HttpState>) -> Json<VolumeStatus> {
    let daemon_state = state.state_manager.get_state().await;
    let volume = (daemon_state.volume * 100.0).round() as u8;
    Json(VolumeStatus { volume })
}
