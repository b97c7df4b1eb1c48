use crate::core::DaemonEvent;
use crate::media_session::PublishedMediaSession;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, TimeDelta, Utc};
use onair_core::history;
use onair_core::logger::BatchSummary;
use onair_core::playback::MediaSessionUpdate;
use onair_core::poller::PlayFeed;
use onair_core::protocol::{Command, PlaybackReport};
use onair_core::resolver::{NowPlayingResolver, NowPlayingState};
use onair_core::store::{HistoryQuery, PersistedPlay, PlayStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpState {
    pub resolver: Arc<NowPlayingResolver>,
    pub store: Arc<dyn PlayStore>,
    /// `None` when no upstream is configured.
    pub feed: Option<Arc<PlayFeed>>,
    pub cron_token: Option<String>,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub playback: watch::Receiver<PlaybackReport>,
    pub media_session: Arc<PublishedMediaSession>,
    pub station_name: String,
    pub suppress_window: TimeDelta,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    since: Option<String>,
    until: Option<String>,
    q: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
    muted: bool,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/now-playing", get(now_playing))
        .route("/api/history", get(get_history))
        .route("/api/playback", get(get_playback))
        .route("/api/play", post(play))
        .route("/api/pause", post(pause))
        .route("/api/stop", post(stop))
        .route("/api/volume", get(get_volume))
        .route("/api/volume/:volume", post(set_volume))
        .route("/api/mute/:state", post(set_mute))
        .route("/api/media-session", get(get_media_session))
        .route("/api/cron/log-plays", post(cron_log_plays).get(cron_log_plays))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("[http] failed to bind {}: {}", addr, e);
                return;
            }
        };

        info!("[http] listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("[http] server error: {}", e);
        }
    })
}

// ── now playing / history ─────────────────────────────────────────────────────

async fn now_playing(State(state): State<HttpState>) -> Json<NowPlayingState> {
    Json(state.resolver.current())
}

fn parse_timestamp(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => DateTime::parse_from_rfc3339(v)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| {
                error_response(
                    StatusCode::BAD_REQUEST,
                    format!("{} must be an RFC 3339 timestamp", field),
                )
            }),
    }
}

async fn get_history(
    State(state): State<HttpState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<PersistedPlay>>, Response> {
    let query = HistoryQuery {
        since: parse_timestamp("since", params.since.as_deref())?,
        until: parse_timestamp("until", params.until.as_deref())?,
        search: params.q,
        limit: params.limit.unwrap_or(0),
    };

    let rows = state.store.query(&query).await.map_err(|e| {
        error!("[http] history query failed: {}", e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "history unavailable")
    })?;

    Ok(Json(history::for_display(
        &rows,
        &state.station_name,
        state.suppress_window,
    )))
}

// ── playback ──────────────────────────────────────────────────────────────────

async fn get_playback(State(state): State<HttpState>) -> Json<PlaybackReport> {
    Json(state.playback.borrow().clone())
}

async fn get_media_session(State(state): State<HttpState>) -> Json<Option<MediaSessionUpdate>> {
    Json(state.media_session.current())
}

async fn send_command(state: &HttpState, cmd: Command) -> StatusCode {
    info!("[http] {:?}", cmd);
    if state.event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
        error!("[http] daemon core is gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn play(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Play).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Pause).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Stop).await
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<i32>) -> StatusCode {
    let value = (volume as f32 / 100.0).clamp(0.0, 1.0);
    send_command(&state, Command::Volume { value }).await
}

async fn get_volume(State(state): State<HttpState>) -> Json<VolumeStatus> {
    let session = state.playback.borrow().session.clone();
    Json(VolumeStatus {
        volume: (session.volume * 100.0).round() as u8,
        muted: session.is_muted,
    })
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

async fn set_mute(State(state): State<HttpState>, Path(raw): Path<String>) -> Response {
    match parse_switch(&raw) {
        Some(muted) => send_command(&state, Command::Mute { muted })
            .await
            .into_response(),
        None => error_response(StatusCode::BAD_REQUEST, "expected on or off"),
    }
}

// ── scheduled log job ─────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Length-independent comparison so response timing does not leak a prefix.
fn tokens_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

async fn cron_log_plays(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Json<BatchSummary>, Response> {
    let Some(expected) = state.cron_token.as_deref() else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "scheduled logging is not configured",
        ));
    };
    match bearer_token(&headers) {
        Some(given) if tokens_match(given, expected) => {}
        _ => {
            warn!("[http] rejected log-plays call with missing or bad token");
            return Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
    }
    let Some(feed) = state.feed.as_ref() else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no upstream configured",
        ));
    };

    feed.run_log_cycle(Utc::now()).await.map(Json).map_err(|e| {
        error!("[http] log-plays failed: {}", e);
        error_response(StatusCode::BAD_GATEWAY, e.to_string())
    })
}
