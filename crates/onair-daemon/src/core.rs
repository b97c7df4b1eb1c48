/// DaemonCore: the single owner of playback state.
///
/// ```text
///   HTTP handlers ──DaemonEvent──┐
///   heartbeat ticker ────────────┤
///   engine timers / play tasks ──┼──► DaemonCore::run ──► PlaybackEngine
///   mpv reader task ──MpvEvent───┤                    └─► PlaybackReport (watch)
///   now-playing resolver (watch)─┘
/// ```
///
/// Nothing else mutates the engine, so HTTP commands, retries and mpv
/// observations are applied strictly in arrival order.
use std::sync::Arc;

use onair_core::playback::{
    ConnectionStatus, MediaMetadata, PlaybackEngine, PlaybackEvent, PlaybackSession,
};
use onair_core::protocol::{Command, PlaybackReport};
use onair_core::resolver::NowPlayingState;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::mpv::{MpvEvent, MpvStreamBackend, OBS_CORE_IDLE, OBS_ICY_TITLE, OBS_PAUSED_FOR_CACHE};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Buffering longer than this while streaming counts as a stall.
const STALL_GRACE: Duration = Duration::from_secs(10);

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All external inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from the HTTP API.
    ClientCommand(Command),
    /// Heartbeat: check process liveness and stalls.
    HeartbeatTick,
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    engine: PlaybackEngine,
    engine_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    backend: Arc<MpvStreamBackend>,
    mpv_rx: mpsc::Receiver<MpvEvent>,
    now_playing: watch::Receiver<NowPlayingState>,
    report_tx: watch::Sender<PlaybackReport>,
    heartbeat_tx: mpsc::Sender<DaemonEvent>,
    /// Set when mpv reports paused-for-cache while streaming.
    stalled_since: Option<Instant>,
    last_icy: Option<String>,
}

impl DaemonCore {
    pub fn new(
        engine: PlaybackEngine,
        engine_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
        backend: Arc<MpvStreamBackend>,
        mpv_rx: mpsc::Receiver<MpvEvent>,
        now_playing: watch::Receiver<NowPlayingState>,
        heartbeat_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let report = PlaybackReport {
            session: engine.session(),
            mpv: backend.health(),
            stream_url: backend.stream_url().to_string(),
        };
        let (report_tx, _) = watch::channel(report);
        Self {
            engine,
            engine_rx,
            backend,
            mpv_rx,
            now_playing,
            report_tx,
            heartbeat_tx,
            stalled_since: None,
            last_icy: None,
        }
    }

    /// For `GET /api/playback`.
    pub fn reports(&self) -> watch::Receiver<PlaybackReport> {
        self.report_tx.subscribe()
    }

    /// Run until `Shutdown` arrives or every command sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("[core] starting event loop");

        let heartbeat_tx = self.heartbeat_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if heartbeat_tx.send(DaemonEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        // Whatever the resolver already holds is the first metadata.
        self.forward_metadata().await;
        let mut resolver_open = true;

        loop {
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("[core] event channel closed, shutting down");
                        break;
                    }
                    Some(DaemonEvent::Shutdown) => {
                        info!("[core] shutdown requested");
                        break;
                    }
                    Some(DaemonEvent::ClientCommand(cmd)) => {
                        info!("[core] command {:?}", cmd);
                        self.engine.dispatch(cmd.into()).await;
                    }
                    Some(DaemonEvent::HeartbeatTick) => self.heartbeat().await,
                },
                Some(evt) = self.engine_rx.recv() => {
                    self.engine.dispatch(evt).await;
                }
                Some(evt) = self.mpv_rx.recv() => {
                    self.handle_mpv_event(evt).await;
                }
                changed = self.now_playing.changed(), if resolver_open => {
                    if changed.is_ok() {
                        self.forward_metadata().await;
                    } else {
                        resolver_open = false;
                    }
                }
            }
            self.publish_report();
        }

        self.cleanup().await;
        Ok(())
    }

    // ── mpv event handler ─────────────────────────────────────────────────────

    async fn handle_mpv_event(&mut self, evt: MpvEvent) {
        if let Some((obs_id, data)) = evt.as_property_change() {
            match obs_id {
                OBS_CORE_IDLE => {
                    if data.as_bool() == Some(false) {
                        self.backend.mark_playing();
                    }
                }
                OBS_PAUSED_FOR_CACHE => {
                    let buffering = data.as_bool().unwrap_or(false);
                    if buffering && self.status() == ConnectionStatus::Streaming {
                        debug!("[core] mpv buffering");
                        self.stalled_since.get_or_insert_with(Instant::now);
                    } else {
                        self.stalled_since = None;
                    }
                }
                OBS_ICY_TITLE => {
                    let icy = data.as_str().map(str::to_string);
                    if icy != self.last_icy {
                        debug!("[core] icy-title {:?}", icy);
                        self.last_icy = icy;
                    }
                }
                _ => {}
            }
            return;
        }

        match evt.end_file_reason() {
            Some("error") | Some("network") => {
                let reason = end_file_error(&evt.raw);
                self.stream_failed(&reason).await;
            }
            // A live stream never ends on its own.
            Some("eof") => self.stream_failed("stream ended").await,
            Some(other) => debug!("[core] end-file reason={}", other),
            None => {}
        }
    }

    async fn heartbeat(&mut self) {
        if !self.backend.check_alive().await {
            self.stream_failed("mpv exited").await;
            return;
        }
        if let Some(since) = self.stalled_since {
            if since.elapsed() >= STALL_GRACE {
                self.stream_failed("stalled").await;
            }
        }
    }

    async fn stream_failed(&mut self, reason: &str) {
        self.stalled_since = None;
        if self.status() == ConnectionStatus::Idle {
            return;
        }
        warn!("[core] stream failure: {}", reason);
        self.backend.mark_failed(reason);
        let generation = self.engine.generation();
        self.engine
            .dispatch(PlaybackEvent::StreamFailed {
                generation,
                reason: reason.to_string(),
            })
            .await;
    }

    async fn forward_metadata(&mut self) {
        let metadata = self
            .now_playing
            .borrow_and_update()
            .now_playing()
            .map(MediaMetadata::from_track);
        self.engine
            .dispatch(PlaybackEvent::MetadataChanged(metadata))
            .await;
    }

    fn status(&self) -> ConnectionStatus {
        self.engine.session().connection_status
    }

    fn publish_report(&self) {
        let session: PlaybackSession = self.engine.session();
        let mpv = self.backend.health();
        self.report_tx.send_if_modified(|r| {
            if r.session != session || r.mpv != mpv {
                r.session = session;
                r.mpv = mpv;
                true
            } else {
                false
            }
        });
    }

    async fn cleanup(&mut self) {
        info!("[core] cleaning up");
        if self.status() != ConnectionStatus::Idle {
            self.engine.dispatch(PlaybackEvent::Stop).await;
        }
        self.publish_report();
        self.backend.shutdown().await;
    }
}

fn end_file_error(raw: &Value) -> String {
    raw.get("file_error")
        .and_then(Value::as_str)
        .map(|e| format!("mpv: {}", e))
        .unwrap_or_else(|| "mpv: playback error".to_string())
}
