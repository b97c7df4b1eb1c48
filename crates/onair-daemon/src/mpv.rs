/// mpv as the single audio output, driven over its JSON IPC socket.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← MpvRequest via mpsc → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── response (request_id) → matching oneshot
///                                └── event / property-change → event_tx
/// ```
///
/// `MpvStreamBackend` wraps the driver behind the core `StreamBackend`
/// trait. The daemon core feeds observed mpv state back into it
/// (`mark_playing`, `mark_failed`) so pending `wait_playing` calls resolve.
///
/// Platform notes:
/// - Unix:    Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use onair_core::platform;
use onair_core::playback::StreamBackend;
use onair_core::protocol::MpvHealth;
use onair_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSED_FOR_CACHE: u64 = 2;
pub const OBS_ICY_TITLE: u64 = 3;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line, '\n' terminated
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Unsolicited mpv event or property change.
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn end_file_reason(&self) -> Option<&str> {
        if self.event_name()? == "end-file" {
            self.raw.get("reason")?.as_str()
        } else {
            None
        }
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_stream(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        self.send(json!(["set_property", "pause", false])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32, muted: bool) -> anyhow::Result<()> {
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        self.send(json!(["set_property", "mute", muted])).await?;
        Ok(())
    }

    /// Must be re-issued on every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
            (OBS_ICY_TITLE, "metadata/by-key/icy-title"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("[mpv] observe_property id={} name={}", id, name),
                Err(e) => warn!("[mpv] observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            process: None,
            last_volume: volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        info!("[mpv] spawning new process");
        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--cache=yes")
            .arg(platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process()?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("[mpv] connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("[mpv] connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("[mpv] reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("[mpv] reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            debug!("[mpv] reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    debug!("[mpv] reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("[mpv] reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("[mpv] writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("[mpv] writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("[mpv] writer: task exiting");
}

// ── StreamBackend ─────────────────────────────────────────────────────────────

/// What the core has observed about the current attempt.
#[derive(Debug, Clone, Default, PartialEq)]
struct AttemptSignal {
    /// Generation of the most recent `start`.
    active: u64,
    /// Highest released generation.
    released: u64,
    playing: bool,
    failure: Option<String>,
}

struct Connection {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    volume: f32,
    muted: bool,
}

pub struct MpvStreamBackend {
    stream_url: String,
    conn: Mutex<Connection>,
    signal: watch::Sender<AttemptSignal>,
    health: watch::Sender<MpvHealth>,
    event_tx: mpsc::Sender<MpvEvent>,
}

impl MpvStreamBackend {
    pub fn new(stream_url: String, volume: f32, event_tx: mpsc::Sender<MpvEvent>) -> Self {
        let (signal, _) = watch::channel(AttemptSignal::default());
        let (health, _) = watch::channel(MpvHealth::Absent);
        Self {
            stream_url,
            conn: Mutex::new(Connection {
                driver: MpvDriver::new(volume),
                handle: None,
                volume,
                muted: false,
            }),
            signal,
            health,
            event_tx,
        }
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    pub fn health(&self) -> MpvHealth {
        self.health.borrow().clone()
    }

    /// `core-idle` went false: audio is flowing for the active attempt.
    pub fn mark_playing(&self) {
        self.signal.send_if_modified(|s| {
            let changed = !s.playing;
            s.playing = true;
            changed
        });
    }

    pub fn mark_failed(&self, reason: &str) {
        let reason = reason.to_string();
        self.signal.send_modify(|s| {
            s.playing = false;
            s.failure = Some(reason);
        });
    }

    /// False (and health Dead) if the process died since the last check.
    pub async fn check_alive(&self) -> bool {
        let mut conn = self.conn.lock().await;
        if conn.handle.is_none() {
            return true;
        }
        if conn.driver.process_alive() {
            return true;
        }
        warn!("[mpv] process died");
        conn.handle = None;
        self.set_health(MpvHealth::Dead);
        false
    }

    pub async fn shutdown(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(h) = conn.handle.take() {
            let _ = h.send(json!(["quit"])).await;
        }
        conn.driver.kill().await;
        self.set_health(MpvHealth::Absent);
    }

    fn set_health(&self, health: MpvHealth) {
        self.health.send_if_modified(|h| {
            if *h != health {
                info!("[mpv] health {:?} -> {:?}", h, health);
                *h = health;
                true
            } else {
                false
            }
        });
    }

    async fn ensure_handle(&self, conn: &mut Connection) -> anyhow::Result<MpvHandle> {
        if conn.handle.is_some() && !conn.driver.process_alive() {
            warn!("[mpv] process died, respawning");
            conn.handle = None;
        }
        if let Some(h) = &conn.handle {
            return Ok(h.clone());
        }

        self.set_health(MpvHealth::Starting);
        conn.driver.last_volume = conn.volume;
        let handle = match conn.driver.spawn_and_connect(self.event_tx.clone()).await {
            Ok(h) => h,
            Err(e) => {
                self.set_health(MpvHealth::Dead);
                return Err(e);
            }
        };
        handle.observe_all_properties().await;
        if conn.muted {
            let _ = handle.set_volume(conn.volume, true).await;
        }
        self.set_health(MpvHealth::Running);
        conn.handle = Some(handle.clone());
        Ok(handle)
    }
}

fn interrupted(e: anyhow::Error) -> Error {
    Error::StreamInterrupted(e.to_string())
}

#[async_trait]
impl StreamBackend for MpvStreamBackend {
    async fn start(&self, generation: u64) -> Result<()> {
        if self.stream_url.is_empty() {
            return Err(Error::Config("playback.stream_url is not set".into()));
        }
        self.signal.send_modify(|s| {
            s.active = generation;
            s.playing = false;
            s.failure = None;
        });
        let mut conn = self.conn.lock().await;
        let handle = self.ensure_handle(&mut conn).await.map_err(interrupted)?;
        if self.signal.borrow().released >= generation {
            return Err(Error::BenignCancellation);
        }
        handle.load_stream(&self.stream_url).await.map_err(interrupted)
    }

    async fn wait_playing(&self, generation: u64) -> Result<()> {
        let mut rx = self.signal.subscribe();
        let outcome = match rx
            .wait_for(|s| {
                s.released >= generation
                    || s.active != generation
                    || s.playing
                    || s.failure.is_some()
            })
            .await
        {
            Ok(s) if s.released >= generation || s.active != generation => {
                Err(Error::BenignCancellation)
            }
            Ok(s) => match &s.failure {
                Some(reason) => Err(Error::StreamInterrupted(reason.clone())),
                None => Ok(()),
            },
            Err(_) => Err(Error::BenignCancellation),
        };
        outcome
    }

    async fn release(&self, generation: u64) -> Result<()> {
        self.signal.send_modify(|s| {
            s.released = s.released.max(generation);
            s.playing = false;
        });
        let conn = self.conn.lock().await;
        if let Some(h) = &conn.handle {
            h.stop().await.map_err(interrupted)?;
        }
        Ok(())
    }

    async fn set_volume(&self, volume: f32, muted: bool) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.volume = volume;
        conn.muted = muted;
        conn.driver.last_volume = volume;
        if let Some(h) = &conn.handle {
            h.set_volume(volume, muted).await.map_err(interrupted)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_change_parsing() {
        let evt = MpvEvent {
            raw: json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": false}),
        };
        let (id, data) = evt.as_property_change().unwrap();
        assert_eq!(id, OBS_CORE_IDLE);
        assert_eq!(data.as_bool(), Some(false));
        assert!(evt.end_file_reason().is_none());
    }

    #[test]
    fn test_end_file_reason() {
        let evt = MpvEvent {
            raw: json!({"event": "end-file", "reason": "network"}),
        };
        assert_eq!(evt.end_file_reason(), Some("network"));
    }

    #[tokio::test]
    async fn test_release_aborts_pending_wait() {
        let (tx, _rx) = mpsc::channel(4);
        let backend = Arc::new(MpvStreamBackend::new("http://x".into(), 0.5, tx));
        backend.signal.send_modify(|s| s.active = 3);
        let waiter = {
            let b = backend.clone();
            tokio::spawn(async move { b.wait_playing(3).await })
        };
        backend.release(3).await.unwrap();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::BenignCancellation)
        ));
    }

    #[tokio::test]
    async fn test_mark_playing_resolves_wait() {
        let (tx, _rx) = mpsc::channel(4);
        let backend = Arc::new(MpvStreamBackend::new("http://x".into(), 0.5, tx));
        backend.signal.send_modify(|s| s.active = 1);
        let waiter = {
            let b = backend.clone();
            tokio::spawn(async move { b.wait_playing(1).await })
        };
        backend.mark_playing();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failure_resolves_wait_with_interruption() {
        let (tx, _rx) = mpsc::channel(4);
        let backend = MpvStreamBackend::new("http://x".into(), 0.5, tx);
        backend.signal.send_modify(|s| s.active = 1);
        backend.mark_failed("network");
        assert!(matches!(
            backend.wait_playing(1).await,
            Err(Error::StreamInterrupted(_))
        ));
    }
}
