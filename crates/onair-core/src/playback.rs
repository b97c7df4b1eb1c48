//! Live stream playback: a pure transition table plus the async engine that
//! carries out its effects.
//!
//! Every play attempt gets a generation number. Stop, pause and failures
//! bump it, so a play result or timer belonging to an abandoned attempt is
//! recognised by its stale generation and dropped. That is what keeps a
//! play request racing a stop from ever surfacing as an error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::track::TrackEvent;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

// ── Session state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Streaming,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSession {
    pub is_playing: bool,
    pub connection_status: ConnectionStatus,
    /// 0.0..=1.0
    pub volume: f32,
    pub is_muted: bool,
    pub reconnect_attempts: u32,
}

impl PlaybackSession {
    pub fn new(volume: f32) -> Self {
        Self {
            is_playing: false,
            connection_status: ConnectionStatus::Idle,
            volume: clamp_volume(volume).unwrap_or(1.0),
            is_muted: false,
            reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Connecting for longer than this counts as a stream failure.
    pub connect_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            connect_timeout: Some(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)),
        }
    }
}

fn clamp_volume(v: f32) -> Option<f32> {
    if v.is_nan() {
        None
    } else {
        Some(v.clamp(0.0, 1.0))
    }
}

// ── Media session ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub artwork_url: Option<String>,
}

impl MediaMetadata {
    pub fn from_track(track: &TrackEvent) -> Self {
        Self {
            title: track.title.clone(),
            artist: track.artist.clone(),
            album: track.album.clone(),
            artwork_url: track.artwork_url.clone(),
        }
    }
}

/// Which transport actions the OS media controls should offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportControls {
    pub play: bool,
    pub pause: bool,
    pub stop: bool,
}

impl TransportControls {
    pub fn for_status(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Idle => Self {
                play: true,
                pause: false,
                stop: false,
            },
            ConnectionStatus::Connecting | ConnectionStatus::Streaming => Self {
                play: false,
                pause: true,
                stop: true,
            },
            ConnectionStatus::Error => Self {
                play: true,
                pause: false,
                stop: true,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSessionUpdate {
    pub metadata: Option<MediaMetadata>,
    pub status: ConnectionStatus,
    pub controls: TransportControls,
}

/// OS-level "now playing" surface.
pub trait MediaSession: Send + Sync {
    fn update(&self, update: &MediaSessionUpdate);
    fn clear(&self);
}

// ── Events and effects ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PlayRejection {
    /// Lost the race against a stop or pause.
    Aborted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Play,
    Pause,
    Stop,
    SetVolume(f32),
    SetMuted(bool),
    PlayStarted { generation: u64 },
    PlayRejected { generation: u64, reason: PlayRejection },
    StreamFailed { generation: u64, reason: String },
    RetryDue { generation: u64 },
    ConnectTimedOut { generation: u64 },
    MetadataChanged(Option<MediaMetadata>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the stream at the live edge and wait for audio.
    Play { generation: u64 },
    /// Drop the connection; any pending play for `generation` or older aborts.
    Release { generation: u64 },
    ScheduleRetry { generation: u64, delay: Duration },
    ArmConnectTimeout { generation: u64, timeout: Duration },
    ApplyVolume { volume: f32, muted: bool },
    UpdateMediaSession(MediaSessionUpdate),
}

// ── State machine ─────────────────────────────────────────────────────────────

pub struct PlaybackMachine {
    session: PlaybackSession,
    policy: RetryPolicy,
    generation: u64,
    metadata: Option<MediaMetadata>,
}

impl PlaybackMachine {
    pub fn new(policy: RetryPolicy, volume: f32) -> Self {
        Self {
            session: PlaybackSession::new(volume),
            policy,
            generation: 0,
            metadata: None,
        }
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.connection_status
    }

    pub fn handle(&mut self, event: PlaybackEvent) -> Vec<Effect> {
        use ConnectionStatus::{Connecting, Idle, Streaming};

        match event {
            PlaybackEvent::Play => match self.status() {
                Idle | ConnectionStatus::Error => {
                    // A manual play always gets the full retry budget.
                    self.session.reconnect_attempts = 0;
                    self.connect()
                }
                Connecting | Streaming => Vec::new(),
            },

            PlaybackEvent::Pause | PlaybackEvent::Stop => match self.status() {
                Idle => Vec::new(),
                Connecting | Streaming | ConnectionStatus::Error => {
                    let old = self.bump();
                    self.session.reconnect_attempts = 0;
                    self.set_status(Idle);
                    vec![Effect::Release { generation: old }, self.media_update()]
                }
            },

            PlaybackEvent::SetVolume(v) => match clamp_volume(v) {
                Some(v) => {
                    self.session.volume = v;
                    vec![self.apply_volume()]
                }
                None => Vec::new(),
            },

            PlaybackEvent::SetMuted(muted) => {
                self.session.is_muted = muted;
                vec![self.apply_volume()]
            }

            PlaybackEvent::PlayStarted { generation } => {
                if generation != self.generation || self.status() != Connecting {
                    return Vec::new();
                }
                self.session.reconnect_attempts = 0;
                self.set_status(Streaming);
                vec![self.media_update()]
            }

            PlaybackEvent::PlayRejected { generation, reason } => {
                if generation != self.generation || self.status() != Connecting {
                    return Vec::new();
                }
                match reason {
                    PlayRejection::Aborted => {
                        self.bump();
                        self.set_status(Idle);
                        vec![self.media_update()]
                    }
                    PlayRejection::Failed(msg) => self.fail(&msg),
                }
            }

            PlaybackEvent::StreamFailed { generation, reason } => {
                if generation != self.generation {
                    return Vec::new();
                }
                match self.status() {
                    Connecting | Streaming => self.fail(&reason),
                    Idle | ConnectionStatus::Error => Vec::new(),
                }
            }

            PlaybackEvent::ConnectTimedOut { generation } => {
                if generation != self.generation || self.status() != Connecting {
                    return Vec::new();
                }
                self.fail("connect timed out")
            }

            PlaybackEvent::RetryDue { generation } => {
                if generation != self.generation || self.status() != ConnectionStatus::Error {
                    return Vec::new();
                }
                self.connect()
            }

            PlaybackEvent::MetadataChanged(metadata) => {
                if self.metadata == metadata {
                    return Vec::new();
                }
                self.metadata = metadata;
                if self.status() == Streaming {
                    vec![self.media_update()]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn connect(&mut self) -> Vec<Effect> {
        self.bump();
        self.set_status(ConnectionStatus::Connecting);
        let mut effects = vec![Effect::Play {
            generation: self.generation,
        }];
        if let Some(timeout) = self.policy.connect_timeout {
            effects.push(Effect::ArmConnectTimeout {
                generation: self.generation,
                timeout,
            });
        }
        effects.push(self.media_update());
        effects
    }

    fn fail(&mut self, reason: &str) -> Vec<Effect> {
        let old = self.bump();
        self.set_status(ConnectionStatus::Error);
        let mut effects = vec![Effect::Release { generation: old }];
        if self.session.reconnect_attempts < self.policy.max_attempts {
            self.session.reconnect_attempts += 1;
            warn!(
                "[playback] stream error ({}), retry {}/{} in {:?}",
                reason,
                self.session.reconnect_attempts,
                self.policy.max_attempts,
                self.policy.delay
            );
            effects.push(Effect::ScheduleRetry {
                generation: self.generation,
                delay: self.policy.delay,
            });
        } else {
            warn!(
                "[playback] stream error ({}), giving up after {} attempts",
                reason, self.session.reconnect_attempts
            );
        }
        effects.push(self.media_update());
        effects
    }

    /// Start a new generation and return the previous one.
    fn bump(&mut self) -> u64 {
        let old = self.generation;
        self.generation += 1;
        old
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.session.connection_status != status {
            debug!(
                "[playback] {:?} -> {:?}",
                self.session.connection_status, status
            );
        }
        self.session.connection_status = status;
        self.session.is_playing = status == ConnectionStatus::Streaming;
    }

    fn apply_volume(&self) -> Effect {
        Effect::ApplyVolume {
            volume: self.session.volume,
            muted: self.session.is_muted,
        }
    }

    fn media_update(&self) -> Effect {
        let status = self.status();
        Effect::UpdateMediaSession(MediaSessionUpdate {
            metadata: self.metadata.clone(),
            status,
            controls: TransportControls::for_status(status),
        })
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

/// The single audio output.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Open the stream for `generation` and ask it to play.
    async fn start(&self, generation: u64) -> Result<()>;

    /// Resolve once audio flows for `generation`. Must return
    /// [`Error::BenignCancellation`] if that generation is released first.
    async fn wait_playing(&self, generation: u64) -> Result<()>;

    /// Tear down the connection. Pending plays of `generation` or older abort.
    async fn release(&self, generation: u64) -> Result<()>;

    async fn set_volume(&self, volume: f32, muted: bool) -> Result<()>;
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct PlaybackEngine {
    machine: PlaybackMachine,
    backend: Arc<dyn StreamBackend>,
    media_session: Arc<dyn MediaSession>,
    events_tx: mpsc::UnboundedSender<PlaybackEvent>,
    session_tx: watch::Sender<PlaybackSession>,
}

impl PlaybackEngine {
    /// Build the engine plus the channel its timers and play tasks report on.
    /// External callers send commands through the same sender.
    pub fn new(
        policy: RetryPolicy,
        volume: f32,
        backend: Arc<dyn StreamBackend>,
        media_session: Arc<dyn MediaSession>,
    ) -> (
        Self,
        mpsc::UnboundedSender<PlaybackEvent>,
        mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let machine = PlaybackMachine::new(policy, volume);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (session_tx, _) = watch::channel(machine.session().clone());
        let engine = Self {
            machine,
            backend,
            media_session,
            events_tx: events_tx.clone(),
            session_tx,
        };
        (engine, events_tx, events_rx)
    }

    pub fn session(&self) -> PlaybackSession {
        self.machine.session().clone()
    }

    pub fn generation(&self) -> u64 {
        self.machine.generation()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSession> {
        self.session_tx.subscribe()
    }

    /// Feed one event through the machine and carry out what it asks for.
    /// Backend commands are awaited in order; only the wait for audio and
    /// the timers run in the background.
    pub async fn dispatch(&mut self, event: PlaybackEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
        let session = self.machine.session().clone();
        self.session_tx.send_if_modified(|current| {
            if *current != session {
                *current = session;
                true
            } else {
                false
            }
        });
    }

    async fn execute(&self, effect: Effect) -> Option<PlaybackEvent> {
        match effect {
            Effect::Play { generation } => {
                info!("[playback] connecting (generation {})", generation);
                if let Err(e) = self.backend.start(generation).await {
                    return Some(PlaybackEvent::PlayRejected {
                        generation,
                        reason: rejection(e),
                    });
                }
                let backend = Arc::clone(&self.backend);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let event = match backend.wait_playing(generation).await {
                        Ok(()) => PlaybackEvent::PlayStarted { generation },
                        Err(e) => PlaybackEvent::PlayRejected {
                            generation,
                            reason: rejection(e),
                        },
                    };
                    let _ = tx.send(event);
                });
                None
            }
            Effect::Release { generation } => {
                if let Err(e) = self.backend.release(generation).await {
                    warn!("[playback] release failed: {}", e);
                }
                None
            }
            Effect::ScheduleRetry { generation, delay } => {
                self.send_after(delay, PlaybackEvent::RetryDue { generation });
                None
            }
            Effect::ArmConnectTimeout {
                generation,
                timeout,
            } => {
                self.send_after(timeout, PlaybackEvent::ConnectTimedOut { generation });
                None
            }
            Effect::ApplyVolume { volume, muted } => {
                if let Err(e) = self.backend.set_volume(volume, muted).await {
                    warn!("[playback] volume change failed: {}", e);
                }
                None
            }
            Effect::UpdateMediaSession(update) => {
                if update.status == ConnectionStatus::Idle {
                    self.media_session.clear();
                } else {
                    self.media_session.update(&update);
                }
                None
            }
        }
    }

    fn send_after(&self, delay: Duration, event: PlaybackEvent) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    /// Owner loop: the engine's only mutator until `cancel` fires.
    pub async fn run(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
        cancel: CancellationToken,
    ) -> Self {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }
        // Shutdown tears the session down.
        if self.machine.status() != ConnectionStatus::Idle {
            self.dispatch(PlaybackEvent::Stop).await;
        }
        self.media_session.clear();
        self
    }
}

fn rejection(e: Error) -> PlayRejection {
    if e.is_benign_cancellation() {
        PlayRejection::Aborted
    } else {
        PlayRejection::Failed(e.to_string())
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
