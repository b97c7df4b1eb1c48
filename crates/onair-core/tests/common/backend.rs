use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use onair_core::playback::{MediaSession, MediaSessionUpdate, StreamBackend};
use onair_core::{Error, Result};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub enum StartMode {
    /// Audio flows as soon as it is asked for.
    Immediate,
    /// Never starts on its own; only a release ends the wait.
    UntilReleased,
    Fail(String),
}

/// Stand-in for the audio output. Mirrors the contract real backends keep:
/// a release aborts any pending play of that generation or older.
pub struct FakeBackend {
    mode: Mutex<StartMode>,
    released: watch::Sender<u64>,
    starts: AtomicUsize,
    releases: AtomicUsize,
    volume: Mutex<Option<(f32, bool)>>,
}

impl FakeBackend {
    pub fn new(mode: StartMode) -> Self {
        let (released, _) = watch::channel(0);
        Self {
            mode: Mutex::new(mode),
            released,
            starts: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            volume: Mutex::new(None),
        }
    }

    pub fn set_mode(&self, mode: StartMode) {
        *self.mode.lock().expect("mode lock") = mode;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> Option<(f32, bool)> {
        *self.volume.lock().expect("volume lock")
    }
}

#[async_trait]
impl StreamBackend for FakeBackend {
    async fn start(&self, _generation: u64) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_playing(&self, generation: u64) -> Result<()> {
        let mode = self.mode.lock().expect("mode lock").clone();
        match mode {
            StartMode::Immediate => Ok(()),
            StartMode::Fail(msg) => Err(Error::StreamInterrupted(msg)),
            StartMode::UntilReleased => {
                let mut rx = self.released.subscribe();
                let _released = rx.wait_for(|r| *r >= generation).await.is_ok();
                Err(Error::BenignCancellation)
            }
        }
    }

    async fn release(&self, generation: u64) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.released.send_modify(|r| *r = (*r).max(generation));
        Ok(())
    }

    async fn set_volume(&self, volume: f32, muted: bool) -> Result<()> {
        *self.volume.lock().expect("volume lock") = Some((volume, muted));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSession {
    updates: Mutex<Vec<MediaSessionUpdate>>,
    clears: AtomicUsize,
}

impl RecordingSession {
    pub fn updates(&self) -> Vec<MediaSessionUpdate> {
        self.updates.lock().expect("updates lock").clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl MediaSession for RecordingSession {
    fn update(&self, update: &MediaSessionUpdate) {
        self.updates.lock().expect("updates lock").push(update.clone());
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}
