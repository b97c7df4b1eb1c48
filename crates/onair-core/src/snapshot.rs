//! Now-playing snapshots and the holders they live in.
//!
//! Three independent holders feed the resolver's waterfall:
//! - [`ServerSnapshotCache`]: in-process, written by the poller;
//! - [`BootSnapshot`]: injected once at startup (file or value);
//! - [`DurableSnapshotCache`]: JSON file that survives restarts.
//!
//! Each carries its own TTL. A holder older than its TTL is absent.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::resolver::{SnapshotProvider, SnapshotTier};
use crate::track::{self, TrackEvent};

pub const DEFAULT_DURABLE_TTL_SECS: u64 = 5 * 60;

/// Whole-object "what is on air" view. Replaced, never field-merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub now_playing: Option<TrackEvent>,
    #[serde(default)]
    pub recent: Vec<TrackEvent>,
    pub station_name: String,
    pub listener_count: u32,
    pub is_live: bool,
    pub last_update: DateTime<Utc>,
}

impl CachedSnapshot {
    /// Build from a payload and the events already normalized from it
    /// (current first, when the payload had a current object).
    pub fn build(
        payload: &Value,
        events: &[TrackEvent],
        fallback_station_name: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let has_current = payload["current"].is_object();
        let (now_playing, recent) = match events.split_first() {
            Some((first, rest)) if has_current => (Some(first.clone()), rest.to_vec()),
            _ => (None, events.to_vec()),
        };

        let station_name = payload["station"]["name"]
            .as_str()
            .or_else(|| payload["station_name"].as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback_station_name)
            .to_string();

        let is_live = ["is_live", "isLive", "live"]
            .iter()
            .find_map(|k| payload.get(*k).and_then(Value::as_bool))
            .unwrap_or(now_playing.is_some());

        Self {
            now_playing,
            recent,
            station_name,
            listener_count: track::listener_count(payload),
            is_live,
            last_update: now,
        }
    }

    pub fn empty(station_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            now_playing: None,
            recent: Vec::new(),
            station_name: station_name.into(),
            listener_count: 0,
            is_live: false,
            last_update: now,
        }
    }
}

/// On-disk form shared by the durable cache and boot snapshot files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub cached_at: DateTime<Utc>,
    pub snapshot: CachedSnapshot,
}

fn read_envelope(path: &Path) -> Option<SnapshotEnvelope> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<SnapshotEnvelope>(&content) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("[snapshot] ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}

// ── Server cache ──────────────────────────────────────────────────────────────

pub struct ServerSnapshotCache {
    slot: RwLock<Option<SnapshotEnvelope>>,
    ttl: TimeDelta,
}

impl ServerSnapshotCache {
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            slot: RwLock::new(None),
            ttl,
        }
    }

    pub fn replace(&self, snapshot: CachedSnapshot, now: DateTime<Utc>) {
        let envelope = SnapshotEnvelope {
            cached_at: now,
            snapshot,
        };
        match self.slot.write() {
            Ok(mut slot) => *slot = Some(envelope),
            Err(poisoned) => *poisoned.into_inner() = Some(envelope),
        }
    }

    fn envelope(&self) -> Option<SnapshotEnvelope> {
        match self.slot.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SnapshotProvider for ServerSnapshotCache {
    fn tier(&self) -> SnapshotTier {
        SnapshotTier::Server
    }

    fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    fn load(&self, now: DateTime<Utc>) -> Option<(CachedSnapshot, TimeDelta)> {
        self.envelope().map(|e| (e.snapshot, now - e.cached_at))
    }
}

// ── Boot snapshot ─────────────────────────────────────────────────────────────

/// Snapshot handed to the process at startup, the daemon's analogue of a
/// snapshot embedded in an initial page payload.
pub struct BootSnapshot {
    envelope: Option<SnapshotEnvelope>,
    ttl: TimeDelta,
}

impl BootSnapshot {
    pub fn new(snapshot: CachedSnapshot, captured_at: DateTime<Utc>, ttl: TimeDelta) -> Self {
        Self {
            envelope: Some(SnapshotEnvelope {
                cached_at: captured_at,
                snapshot,
            }),
            ttl,
        }
    }

    pub fn absent(ttl: TimeDelta) -> Self {
        Self {
            envelope: None,
            ttl,
        }
    }

    pub fn from_file(path: &Path, ttl: TimeDelta) -> Self {
        let envelope = read_envelope(path);
        if envelope.is_some() {
            debug!("[snapshot] boot snapshot loaded from {}", path.display());
        }
        Self { envelope, ttl }
    }
}

impl SnapshotProvider for BootSnapshot {
    fn tier(&self) -> SnapshotTier {
        SnapshotTier::Boot
    }

    fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    fn load(&self, now: DateTime<Utc>) -> Option<(CachedSnapshot, TimeDelta)> {
        self.envelope
            .as_ref()
            .map(|e| (e.snapshot.clone(), now - e.cached_at))
    }
}

// ── Durable cache ─────────────────────────────────────────────────────────────

/// JSON file cache. Only the poller writes it.
pub struct DurableSnapshotCache {
    path: PathBuf,
    ttl: TimeDelta,
}

impl DurableSnapshotCache {
    pub fn new(path: PathBuf, ttl: TimeDelta) -> Self {
        Self { path, ttl }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the cached snapshot. Written to a sibling temp file and renamed
    /// so readers never see a half-written file.
    pub async fn store(&self, snapshot: &CachedSnapshot, now: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let envelope = SnapshotEnvelope {
            cached_at: now,
            snapshot: snapshot.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl SnapshotProvider for DurableSnapshotCache {
    fn tier(&self) -> SnapshotTier {
        SnapshotTier::Durable
    }

    fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    fn load(&self, now: DateTime<Utc>) -> Option<(CachedSnapshot, TimeDelta)> {
        read_envelope(&self.path).map(|e| (e.snapshot, now - e.cached_at))
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
