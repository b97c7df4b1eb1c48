//! Picks the snapshot to show first, then follows the poller forward.
//!
//! Waterfall order is the order of the provider list: the first holder whose
//! snapshot is younger than its own TTL wins. When none qualifies the state
//! is `Loading` until the first network result (or `Unavailable` if that
//! fetch fails).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::snapshot::CachedSnapshot;
use crate::track::TrackEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTier {
    Server,
    Boot,
    Durable,
    Network,
}

/// One holder in the waterfall.
pub trait SnapshotProvider: Send + Sync {
    fn tier(&self) -> SnapshotTier;
    fn ttl(&self) -> TimeDelta;
    /// The held snapshot with its age at `now`, or `None` when empty.
    fn load(&self, now: DateTime<Utc>) -> Option<(CachedSnapshot, TimeDelta)>;
}

/// First provider holding a snapshot strictly younger than its TTL. A
/// snapshot cached in the future has no meaningful age and is skipped.
pub fn resolve(
    providers: &[Arc<dyn SnapshotProvider>],
    now: DateTime<Utc>,
) -> Option<(SnapshotTier, CachedSnapshot)> {
    providers.iter().find_map(|provider| {
        let (snapshot, age) = provider.load(now)?;
        if age < TimeDelta::zero() {
            debug!(
                "[resolver] {:?} snapshot cached {}s in the future, ignored",
                provider.tier(),
                -age.num_seconds()
            );
            None
        } else if age < provider.ttl() {
            Some((provider.tier(), snapshot))
        } else {
            debug!(
                "[resolver] {:?} snapshot expired ({}s old)",
                provider.tier(),
                age.num_seconds()
            );
            None
        }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NowPlayingState {
    Loading,
    Ready {
        source: SnapshotTier,
        snapshot: CachedSnapshot,
    },
    Unavailable,
}

impl NowPlayingState {
    pub fn snapshot(&self) -> Option<&CachedSnapshot> {
        match self {
            Self::Ready { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }

    pub fn now_playing(&self) -> Option<&TrackEvent> {
        self.snapshot().and_then(|s| s.now_playing.as_ref())
    }
}

/// Single source of the published now-playing state.
pub struct NowPlayingResolver {
    tx: watch::Sender<NowPlayingState>,
    revision: AtomicU64,
}

impl NowPlayingResolver {
    pub fn new(providers: &[Arc<dyn SnapshotProvider>], now: DateTime<Utc>) -> Self {
        let initial = match resolve(providers, now) {
            Some((source, snapshot)) => {
                info!("[resolver] initial snapshot from {:?}", source);
                NowPlayingState::Ready { source, snapshot }
            }
            None => {
                info!("[resolver] no fresh snapshot, waiting for first fetch");
                NowPlayingState::Loading
            }
        };
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            revision: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NowPlayingState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> NowPlayingState {
        self.tx.borrow().clone()
    }

    /// Number of accepted updates since construction.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Publish a fresh network snapshot. The first one always replaces a
    /// cached tier; after that, one older than the shown network snapshot
    /// is ignored.
    pub fn advance(&self, snapshot: CachedSnapshot) -> bool {
        let accepted = self.tx.send_if_modified(move |state| {
            if let NowPlayingState::Ready {
                source: SnapshotTier::Network,
                snapshot: shown,
            } = state
            {
                if snapshot.last_update < shown.last_update {
                    return false;
                }
            }
            *state = NowPlayingState::Ready {
                source: SnapshotTier::Network,
                snapshot,
            };
            true
        });
        if accepted {
            self.revision.fetch_add(1, Ordering::SeqCst);
        } else {
            debug!("[resolver] ignored out-of-date snapshot");
        }
        accepted
    }

    /// The first fetch failed. Only `Loading` moves; a shown snapshot stays.
    pub fn mark_fetch_failed(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if matches!(state, NowPlayingState::Loading) {
                *state = NowPlayingState::Unavailable;
                true
            } else {
                false
            }
        })
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
