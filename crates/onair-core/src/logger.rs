//! Deduplicating play logger.
//!
//! The store's uniqueness constraint is the ground truth for "already
//! logged". The in-memory suppression window only avoids write attempts when
//! the poller keeps observing the same upstream state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{PersistedPlay, PlayStore};
use crate::timezone;
use crate::track::TrackEvent;

pub const DEFAULT_SUPPRESS_WINDOW_SECS: u64 = 3 * 60;
pub const DEFAULT_IDLE_EVICT_SECS: u64 = 15 * 60;

/// What happened to one event handed to [`DedupLogger::log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    Logged,
    /// Another writer got there first.
    Duplicate,
    /// Inside the suppression window; the store was not called.
    Suppressed,
    /// Nothing to persist (e.g. no play timestamp).
    Skipped(String),
    Failed(String),
}

/// `{logged, skipped, errors}` over a batch of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub logged: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: &LogOutcome) {
        match outcome {
            LogOutcome::Logged => self.logged += 1,
            LogOutcome::Duplicate | LogOutcome::Suppressed | LogOutcome::Skipped(_) => {
                self.skipped += 1
            }
            LogOutcome::Failed(_) => self.errors += 1,
        }
    }
}

impl<'a> FromIterator<&'a LogOutcome> for BatchSummary {
    fn from_iter<I: IntoIterator<Item = &'a LogOutcome>>(iter: I) -> Self {
        let mut summary = Self::default();
        for outcome in iter {
            summary.record(outcome);
        }
        summary
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoggerSettings {
    pub source_zone: Tz,
    pub suppress_window: TimeDelta,
    pub idle_evict: TimeDelta,
}

impl LoggerSettings {
    pub fn new(source_zone: Tz) -> Self {
        Self {
            source_zone,
            suppress_window: TimeDelta::seconds(DEFAULT_SUPPRESS_WINDOW_SECS as i64),
            idle_evict: TimeDelta::seconds(DEFAULT_IDLE_EVICT_SECS as i64),
        }
    }
}

pub struct DedupLogger {
    store: Arc<dyn PlayStore>,
    settings: LoggerSettings,
    /// dedup key → wall-clock time of the last confirmed write.
    suppression: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DedupLogger {
    pub fn new(store: Arc<dyn PlayStore>, settings: LoggerSettings) -> Self {
        Self {
            store,
            settings,
            suppression: Mutex::new(HashMap::new()),
        }
    }

    pub async fn should_log(&self, event: &TrackEvent, now: DateTime<Utc>) -> bool {
        let map = self.suppression.lock().await;
        self.window_open(map.get(&event.dedup_key()), now)
    }

    fn window_open(&self, last: Option<&DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last {
            Some(last) => now - *last >= self.settings.suppress_window,
            None => true,
        }
    }

    /// Persist `event` unless it is inside the suppression window. Store
    /// errors come back as [`LogOutcome::Failed`]; they never escape as `Err`.
    ///
    /// The key is reserved at `now` under the same lock as the window check,
    /// so overlapping calls for one key attempt at most one write. The
    /// reservation is rolled back when nothing reached the store.
    pub async fn log(&self, event: &TrackEvent, now: DateTime<Utc>) -> LogOutcome {
        let key = event.dedup_key();
        let previous = {
            let mut map = self.suppression.lock().await;
            if !self.window_open(map.get(&key), now) {
                debug!("[logger] suppressed {}", event.display());
                return LogOutcome::Suppressed;
            }
            map.insert(key.clone(), now)
        };

        let outcome = self.persist(event, now).await;
        if matches!(outcome, LogOutcome::Skipped(_) | LogOutcome::Failed(_)) {
            self.release(&key, now, previous).await;
        }
        outcome
    }

    async fn persist(&self, event: &TrackEvent, now: DateTime<Utc>) -> LogOutcome {
        let Some(local) = event.play_started_at else {
            debug!("[logger] {} has no play timestamp, skipping", event.display());
            return LogOutcome::Skipped("missing play timestamp".into());
        };

        let started = match timezone::source_local_to_utc(local, self.settings.source_zone) {
            Ok(t) => t,
            Err(e) => {
                warn!("[logger] {}: {}", event.display(), e);
                return LogOutcome::Failed(e.to_string());
            }
        };

        let play = PersistedPlay::from_event(event, started, now);
        match self.store.insert(&play).await {
            Ok(()) => {
                info!("[logger] logged {} started {}", event.display(), started);
                LogOutcome::Logged
            }
            Err(e) if e.is_duplicate() => {
                debug!("[logger] {} already in store", event.display());
                LogOutcome::Duplicate
            }
            Err(e) => {
                warn!("[logger] write failed for {}: {}", event.display(), e);
                LogOutcome::Failed(e.to_string())
            }
        }
    }

    /// Undo our reservation unless a later call has replaced it.
    async fn release(&self, key: &str, reserved_at: DateTime<Utc>, previous: Option<DateTime<Utc>>) {
        let mut map = self.suppression.lock().await;
        if map.get(key) != Some(&reserved_at) {
            return;
        }
        match previous {
            Some(last) => {
                map.insert(key.to_string(), last);
            }
            None => {
                map.remove(key);
            }
        }
    }

    /// Drop suppression entries idle longer than the eviction window.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.suppression.lock().await;
        let before = map.len();
        map.retain(|_, last| now - *last <= self.settings.idle_evict);
        let evicted = before - map.len();
        if evicted > 0 {
            debug!("[logger] evicted {} idle suppression entries", evicted);
        }
        evicted
    }

    pub async fn tracked_keys(&self) -> usize {
        self.suppression.lock().await.len()
    }

}

// ── tests ─────────────────────────────────────────────────────────────────────
