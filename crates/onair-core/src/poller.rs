//! Change-aware poller.
//!
//! Each tick fetches the feed and compares a cheap fingerprint against the
//! previous one. Only a changed payload is normalized, logged, cached and
//! published. The poller task is the single writer of the fingerprint, the
//! server cache and the durable cache file.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::logger::{BatchSummary, DedupLogger, LogOutcome};
use crate::resolver::NowPlayingResolver;
use crate::snapshot::{CachedSnapshot, DurableSnapshotCache, ServerSnapshotCache};
use crate::track::{self, NormalizerOptions, TrackEvent};
use crate::upstream::NowPlayingSource;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Current title + first recent title. Anything else changing on its own
/// (listener count, artwork) is not worth a downstream cycle.
pub fn fingerprint(payload: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    track::current_title(payload).hash(&mut hasher);
    track::first_recent_title(payload).hash(&mut hasher);
    hasher.finish()
}

// ── Feed ──────────────────────────────────────────────────────────────────────

/// Fetch + normalize + log, shared by the poll loop and the scheduled job.
pub struct PlayFeed {
    source: Arc<dyn NowPlayingSource>,
    logger: Arc<DedupLogger>,
    normalizer: NormalizerOptions,
}

impl PlayFeed {
    pub fn new(
        source: Arc<dyn NowPlayingSource>,
        logger: Arc<DedupLogger>,
        normalizer: NormalizerOptions,
    ) -> Self {
        Self {
            source,
            logger,
            normalizer,
        }
    }

    pub fn normalize(&self, payload: &Value) -> Vec<TrackEvent> {
        track::normalize(payload, &self.normalizer)
    }

    /// One awaited fetch into the server cache before anything is shown, so
    /// the first reader gets the feed as of startup rather than an older
    /// boot or durable copy.
    pub async fn warm(
        &self,
        cache: &ServerSnapshotCache,
        station_name: &str,
        now: DateTime<Utc>,
    ) -> Result<CachedSnapshot> {
        let payload = self.source.fetch_initial().await?;
        let events = self.normalize(&payload);
        let snapshot = CachedSnapshot::build(&payload, &events, station_name, now);
        cache.replace(snapshot.clone(), now);
        debug!("[poller] server cache warmed with {} events", events.len());
        Ok(snapshot)
    }

    /// One full cycle regardless of the fingerprint, awaiting every write.
    pub async fn run_log_cycle(&self, now: DateTime<Utc>) -> Result<BatchSummary> {
        let payload = self.source.fetch().await?;
        let events = self.normalize(&payload);
        let mut summary = BatchSummary::default();
        for event in &events {
            summary.record(&self.logger.log(event, now).await);
        }
        info!(
            "[poller] log cycle: {} logged, {} skipped, {} errors",
            summary.logged, summary.skipped, summary.errors
        );
        Ok(summary)
    }
}

// ── Poller ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    Changed { events: usize },
    Failed(String),
}

pub struct Poller {
    feed: Arc<PlayFeed>,
    resolver: Arc<NowPlayingResolver>,
    server_cache: Arc<ServerSnapshotCache>,
    durable_cache: Option<Arc<DurableSnapshotCache>>,
    station_name: String,
    last_fingerprint: Option<u64>,
    initial_fetch_done: bool,
    log_tasks: JoinSet<LogOutcome>,
    reaped: BatchSummary,
}

impl Poller {
    pub fn new(
        feed: Arc<PlayFeed>,
        resolver: Arc<NowPlayingResolver>,
        server_cache: Arc<ServerSnapshotCache>,
        durable_cache: Option<Arc<DurableSnapshotCache>>,
        station_name: impl Into<String>,
    ) -> Self {
        Self {
            feed,
            resolver,
            server_cache,
            durable_cache,
            station_name: station_name.into(),
            last_fingerprint: None,
            initial_fetch_done: false,
            log_tasks: JoinSet::new(),
            reaped: BatchSummary::default(),
        }
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        self.reap_finished();
        self.feed.logger.evict_idle(now).await;

        // The edge endpoint gets one chance, success or not.
        let fetched = if self.initial_fetch_done {
            self.feed.source.fetch().await
        } else {
            self.initial_fetch_done = true;
            self.feed.source.fetch_initial().await
        };
        let payload = match fetched {
            Ok(p) => p,
            Err(e) => {
                warn!("[poller] fetch failed: {}", e);
                self.resolver.mark_fetch_failed();
                return TickOutcome::Failed(e.to_string());
            }
        };
        let fp = fingerprint(&payload);
        if self.last_fingerprint == Some(fp) {
            debug!("[poller] unchanged");
            return TickOutcome::Unchanged;
        }
        self.last_fingerprint = Some(fp);

        let events = self.feed.normalize(&payload);
        for event in events.iter().cloned() {
            let logger = Arc::clone(&self.feed.logger);
            self.log_tasks
                .spawn(async move { logger.log(&event, now).await });
        }

        let snapshot = CachedSnapshot::build(&payload, &events, &self.station_name, now);
        if let Some(current) = &snapshot.now_playing {
            info!("[poller] now playing {}", current.display());
        }
        self.server_cache.replace(snapshot.clone(), now);
        if let Some(durable) = &self.durable_cache {
            if let Err(e) = durable.store(&snapshot, now).await {
                warn!("[poller] durable cache write failed: {}", e);
            }
        }
        self.resolver.advance(snapshot);

        TickOutcome::Changed {
            events: events.len(),
        }
    }

    /// Await every outstanding log task. Returns the outcomes gathered since
    /// the previous flush.
    pub async fn flush_logs(&mut self) -> BatchSummary {
        while let Some(res) = self.log_tasks.join_next().await {
            Self::record(&mut self.reaped, res);
        }
        std::mem::take(&mut self.reaped)
    }

    fn reap_finished(&mut self) {
        while let Some(Some(res)) = self.log_tasks.join_next().now_or_never() {
            Self::record(&mut self.reaped, res);
        }
    }

    fn record(summary: &mut BatchSummary, res: std::result::Result<LogOutcome, JoinError>) {
        match res {
            Ok(outcome) => {
                if let LogOutcome::Failed(msg) = &outcome {
                    debug!("[poller] log task reported failure: {}", msg);
                }
                summary.record(&outcome);
            }
            Err(e) => {
                warn!("[poller] log task aborted: {}", e);
                summary.errors += 1;
            }
        }
    }

    async fn run(mut self, interval: Duration, cancel: CancellationToken) -> Self {
        info!("[poller] started, interval {}s", interval.as_secs());
        // First tick of an interval completes immediately.
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        let summary = self.flush_logs().await;
        info!(
            "[poller] stopped ({} logged, {} skipped, {} errors since last flush)",
            summary.logged, summary.skipped, summary.errors
        );
        self
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Start/stop lifecycle around a [`Poller`].
pub struct PollerService {
    poller: Option<Poller>,
    interval: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Poller>>,
}

impl PollerService {
    pub fn new(poller: Poller, interval: Duration) -> Self {
        Self {
            poller: Some(poller),
            interval,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the loop. A second call is a no-op and returns false.
    pub fn start(&mut self) -> bool {
        let Some(poller) = self.poller.take() else {
            debug!("[poller] start ignored, already started");
            return false;
        };
        let cancel = self.cancel.clone();
        let interval = self.interval;
        self.handle = Some(tokio::spawn(poller.run(interval, cancel)));
        true
    }

    /// Stop the interval and wait for the loop, including pending log writes.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("[poller] task ended abnormally: {}", e);
            }
        }
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
