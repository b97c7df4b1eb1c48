//! Persisted play history.
//!
//! The store is append-only and enforces uniqueness on
//! `(title, artist, play_started_at)`; racing writers therefore never create
//! true duplicates, they get [`Error::DuplicateWrite`] back instead.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::track::{self, TrackEvent};

// ── Public types ──────────────────────────────────────────────────────────────

/// One durable history row. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPlay {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub play_started_at: DateTime<Utc>,
    pub duration_secs: Option<u32>,
    pub album_art_url: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub artwork_id: Option<String>,
    pub listeners_count: u32,
    pub inserted_at: DateTime<Utc>,
}

impl PersistedPlay {
    pub fn from_event(
        event: &TrackEvent,
        play_started_at: DateTime<Utc>,
        inserted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            title: event.title.clone(),
            artist: event.artist.clone(),
            album: event.album.clone(),
            play_started_at,
            duration_secs: event.duration_secs,
            album_art_url: event.artwork_url.clone(),
            genre: event.genre.clone(),
            year: event.year,
            artwork_id: event.artwork_id.clone(),
            listeners_count: event.listener_count,
            inserted_at,
        }
    }

    pub fn dedup_key(&self) -> String {
        track::dedup_key(&self.artist, &self.title)
    }

    fn duplicate_error(&self) -> Error {
        Error::DuplicateWrite {
            title: self.title.clone(),
            artist: self.artist.clone(),
            play_started_at: iso(&self.play_started_at),
        }
    }
}

/// Read filter. Rows always come back most-recent-first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive substring match on title or artist.
    pub search: Option<String>,
    /// 0 means the store default.
    pub limit: usize,
}

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

impl HistoryQuery {
    fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_HISTORY_LIMIT
        } else {
            self.limit
        }
    }

    fn matches(&self, play: &PersistedPlay) -> bool {
        if self.since.is_some_and(|s| play.play_started_at < s) {
            return false;
        }
        if self.until.is_some_and(|u| play.play_started_at > u) {
            return false;
        }
        match self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(needle) => {
                let needle = needle.to_lowercase();
                play.title.to_lowercase().contains(&needle)
                    || play.artist.to_lowercase().contains(&needle)
            }
            None => true,
        }
    }
}

/// Generic insert/query surface over the history backend.
#[async_trait]
pub trait PlayStore: Send + Sync {
    /// Insert one play. A uniqueness violation is reported as
    /// [`Error::DuplicateWrite`]; anything else as
    /// [`Error::TransientWriteFailure`].
    async fn insert(&self, play: &PersistedPlay) -> Result<()>;

    async fn query(&self, query: &HistoryQuery) -> Result<Vec<PersistedPlay>>;
}

pub fn iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Process-local store with the same uniqueness rule as the SQLite one.
#[derive(Default)]
pub struct MemoryPlayStore {
    rows: tokio::sync::Mutex<Vec<PersistedPlay>>,
    insert_attempts: AtomicUsize,
}

impl MemoryPlayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `insert` calls, successful or not.
    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub async fn rows(&self) -> Vec<PersistedPlay> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl PlayStore for MemoryPlayStore {
    async fn insert(&self, play: &PersistedPlay) -> Result<()> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().await;
        let exists = rows.iter().any(|r| {
            r.title == play.title
                && r.artist == play.artist
                && r.play_started_at == play.play_started_at
        });
        if exists {
            return Err(play.duplicate_error());
        }
        rows.push(play.clone());
        Ok(())
    }

    async fn query(&self, query: &HistoryQuery) -> Result<Vec<PersistedPlay>> {
        let rows = self.rows.lock().await;
        let mut out: Vec<PersistedPlay> =
            rows.iter().filter(|p| query.matches(p)).cloned().collect();
        out.sort_by(|a, b| b.play_started_at.cmp(&a.play_started_at));
        out.truncate(query.effective_limit());
        Ok(out)
    }
}

// ── SQLite store ──────────────────────────────────────────────────────────────

/// SQLite-backed history. The connection is used from blocking tasks only.
pub struct SqlitePlayStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePlayStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| Error::write_failure(e.to_string()))?;
        info!("[store] opened play history at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::write_failure(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        initialize_schema(&conn).map_err(|e| Error::write_failure(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::write_failure("sqlite connection poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| Error::write_failure(format!("store task failed: {}", e)))?
    }
}

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS plays (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            artist TEXT NOT NULL,
            album TEXT,
            play_started_at TEXT NOT NULL,
            duration INTEGER,
            album_art_url TEXT,
            genre TEXT,
            year INTEGER,
            artwork_id TEXT,
            listeners_count INTEGER NOT NULL DEFAULT 0,
            inserted_at TEXT NOT NULL,
            UNIQUE(title, artist, play_started_at)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plays_started ON plays(play_started_at DESC)",
        [],
    )?;
    Ok(())
}

#[async_trait]
impl PlayStore for SqlitePlayStore {
    async fn insert(&self, play: &PersistedPlay) -> Result<()> {
        let play = play.clone();
        self.with_conn(move |conn| {
            let res = conn.execute(
                "INSERT INTO plays (title, artist, album, play_started_at, duration,
                    album_art_url, genre, year, artwork_id, listeners_count, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    play.title,
                    play.artist,
                    play.album,
                    iso(&play.play_started_at),
                    play.duration_secs,
                    play.album_art_url,
                    play.genre,
                    play.year,
                    play.artwork_id,
                    play.listeners_count,
                    iso(&play.inserted_at),
                ],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    debug!("[store] unique constraint hit for {}", play.dedup_key());
                    Err(play.duplicate_error())
                }
                Err(e) => Err(Error::write_failure(e.to_string())),
            }
        })
        .await
    }

    async fn query(&self, query: &HistoryQuery) -> Result<Vec<PersistedPlay>> {
        let since = query.since.as_ref().map(iso);
        let until = query.until.as_ref().map(iso);
        let like = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));
        let limit = query.effective_limit() as i64;

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT title, artist, album, play_started_at, duration, album_art_url,
                            genre, year, artwork_id, listeners_count, inserted_at
                     FROM plays
                     WHERE (?1 IS NULL OR play_started_at >= ?1)
                       AND (?2 IS NULL OR play_started_at <= ?2)
                       AND (?3 IS NULL OR title LIKE ?3 ESCAPE '\\' OR artist LIKE ?3 ESCAPE '\\')
                     ORDER BY play_started_at DESC, id DESC
                     LIMIT ?4",
                )
                .map_err(|e| Error::write_failure(e.to_string()))?;
            let rows = stmt
                .query_map(params![since, until, like, limit], |row| {
                    Ok(PersistedPlay {
                        title: row.get(0)?,
                        artist: row.get(1)?,
                        album: row.get(2)?,
                        play_started_at: parse_ts(3, &row.get::<_, String>(3)?)?,
                        duration_secs: row.get(4)?,
                        album_art_url: row.get(5)?,
                        genre: row.get(6)?,
                        year: row.get(7)?,
                        artwork_id: row.get(8)?,
                        listeners_count: row.get(9)?,
                        inserted_at: parse_ts(10, &row.get::<_, String>(10)?)?,
                    })
                })
                .map_err(|e| Error::write_failure(e.to_string()))?;

            let mut plays = Vec::new();
            for row in rows {
                plays.push(row.map_err(|e| Error::write_failure(e.to_string()))?);
            }
            Ok(plays)
        })
        .await
    }
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

// ── tests ─────────────────────────────────────────────────────────────────────
