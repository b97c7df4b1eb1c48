//! Upstream payload → [`TrackEvent`] normalization.
//!
//! The feed is a loosely typed JSON object:
//!
//! ```text
//! { "current": { "TITLE", "ARTIST", "ALBUM", "LASTPLAYED", "DURATION",
//!                "ARTWORK_ID", "GENRE", "YEAR", "LISTENERS"? },
//!   "recent":  [ { same fields }, ... ],
//!   "listeners": 42 | "42" | { "current": 42 } }
//! ```
//!
//! Any field may be missing or carry the wrong JSON type. Timestamps are
//! source-local wall-clock strings without a zone marker; turning them into
//! instants is the logger's job, not ours.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const UNKNOWN_TITLE: &str = "Unknown";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

const SOURCE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

// ── Public types ──────────────────────────────────────────────────────────────

/// One observation of a played track, as seen by one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEvent {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    /// Wall-clock start in the upstream's own timezone.
    pub play_started_at: Option<NaiveDateTime>,
    pub duration_secs: Option<u32>,
    pub artwork_url: Option<String>,
    pub artwork_id: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub listener_count: u32,
}

impl TrackEvent {
    /// Minimal event with every optional field empty.
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: None,
            play_started_at: None,
            duration_secs: None,
            artwork_url: None,
            artwork_id: None,
            genre: None,
            year: None,
            listener_count: 0,
        }
    }

    pub fn dedup_key(&self) -> String {
        dedup_key(&self.artist, &self.title)
    }

    /// "Artist – Title" for logs and the media session.
    pub fn display(&self) -> String {
        format!("{} \u{2013} {}", self.artist, self.title)
    }
}

/// Dedup identity of a play. The same pair legitimately recurs hours apart,
/// so this is only meaningful together with a time window.
pub fn dedup_key(artist: &str, title: &str) -> String {
    format!("{}|{}", artist.to_lowercase(), title.to_lowercase())
}

#[derive(Debug, Clone)]
pub struct NormalizerOptions {
    /// Base URL for `{base}/artwork/{id}/{station_id}.jpg`.
    pub artwork_base: String,
    pub station_id: String,
    /// Static artwork link used when the feed has no artwork id.
    pub generic_artwork_url: String,
    /// Upper bound on recent entries taken from one payload.
    pub max_recent: usize,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            artwork_base: String::new(),
            station_id: String::new(),
            generic_artwork_url: String::new(),
            max_recent: 10,
        }
    }
}

// ── Normalization ─────────────────────────────────────────────────────────────

/// All events in one payload: the current track first, then recent tracks in
/// feed order. Recent entries repeating the current play are folded away.
pub fn normalize(payload: &Value, opts: &NormalizerOptions) -> Vec<TrackEvent> {
    let listeners = listener_count(payload);
    let mut events: Vec<TrackEvent> = Vec::new();

    if let Some(current) = parse_entry(&payload["current"], listeners, opts) {
        events.push(current);
    }

    for entry in recent_entries(payload).iter().take(opts.max_recent) {
        let Some(event) = parse_entry(entry, listeners, opts) else {
            continue;
        };
        let repeat = events.iter().any(|e| {
            e.play_started_at == event.play_started_at && e.dedup_key() == event.dedup_key()
        });
        if !repeat {
            events.push(event);
        }
    }
    events
}

/// Listener count from the top level or the current object; anything that
/// is not a non-negative number becomes 0.
pub fn listener_count(payload: &Value) -> u32 {
    ["listeners", "LISTENERS", "listener_count"]
        .iter()
        .find_map(|k| payload.get(*k))
        .or_else(|| payload["current"].get("LISTENERS"))
        .map(coerce_count)
        .unwrap_or(0)
}

pub fn coerce_count(value: &Value) -> u32 {
    let n = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            })
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<u64>().unwrap_or(0),
        Value::Object(map) => return map.get("current").map(coerce_count).unwrap_or(0),
        _ => 0,
    };
    n.min(u32::MAX as u64) as u32
}

/// Title of the current track, used for change fingerprinting.
pub fn current_title(payload: &Value) -> Option<String> {
    text(&payload["current"], &["TITLE", "title"])
}

/// Title of the newest recent entry, used for change fingerprinting.
pub fn first_recent_title(payload: &Value) -> Option<String> {
    recent_entries(payload)
        .first()
        .and_then(|entry| text(entry, &["TITLE", "title"]))
}

fn recent_entries(payload: &Value) -> &[Value] {
    ["recent", "RECENT", "history"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn parse_entry(entry: &Value, listeners: u32, opts: &NormalizerOptions) -> Option<TrackEvent> {
    if !entry.is_object() {
        return None;
    }

    let title = text(entry, &["TITLE", "title"]).unwrap_or_else(|| UNKNOWN_TITLE.to_string());
    let artist = text(entry, &["ARTIST", "artist"]).unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
    let artwork_id = text(entry, &["ARTWORK_ID", "PICTURE", "artwork_id"]);
    let artwork_url = artwork_url(artwork_id.as_deref(), &artist, &title, opts);

    Some(TrackEvent {
        album: text(entry, &["ALBUM", "album"]),
        play_started_at: text(entry, &["LASTPLAYED", "lastplayed", "started_at"])
            .and_then(|s| parse_source_timestamp(&s)),
        duration_secs: text(entry, &["DURATION", "duration"]).and_then(|s| parse_duration(&s)),
        genre: text(entry, &["GENRE", "genre"]),
        year: text(entry, &["YEAR", "year"]).and_then(|s| parse_year(&s)),
        artwork_url,
        artwork_id,
        listener_count: listeners,
        title,
        artist,
    })
}

/// String or number field, trimmed; empty strings count as missing.
fn text(entry: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match entry.get(*k)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn parse_source_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    SOURCE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// "215", "215.4", "3:35" or "1:02:03" → seconds.
pub fn parse_duration(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.contains(':') {
        let mut total: u32 = 0;
        for part in raw.split(':') {
            let v: u32 = part.trim().parse().ok()?;
            total = total.checked_mul(60)?.checked_add(v)?;
        }
        return Some(total).filter(|t| *t > 0);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && *f > 0.0)
        .map(|f| f as u32)
}

fn parse_year(raw: &str) -> Option<i32> {
    raw.parse::<i32>()
        .ok()
        .or_else(|| raw.get(..4).and_then(|y| y.parse().ok()))
        .filter(|y| *y > 0)
}

/// Deterministic artwork link when the feed names an artwork id; otherwise the
/// generic link with an `{artist}-{title}` key so clients don't reuse a cached
/// image across tracks.
pub fn artwork_url(
    artwork_id: Option<&str>,
    artist: &str,
    title: &str,
    opts: &NormalizerOptions,
) -> Option<String> {
    if let Some(id) = artwork_id {
        if !opts.artwork_base.is_empty() {
            return Some(format!(
                "{}/artwork/{}/{}.jpg",
                opts.artwork_base.trim_end_matches('/'),
                id,
                opts.station_id
            ));
        }
    }
    if opts.generic_artwork_url.is_empty() {
        return None;
    }
    let sep = if opts.generic_artwork_url.contains('?') { '&' } else { '?' };
    Some(format!(
        "{}{}key={}",
        opts.generic_artwork_url,
        sep,
        urlencoding::encode(&format!("{}-{}", artist, title))
    ))
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts() -> NormalizerOptions {
        NormalizerOptions {
            artwork_base: "https://cdn.example.net/".into(),
            station_id: "kxyz".into(),
            generic_artwork_url: "https://cdn.example.net/generic.jpg".into(),
            max_recent: 3,
        }
    }

    #[test]
    fn test_normalize_current_and_recent() {
        let payload = json!({
            "current": {
                "TITLE": "Song A", "ARTIST": "Band X", "ALBUM": "First",
                "LASTPLAYED": "2026-02-26 03:22:12", "DURATION": "3:35",
                "ARTWORK_ID": 991, "GENRE": "Rock", "YEAR": "1998"
            },
            "recent": [
                { "TITLE": "Song B", "ARTIST": "Band Y", "LASTPLAYED": "2026-02-26 03:18:40" }
            ],
            "listeners": 17
        });
        let events = normalize(&payload, &opts());
        assert_eq!(events.len(), 2);

        let a = &events[0];
        assert_eq!(a.title, "Song A");
        assert_eq!(a.artist, "Band X");
        assert_eq!(a.album.as_deref(), Some("First"));
        assert_eq!(a.duration_secs, Some(215));
        assert_eq!(a.year, Some(1998));
        assert_eq!(a.listener_count, 17);
        assert_eq!(
            a.play_started_at,
            parse_source_timestamp("2026-02-26 03:22:12")
        );
        assert_eq!(
            a.artwork_url.as_deref(),
            Some("https://cdn.example.net/artwork/991/kxyz.jpg")
        );
        assert_eq!(events[1].title, "Song B");
    }

    #[test]
    fn test_missing_fields_are_defaulted() {
        let payload = json!({ "current": { "LASTPLAYED": "2026-02-26 03:22:12" } });
        let events = normalize(&payload, &NormalizerOptions::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, UNKNOWN_TITLE);
        assert_eq!(events[0].artist, UNKNOWN_ARTIST);
        assert_eq!(events[0].listener_count, 0);
        assert!(events[0].artwork_url.is_none());
    }

    #[test]
    fn test_tolerates_missing_and_malformed_structure() {
        assert!(normalize(&json!({}), &opts()).is_empty());
        assert!(normalize(&json!(null), &opts()).is_empty());
        let payload = json!({ "current": "oops", "recent": "not a list" });
        assert!(normalize(&payload, &opts()).is_empty());
        let payload = json!({ "recent": [null, 3, { "TITLE": "Only" }] });
        let events = normalize(&payload, &opts());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Only");
    }

    #[test]
    fn test_listener_count_coercion() {
        assert_eq!(listener_count(&json!({ "listeners": "12" })), 12);
        assert_eq!(listener_count(&json!({ "listeners": "n/a" })), 0);
        assert_eq!(listener_count(&json!({ "listeners": -4 })), 0);
        assert_eq!(listener_count(&json!({ "listeners": 8.9 })), 8);
        assert_eq!(listener_count(&json!({ "listeners": { "current": 5 } })), 5);
        assert_eq!(listener_count(&json!({ "current": { "LISTENERS": "3" } })), 3);
    }

    #[test]
    fn test_recent_is_bounded_and_repeats_folded() {
        let entry = |t: &str, ts: &str| json!({ "TITLE": t, "ARTIST": "A", "LASTPLAYED": ts });
        let payload = json!({
            "current": entry("One", "2026-01-01 10:00:00"),
            "recent": [
                entry("One", "2026-01-01 10:00:00"),
                entry("Two", "2026-01-01 09:56:00"),
                entry("Three", "2026-01-01 09:52:00"),
                entry("Four", "2026-01-01 09:48:00"),
            ]
        });
        let titles: Vec<_> = normalize(&payload, &opts())
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["One", "Two", "Three"]);
    }

    #[test]
    fn test_generic_artwork_is_keyed_by_track() {
        let url = artwork_url(None, "Band X", "Song A", &opts()).unwrap();
        assert_eq!(url, "https://cdn.example.net/generic.jpg?key=Band%20X-Song%20A");

        let mut o = opts();
        o.generic_artwork_url = "https://cdn.example.net/art?size=300".into();
        let url = artwork_url(None, "B", "S", &o).unwrap();
        assert!(url.ends_with("?size=300&key=B-S"));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("215"), Some(215));
        assert_eq!(parse_duration("215.9"), Some(215));
        assert_eq!(parse_duration("1:02:03"), Some(3723));
        assert_eq!(parse_duration("0"), None);
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_dedup_key_is_case_insensitive() {
        let a = TrackEvent::new("Song A", "Band X");
        let b = TrackEvent::new("SONG a", "band x");
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), "band x|song a");
    }

    #[test]
    fn test_fingerprint_fields() {
        let payload = json!({
            "current": { "TITLE": " Song A " },
            "recent": [{ "TITLE": "Song Z" }]
        });
        assert_eq!(current_title(&payload).as_deref(), Some("Song A"));
        assert_eq!(first_recent_title(&payload).as_deref(), Some("Song Z"));
        assert!(first_recent_title(&json!({ "recent": [] })).is_none());
    }
}
