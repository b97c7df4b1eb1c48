//! Reader-side cleanup of stored history.
//!
//! The store is at-least-once, so a listing can still hold the same play
//! observed twice a few seconds apart. Readers apply the logger's key/window
//! rule again and drop station identifiers.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::store::PersistedPlay;

const IDENT_MARKERS: &[&str] = &["station id", "legal id", "sweeper", "jingle", "promo"];

/// True for station IDs, sweepers, jingles and promos rather than music.
pub fn is_station_ident(title: &str, artist: &str, station_name: &str) -> bool {
    let title = title.trim().to_lowercase();
    let artist = artist.trim().to_lowercase();
    let station = station_name.trim().to_lowercase();

    if !station.is_empty() && (artist == station || title == station) {
        return true;
    }
    IDENT_MARKERS
        .iter()
        .any(|m| title.contains(m) || artist.contains(m))
}

/// `rows` most-recent-first in, most-recent-first out. A row whose key was
/// already kept less than `window` later is a repeat and is dropped.
pub fn for_display(
    rows: &[PersistedPlay],
    station_name: &str,
    window: TimeDelta,
) -> Vec<PersistedPlay> {
    let mut last_kept: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut out = Vec::with_capacity(rows.len());

    for row in rows {
        if is_station_ident(&row.title, &row.artist, station_name) {
            continue;
        }
        let key = row.dedup_key();
        if let Some(kept) = last_kept.get(&key) {
            if (*kept - row.play_started_at).abs() < window {
                continue;
            }
        }
        last_kept.insert(key, row.play_started_at);
        out.push(row.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackEvent;

    fn row(title: &str, artist: &str, at: &str) -> PersistedPlay {
        let t = DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc);
        PersistedPlay::from_event(&TrackEvent::new(title, artist), t, t)
    }

    #[test]
    fn test_station_ident_heuristics() {
        assert!(is_station_ident("KXYZ Legal ID", "", "KXYZ"));
        assert!(is_station_ident("Morning Sweeper", "Unknown Artist", "KXYZ"));
        assert!(is_station_ident("Anything", "kxyz", "KXYZ"));
        assert!(!is_station_ident("Song A", "Band X", "KXYZ"));
    }

    #[test]
    fn test_repeats_inside_window_collapse() {
        let rows = vec![
            row("Song A", "Band X", "2026-02-26T09:22:40Z"),
            row("song a", "band x", "2026-02-26T09:22:12Z"),
            row("Station ID", "KXYZ", "2026-02-26T09:21:00Z"),
            row("Song A", "Band X", "2026-02-26T06:00:00Z"),
        ];
        let shown = for_display(&rows, "KXYZ", TimeDelta::minutes(3));
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0].play_started_at, rows[0].play_started_at);
        assert_eq!(shown[1].play_started_at, rows[3].play_started_at);
    }
}
