use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use onair_core::upstream::NowPlayingSource;
use onair_core::{Error, Result};
use serde_json::{json, Value};

/// Plays back a fixed list of responses; the last one repeats forever.
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<std::result::Result<Value, String>>>,
    fetches: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new(script: Vec<std::result::Result<Value, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn repeating(payload: Value) -> Self {
        Self::new(vec![Ok(payload)])
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NowPlayingSource for ScriptedUpstream {
    async fn fetch(&self) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().expect("script lock");
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        match next {
            Some(Ok(v)) => Ok(v),
            Some(Err(msg)) => Err(Error::upstream(msg)),
            None => Err(Error::upstream("empty script")),
        }
    }
}

pub fn song_a_payload() -> Value {
    json!({
        "current": {
            "TITLE": "Song A",
            "ARTIST": "Band X",
            "LASTPLAYED": "2026-02-26 03:22:12"
        },
        "recent": [],
        "listeners": 12
    })
}

pub fn song_b_payload() -> Value {
    json!({
        "current": {
            "TITLE": "Song B",
            "ARTIST": "Band Y",
            "LASTPLAYED": "2026-02-26 03:26:05"
        },
        "recent": [
            { "TITLE": "Song A", "ARTIST": "Band X", "LASTPLAYED": "2026-02-26 03:22:12" }
        ],
        "listeners": 14
    })
}
