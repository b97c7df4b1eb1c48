//! Error taxonomy for the sync, logging and playback pipeline.

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fetch failure or non-2xx from the now-playing feed.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The store already holds this play. Counted as a suppression, not a failure.
    #[error("already logged: {artist} - {title} at {play_started_at}")]
    DuplicateWrite {
        title: String,
        artist: String,
        play_started_at: String,
    },

    /// Any other store error. Reported in the batch summary, never retried.
    #[error("store write failed: {0}")]
    TransientWriteFailure(String),

    /// Audio error or stall on the live stream.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    /// A play request lost the race against stop/pause.
    #[error("play request cancelled")]
    BenignCancellation,

    #[error("timezone error: {0}")]
    Timezone(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateWrite { .. })
    }

    pub fn is_benign_cancellation(&self) -> bool {
        matches!(self, Self::BenignCancellation)
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    pub fn write_failure(msg: impl Into<String>) -> Self {
        Self::TransientWriteFailure(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_not_a_write_failure() {
        let dup = Error::DuplicateWrite {
            title: "Song A".into(),
            artist: "Band X".into(),
            play_started_at: "2026-02-26T09:22:12Z".into(),
        };
        assert!(dup.is_duplicate());
        assert!(!Error::write_failure("disk full").is_duplicate());
        assert!(Error::BenignCancellation.is_benign_cancellation());
    }
}
