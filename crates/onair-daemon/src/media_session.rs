//! In-process "now playing" surface. Desktop integrations and the web UI
//! read it through `GET /api/media-session`.

use std::sync::RwLock;

use onair_core::playback::{MediaSession, MediaSessionUpdate};
use tracing::debug;

#[derive(Default)]
pub struct PublishedMediaSession {
    current: RwLock<Option<MediaSessionUpdate>>,
}

impl PublishedMediaSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<MediaSessionUpdate> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set(&self, value: Option<MediaSessionUpdate>) {
        match self.current.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

impl MediaSession for PublishedMediaSession {
    fn update(&self, update: &MediaSessionUpdate) {
        debug!(
            "[media] {:?} {}",
            update.status,
            update
                .metadata
                .as_ref()
                .map(|m| format!("{} \u{2013} {}", m.artist, m.title))
                .unwrap_or_default()
        );
        self.set(Some(update.clone()));
    }

    fn clear(&self) {
        debug!("[media] cleared");
        self.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onair_core::playback::{ConnectionStatus, TransportControls};

    #[test]
    fn test_update_then_clear() {
        let session = PublishedMediaSession::new();
        assert!(session.current().is_none());

        let update = MediaSessionUpdate {
            metadata: None,
            status: ConnectionStatus::Connecting,
            controls: TransportControls::for_status(ConnectionStatus::Connecting),
        };
        session.update(&update);
        assert_eq!(session.current(), Some(update));

        session.clear();
        assert!(session.current().is_none());
    }
}
