use serde::{Deserialize, Serialize};

use crate::playback::{PlaybackEvent, PlaybackSession};

/// Transport commands accepted by the daemon core (HTTP handlers and the
/// media session both send these).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play,
    Pause,
    Stop,
    /// 0.0..=1.0
    Volume { value: f32 },
    Mute { muted: bool },
}

impl From<Command> for PlaybackEvent {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Play => PlaybackEvent::Play,
            Command::Pause => PlaybackEvent::Pause,
            Command::Stop => PlaybackEvent::Stop,
            Command::Volume { value } => PlaybackEvent::SetVolume(value),
            Command::Mute { muted } => PlaybackEvent::SetMuted(muted),
        }
    }
}

/// Health of the mpv process as observed by the daemon.
///
/// Transitions:
///   Absent -> Starting -> Running -> Dead -> Starting ...
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum MpvHealth {
    /// Not spawned yet.
    #[default]
    Absent,
    Starting,
    Running,
    /// Process exited or socket closed.
    Dead,
}

/// Body of `GET /api/playback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackReport {
    #[serde(flatten)]
    pub session: PlaybackSession,
    pub mpv: MpvHealth,
    pub stream_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::ConnectionStatus;

    #[test]
    fn test_command_wire_format() {
        let cmd: Command = serde_json::from_str(r#"{"cmd":"Volume","value":0.25}"#).unwrap();
        assert_eq!(cmd, Command::Volume { value: 0.25 });
        assert_eq!(
            serde_json::to_string(&Command::Mute { muted: true }).unwrap(),
            r#"{"cmd":"Mute","muted":true}"#
        );
        assert_eq!(PlaybackEvent::from(Command::Stop), PlaybackEvent::Stop);
    }

    #[test]
    fn test_report_flattens_session() {
        let report = PlaybackReport {
            session: PlaybackSession::new(0.5),
            mpv: MpvHealth::Running,
            stream_url: "https://stream.example.net/live".into(),
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["connection_status"], "idle");
        assert_eq!(v["mpv"], "Running");
        assert_eq!(report.session.connection_status, ConnectionStatus::Idle);
    }
}
