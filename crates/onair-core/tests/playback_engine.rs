mod common;

use std::sync::Arc;
use std::time::Duration;

use common::backend::{FakeBackend, RecordingSession, StartMode};
use onair_core::playback::{
    ConnectionStatus, MediaMetadata, PlaybackEngine, PlaybackEvent, PlaybackSession, RetryPolicy,
};
use onair_core::track::TrackEvent;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

struct Rig {
    backend: Arc<FakeBackend>,
    media: Arc<RecordingSession>,
    tx: mpsc::UnboundedSender<PlaybackEvent>,
    session: watch::Receiver<PlaybackSession>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<PlaybackEngine>,
}

fn rig(mode: StartMode) -> Rig {
    let backend = Arc::new(FakeBackend::new(mode));
    let media = Arc::new(RecordingSession::default());
    let (engine, tx, rx) =
        PlaybackEngine::new(RetryPolicy::default(), 0.8, backend.clone(), media.clone());
    let session = engine.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(engine.run(rx, cancel.clone()));
    Rig {
        backend,
        media,
        tx,
        session,
        cancel,
        task,
    }
}

async fn wait_for_status(rig: &mut Rig, status: ConnectionStatus) -> PlaybackSession {
    rig.session
        .wait_for(|s| s.connection_status == status)
        .await
        .expect("engine alive")
        .clone()
}

#[tokio::test(start_paused = true)]
async fn test_play_reaches_streaming() {
    let mut rig = rig(StartMode::Immediate);
    rig.tx.send(PlaybackEvent::Play).expect("send");
    let session = wait_for_status(&mut rig, ConnectionStatus::Streaming).await;
    assert!(session.is_playing);
    assert_eq!(session.reconnect_attempts, 0);
    assert_eq!(rig.backend.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_racing_a_pending_play_is_not_an_error() {
    let mut rig = rig(StartMode::UntilReleased);
    rig.tx.send(PlaybackEvent::Play).expect("send");
    wait_for_status(&mut rig, ConnectionStatus::Connecting).await;
    rig.tx.send(PlaybackEvent::Stop).expect("send");

    let session = wait_for_status(&mut rig, ConnectionStatus::Idle).await;
    // Give the aborted play and the connect watchdog time to report in.
    tokio::time::sleep(Duration::from_secs(60)).await;

    let session_after = rig.session.borrow().clone();
    assert_eq!(session_after, session);
    assert_eq!(session_after.connection_status, ConnectionStatus::Idle);
    assert_eq!(session_after.reconnect_attempts, 0);
    assert_eq!(rig.backend.starts(), 1);
    assert_eq!(rig.backend.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failures_retry_three_times_then_stay_in_error() {
    let mut rig = rig(StartMode::Fail("connection reset".into()));
    rig.tx.send(PlaybackEvent::Play).expect("send");

    // 1 initial attempt + 3 retries, 2 s apart.
    tokio::time::sleep(Duration::from_secs(60)).await;
    let session = wait_for_status(&mut rig, ConnectionStatus::Error).await;
    assert_eq!(session.reconnect_attempts, 3);
    assert_eq!(rig.backend.starts(), 4);
    assert!(!session.is_playing);

    // Manual retry gets a fresh budget and can succeed.
    rig.backend.set_mode(StartMode::Immediate);
    rig.tx.send(PlaybackEvent::Play).expect("send");
    let session = wait_for_status(&mut rig, ConnectionStatus::Streaming).await;
    assert_eq!(session.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_metadata_reaches_media_session_while_streaming() {
    let mut rig = rig(StartMode::Immediate);
    rig.tx.send(PlaybackEvent::Play).expect("send");
    wait_for_status(&mut rig, ConnectionStatus::Streaming).await;

    let meta = MediaMetadata::from_track(&TrackEvent::new("Song A", "Band X"));
    rig.tx
        .send(PlaybackEvent::MetadataChanged(Some(meta.clone())))
        .expect("send");
    rig.tx.send(PlaybackEvent::SetVolume(0.3)).expect("send");
    rig.session
        .wait_for(|s| (s.volume - 0.3).abs() < f32::EPSILON)
        .await
        .expect("engine alive");

    let last = rig.media.updates().last().cloned().expect("an update");
    assert_eq!(last.metadata, Some(meta));
    assert_eq!(last.status, ConnectionStatus::Streaming);
    assert!(last.controls.pause && last.controls.stop && !last.controls.play);
    assert_eq!(rig.backend.volume(), Some((0.3, false)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_the_stream() {
    let mut rig = rig(StartMode::Immediate);
    rig.tx.send(PlaybackEvent::Play).expect("send");
    wait_for_status(&mut rig, ConnectionStatus::Streaming).await;

    rig.cancel.cancel();
    let engine = rig.task.await.expect("engine task");
    assert_eq!(engine.session().connection_status, ConnectionStatus::Idle);
    assert_eq!(rig.backend.releases(), 1);
    assert!(rig.media.clears() >= 1);
}
