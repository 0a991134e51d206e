//! Call pipeline integration tests
//!
//! Drives the controller against a scripted remote session and fake
//! devices, one event at a time.

use std::time::Duration;

use livecall::call::{CallController, CallUpdate, ConnectionState};
use livecall::session::{SessionEvent, ServerMessage};
use livecall::voice::INPUT_MIME_TYPE;
use livecall::Error;

mod common;
use common::{FakeDevices, FakeRemote, controller, reply_chunk, settings};

const EPSILON: f64 = 1e-9;

/// Start a call and step through the handshake
async fn connect(call: &mut CallController<FakeDevices>) {
    call.start().unwrap();
    assert_eq!(call.state(), ConnectionState::Connecting);
    assert_eq!(call.step().await, Some(CallUpdate::SessionOpened));
    assert_eq!(call.step().await, Some(CallUpdate::Connected));
    assert_eq!(call.state(), ConnectionState::Connected);
}

/// Let spawned tasks (dispatch writer, drop cleanup) run
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn reply(seconds: f64) -> ServerMessage {
    ServerMessage::audio(reply_chunk(seconds))
}

#[tokio::test]
async fn test_missing_api_key_blocks_call() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut s = settings(true);
    s.has_credential = false;
    let mut call = controller(s, &remote, &devices);

    let err = call.start().unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(call.state(), ConnectionState::Error);
    assert!(call.last_error().is_some());

    settle().await;
    assert_eq!(devices.log().mic_opened, 0);
    assert_eq!(remote.log().connects, 0);
}

#[tokio::test]
async fn test_microphone_denied_never_acquires_camera() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new().deny_microphone();
    let mut call = controller(settings(true), &remote, &devices);

    let err = call.start().unwrap_err();
    assert!(matches!(err, Error::Permission(_)));
    assert_eq!(call.state(), ConnectionState::Error);
    assert_eq!(
        call.last_error(),
        Some("Camera or microphone access was denied.")
    );

    settle().await;
    assert_eq!(devices.log().camera_opened, 0);
    assert_eq!(remote.log().connects, 0);
    assert!(!call.in_call());
}

#[tokio::test]
async fn test_camera_denied_releases_microphone() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new().deny_camera();
    let mut call = controller(settings(true), &remote, &devices);

    assert!(call.start().is_err());
    assert_eq!(call.state(), ConnectionState::Error);

    let log = devices.log();
    assert_eq!(log.mic_opened, 1);
    assert_eq!(log.mic_stopped, 1);
    assert_eq!(log.outputs_opened, 0);
}

#[tokio::test]
async fn test_retry_after_error() {
    let remote = FakeRemote::refusing();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);

    call.start().unwrap();
    assert_eq!(
        call.step().await,
        Some(CallUpdate::Ended(ConnectionState::Error))
    );
    assert_eq!(call.last_error(), Some("Could not connect to the assistant."));
    assert_eq!(devices.log().mic_stopped, 1);

    // Error -> Connecting is allowed
    call.start().unwrap();
    assert_eq!(call.state(), ConnectionState::Connecting);
    assert!(call.last_error().is_none());
}

#[tokio::test]
async fn test_cannot_start_twice() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);

    call.start().unwrap();
    assert!(matches!(call.start(), Err(Error::Session(_))));
    assert_eq!(devices.log().mic_opened, 1);
}

#[tokio::test]
async fn test_three_chunks_play_back_to_back() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    let start = call.playback().unwrap().cursor();
    for _ in 0..3 {
        remote.emit_message(reply(1.0));
    }
    for _ in 0..3 {
        assert_eq!(
            call.step().await,
            Some(CallUpdate::Reply {
                scheduled: 1,
                failed: 0,
                interrupted: false
            })
        );
    }

    let playback = call.playback().unwrap();
    assert!((playback.cursor() - (start + 3.0)).abs() < EPSILON);
    assert_eq!(playback.active_count(), 3);

    let started = devices.log().started.clone();
    assert_eq!(started.len(), 3);
    for pair in started.windows(2) {
        let (_, prev_start, prev_duration) = pair[0];
        let (_, next_start, _) = pair[1];
        assert!((next_start - (prev_start + prev_duration)).abs() < EPSILON);
    }

    // Each handle is removed as it finishes
    for (id, _, _) in &started {
        devices.finish(*id);
        assert_eq!(call.step().await, Some(CallUpdate::PlaybackFinished(*id)));
    }
    assert_eq!(call.playback().unwrap().active_count(), 0);
}

#[tokio::test]
async fn test_interruption_stops_everything() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    remote.emit_message(reply(1.0));
    remote.emit_message(reply(1.0));
    call.step().await;
    call.step().await;
    assert_eq!(call.playback().unwrap().active_count(), 2);

    devices.set_clock(0.4);
    remote.emit_message(ServerMessage::interrupted());
    assert_eq!(
        call.step().await,
        Some(CallUpdate::Reply {
            scheduled: 0,
            failed: 0,
            interrupted: true
        })
    );

    let playback = call.playback().unwrap();
    assert_eq!(playback.active_count(), 0);
    assert!(playback.cursor() <= 0.4 + EPSILON);

    let mut stopped = devices.log().stopped.clone();
    stopped.sort_unstable();
    assert_eq!(stopped, vec![1, 2]);

    // The next reply starts right away
    remote.emit_message(reply(0.5));
    call.step().await;
    let (_, start, _) = *devices.log().started.last().unwrap();
    assert!((start - 0.4).abs() < EPSILON);
}

#[tokio::test]
async fn test_audio_in_interrupting_message_is_cut() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    let mut message = reply(1.0);
    if let Some(content) = message.server_content.as_mut() {
        content.interrupted = true;
    }
    remote.emit_message(message);

    assert_eq!(
        call.step().await,
        Some(CallUpdate::Reply {
            scheduled: 1,
            failed: 0,
            interrupted: true
        })
    );
    assert_eq!(call.playback().unwrap().active_count(), 0);
    assert_eq!(devices.log().stopped, vec![1]);
}

#[tokio::test]
async fn test_bad_chunk_is_skipped() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    remote.emit_message(ServerMessage::audio("not base64!"));
    assert_eq!(
        call.step().await,
        Some(CallUpdate::Reply {
            scheduled: 0,
            failed: 1,
            interrupted: false
        })
    );
    assert_eq!(call.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_nothing_flows_before_connected() {
    let remote = FakeRemote::manual_open();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);

    call.start().unwrap();
    assert_eq!(call.step().await, Some(CallUpdate::SessionOpened));
    assert_eq!(call.state(), ConnectionState::Connecting);

    devices.capture(vec![0.1; 4096]);
    assert_eq!(
        call.step().await,
        Some(CallUpdate::AudioCaptured { forwarded: false })
    );

    remote.emit_message(reply(1.0));
    assert_eq!(call.step().await, Some(CallUpdate::Discarded));
    assert!(devices.log().started.is_empty());

    // Blocks captured during the handshake are discarded on open
    devices.capture(vec![0.2; 4096]);
    remote.emit(SessionEvent::Open);
    assert_eq!(call.step().await, Some(CallUpdate::Connected));

    devices.capture(vec![0.3; 4096]);
    assert_eq!(
        call.step().await,
        Some(CallUpdate::AudioCaptured { forwarded: true })
    );
    settle().await;

    let log = remote.log();
    assert_eq!(log.sent.len(), 1);
    assert_eq!(log.sent[0].mime_type, INPUT_MIME_TYPE);
}

#[tokio::test]
async fn test_audio_sent_in_capture_order() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    for level in [0.1, 0.2, 0.3] {
        devices.capture(vec![level; 4096]);
        call.step().await;
    }
    settle().await;

    let sent: Vec<String> = remote.log().sent.iter().map(|b| b.data.clone()).collect();
    let expected: Vec<String> = [0.1, 0.2, 0.3]
        .iter()
        .map(|level| livecall::voice::audio_blob(&[*level; 4096]).data)
        .collect();
    assert_eq!(sent, expected);
}

#[tokio::test]
async fn test_queued_audio_not_sent_after_hang_up() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    devices.capture(vec![0.5; 4096]);
    assert_eq!(
        call.step().await,
        Some(CallUpdate::AudioCaptured { forwarded: true })
    );

    // The writer has not run yet; hanging up must stop the queued send
    call.hang_up().await;
    settle().await;

    assert_eq!(remote.sent_count(), 0);
    assert_eq!(call.dispatch_stats().unwrap().dropped(), 1);
}

#[tokio::test]
async fn test_hang_up_is_idempotent() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(true), &remote, &devices);
    connect(&mut call).await;

    call.hang_up().await;
    call.hang_up().await;
    call.teardown().await;

    assert_eq!(call.state(), ConnectionState::Disconnected);
    assert!(!call.in_call());
    assert_eq!(remote.closes(), 1);

    let log = devices.log();
    assert_eq!(log.mic_stopped, 1);
    assert_eq!(log.camera_stopped, 1);
    assert_eq!(log.outputs_closed, 1);
}

#[tokio::test]
async fn test_failed_session_close_still_releases_devices() {
    let remote = FakeRemote::new().failing_close();
    let devices = FakeDevices::new();
    let mut call = controller(settings(true), &remote, &devices);
    connect(&mut call).await;

    call.hang_up().await;

    assert_eq!(call.state(), ConnectionState::Disconnected);
    assert!(!call.in_call());
    assert_eq!(remote.closes(), 1);
    assert!(call.playback().is_none());

    let log = devices.log();
    assert_eq!(log.mic_stopped, 1);
    assert_eq!(log.camera_stopped, 1);
    assert_eq!(log.outputs_closed, 1);
}

#[tokio::test]
async fn test_hang_up_while_connecting_closes_pending_session() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);

    call.start().unwrap();
    call.hang_up().await;

    assert_eq!(call.state(), ConnectionState::Disconnected);
    assert_eq!(remote.log().connects, 1);
    assert_eq!(remote.closes(), 1);
}

#[tokio::test]
async fn test_remote_close_ends_call() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    remote.emit(SessionEvent::Close(Some("bye".to_string())));
    assert_eq!(
        call.step().await,
        Some(CallUpdate::Ended(ConnectionState::Disconnected))
    );
    assert!(call.step().await.is_none());
    assert_eq!(devices.log().mic_stopped, 1);
}

#[tokio::test]
async fn test_remote_error_enters_error_state() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    remote.emit(SessionEvent::Error("socket reset".to_string()));
    assert_eq!(
        call.step().await,
        Some(CallUpdate::Ended(ConnectionState::Error))
    );
    assert_eq!(call.last_error(), Some("Could not connect to the assistant."));
    assert_eq!(remote.closes(), 1);

    // Teardown after an error keeps the error visible
    call.hang_up().await;
    assert_eq!(call.state(), ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_frames_follow_cadence() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(true), &remote, &devices);
    connect(&mut call).await;

    let begin = tokio::time::Instant::now();
    for _ in 0..3 {
        assert_eq!(
            call.step().await,
            Some(CallUpdate::FrameCaptured { forwarded: true })
        );
    }
    assert_eq!(begin.elapsed(), Duration::from_millis(1000));
    settle().await;

    let log = remote.log();
    assert_eq!(log.sent.len(), 3);
    assert!(log.sent.iter().all(|b| b.mime_type == "image/jpeg"));
    assert_eq!(devices.log().frames, 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_hangs_up_on_shutdown() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);

    call.start().unwrap();
    let state = call.run(tokio::time::sleep(Duration::from_secs(2))).await;

    assert_eq!(state, ConnectionState::Disconnected);
    assert!(!call.in_call());
    assert_eq!(remote.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_teardown_lets_close_finish() {
    let remote = FakeRemote::new().slow_close(Duration::from_secs(1));
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    // Remote close starts a teardown that outlasts the shutdown signal
    remote.emit(SessionEvent::Close(None));
    let state = call
        .run(tokio::time::sleep(Duration::from_millis(10)))
        .await;

    assert_eq!(state, ConnectionState::Disconnected);
    assert!(!call.in_call());
    assert_eq!(remote.closes(), 1);
    assert_eq!(devices.log().mic_stopped, 1);
    assert_eq!(devices.log().outputs_closed, 1);
}

#[tokio::test]
async fn test_drop_releases_devices() {
    let remote = FakeRemote::new();
    let devices = FakeDevices::new();
    let mut call = controller(settings(false), &remote, &devices);
    connect(&mut call).await;

    drop(call);
    {
        let log = devices.log();
        assert_eq!(log.mic_stopped, 1);
        assert_eq!(log.outputs_closed, 1);
    }

    settle().await;
    assert_eq!(remote.closes(), 1);
}
