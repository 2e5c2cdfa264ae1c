//! End-to-end session scenarios: fake backend, scripted microphone,
//! recording speaker.

use std::time::Duration;

use serde_json::json;
use voicelink::session::{ConnectionStatus, SessionEvent, VoiceState};
use voicelink::test_utils::ScriptedCapture;
use voicelink::transport::ProbeOutcome;
use voicelink::{ConnectError, SessionError, ToolCommand};

use crate::helpers::{
    FakeBackend, WAIT, eventually, spawn_session, spawn_session_with_mic, test_config, wait_for,
};

#[tokio::test]
async fn cold_connect_available_backend() {
    let backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);

    t.session.connect().await.unwrap();
    assert_eq!(
        t.session.snapshot().connection_status,
        ConnectionStatus::Connected
    );

    let mut watch = t.session.watch();
    let snap = wait_for(&mut watch, |s| s.session_id.is_some()).await;
    assert_eq!(snap.session_id.as_deref(), Some("sess-1"));

    // A second connect while connected is a no-op.
    t.session.connect().await.unwrap();
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn cold_connect_unavailable_backend() {
    let backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Unavailable);

    let err = t.session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Connect(ConnectError::Unavailable)));
    assert_eq!(
        t.session.snapshot().connection_status,
        ConnectionStatus::NoCredentials
    );
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn turn_cycle() {
    let mut backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    t.session.connect().await.unwrap();

    t.session.start_listening().await.unwrap();
    let start = backend.expect("start_session").await;
    assert_eq!(start["voice_settings"]["voice_name"], "default");
    assert_eq!(t.session.snapshot().voice_state, VoiceState::Listening);
    assert!(t.mic.is_active());

    // One block of 64 samples goes out as PCM16: 128 bytes of base64.
    assert!(t.mic.push_frame(vec![0.25; 64]));
    let chunk = backend.expect("audio_chunk").await;
    let decoded = voicelink::codec::decode_samples(chunk["data"].as_str().unwrap()).unwrap();
    assert_eq!(decoded.len(), 64);

    t.session.stop_listening().await.unwrap();
    assert_eq!(t.session.snapshot().voice_state, VoiceState::Processing);
    assert!(!t.mic.is_active());
    backend.expect("end_turn").await;

    backend.send_audio(480);
    wait_for(&mut watch, |s| s.voice_state == VoiceState::Speaking).await;

    // The user takes the next turn while the assistant is still talking.
    t.session.start_listening().await.unwrap();
    assert!(t.mic.is_active());
    assert_eq!(t.session.snapshot().voice_state, VoiceState::Speaking);

    backend.send(json!({"type": "turn_complete"}));
    let snap = wait_for(&mut watch, |s| s.voice_state == VoiceState::Listening).await;
    assert!(snap.capture_active);
}

#[tokio::test]
async fn turn_complete_after_mic_released_goes_idle() {
    let backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    let mut events = t.session.subscribe();
    t.session.connect().await.unwrap();
    t.session.start_listening().await.unwrap();
    t.session.stop_listening().await.unwrap();

    backend.send(json!({"type": "text_delta", "content": "Hello "}));
    backend.send(json!({"type": "text_delta", "content": "there"}));
    backend.send_audio(480);
    wait_for(&mut watch, |s| s.voice_state == VoiceState::Speaking).await;
    assert_eq!(t.session.snapshot().transcript, "Hello there");

    backend.send(json!({"type": "turn_complete"}));
    let snap = wait_for(&mut watch, |s| s.voice_state == VoiceState::Idle).await;
    assert!(snap.transcript.is_empty());

    let completed = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::TurnComplete { transcript }) = events.recv().await {
                return transcript;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(completed, "Hello there");
}

#[tokio::test]
async fn blocks_outside_listening_are_never_sent() {
    let mut backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    t.session.connect().await.unwrap();
    t.session.start_listening().await.unwrap();
    t.session.stop_listening().await.unwrap();
    backend.expect("end_turn").await;

    backend.send_audio(480);
    wait_for(&mut watch, |s| s.voice_state == VoiceState::Speaking).await;

    // Mic held while the assistant speaks: every block is gated.
    t.session.start_listening().await.unwrap();
    for _ in 0..3 {
        assert!(t.mic.push_frame(vec![0.1; 64]));
    }
    let snap = wait_for(&mut watch, |s| s.stats.blocks_dropped == 3).await;
    assert_eq!(snap.stats.blocks_sent, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let leaked: Vec<_> = backend
        .drain()
        .into_iter()
        .filter(|m| m["type"] == "audio_chunk")
        .collect();
    assert!(leaked.is_empty(), "gated blocks reached the backend");
}

#[tokio::test]
async fn audio_captured_before_the_gate_opens_is_discarded() {
    let mut backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    t.session.connect().await.unwrap();
    t.session.start_listening().await.unwrap();
    t.session.stop_listening().await.unwrap();
    backend.expect("end_turn").await;

    backend.send_audio(480);
    wait_for(&mut watch, |s| s.voice_state == VoiceState::Speaking).await;

    // Mic held while the assistant speaks: a partial block builds up.
    t.session.start_listening().await.unwrap();
    assert!(t.mic.push_frame(vec![0.9; 48]));

    backend.send(json!({"type": "turn_complete"}));
    wait_for(&mut watch, |s| s.voice_state == VoiceState::Listening).await;

    assert!(t.mic.push_frame(vec![0.1; 16]));
    assert!(t.mic.push_frame(vec![0.1; 48]));

    let chunk = backend.expect("audio_chunk").await;
    let decoded = voicelink::codec::decode_samples(chunk["data"].as_str().unwrap()).unwrap();
    assert_eq!(decoded.len(), 64);
    assert!(
        decoded.iter().all(|s| (s - 0.1).abs() < 1e-3),
        "speaking-time audio reached the backend"
    );
    let snap = wait_for(&mut watch, |s| s.stats.blocks_sent == 1).await;
    assert_eq!(snap.stats.blocks_sent, 1);
}

#[tokio::test]
async fn interrupted_playback_clears_queue() {
    let backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    let mut events = t.session.subscribe();
    t.session.connect().await.unwrap();

    for _ in 0..10 {
        backend.send_audio(240);
    }
    wait_for(&mut watch, |s| s.stats.chunks_received == 10).await;
    eventually(|| t.speaker.play_count() == 1).await;

    t.session.stop_playback().await.unwrap();
    let dropped = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::PlaybackStopped { dropped }) = events.recv().await {
                return dropped;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(dropped, 6);
    assert!(t.speaker.halt_count() >= 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(t.speaker.play_count(), 1, "nothing plays after stop");

    for _ in 0..4 {
        backend.send_audio(240);
    }
    eventually(|| t.speaker.play_count() == 2).await;
}

#[tokio::test]
async fn playback_batches_are_attenuated() {
    let backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    t.session.connect().await.unwrap();

    for _ in 0..4 {
        backend.send_audio(100);
    }
    eventually(|| t.speaker.play_count() == 1).await;
    let buffer = &t.speaker.buffers()[0];
    assert_eq!(buffer.len(), 400);
    assert!(buffer.iter().all(|s| (s - 0.35).abs() < 1e-3));
}

#[tokio::test]
async fn processing_timeout_resets_to_idle() {
    let mut backend = FakeBackend::start().await;
    let mut config = test_config(backend.url());
    config.session.processing_timeout_ms = 150;
    let t = spawn_session(config, ProbeOutcome::Available);
    let mut watch = t.session.watch();
    let mut events = t.session.subscribe();
    t.session.connect().await.unwrap();

    t.session.send_text("what's my rising sign?").await.unwrap();
    assert_eq!(t.session.snapshot().voice_state, VoiceState::Processing);
    backend.expect("start_session").await;
    let text = backend.expect("text_message").await;
    assert_eq!(text["content"], "what's my rising sign?");

    wait_for(&mut watch, |s| s.voice_state == VoiceState::Idle).await;
    let timed_out = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::ProcessingTimeout) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(timed_out.is_ok());
    assert_eq!(
        t.session.snapshot().connection_status,
        ConnectionStatus::Connected
    );
}

#[tokio::test]
async fn first_audio_disarms_processing_watchdog() {
    let backend = FakeBackend::start().await;
    let mut config = test_config(backend.url());
    config.session.processing_timeout_ms = 150;
    let t = spawn_session(config, ProbeOutcome::Available);
    let mut watch = t.session.watch();
    t.session.connect().await.unwrap();

    t.session.send_text("hi").await.unwrap();
    backend.send_audio(240);
    wait_for(&mut watch, |s| s.voice_state == VoiceState::Speaking).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(t.session.snapshot().voice_state, VoiceState::Speaking);
}

#[tokio::test]
async fn benign_backend_errors_are_suppressed() {
    let backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    t.session.connect().await.unwrap();

    backend.send(json!({"type": "error", "error": "Knowledge base is still indexing"}));
    backend.send(json!({"type": "error", "error": "retry later", "code": "INDEX_NOT_READY"}));
    backend.send(json!({"type": "error", "error": "list index out of range"}));

    let snap = wait_for(&mut watch, |s| s.last_error.is_some()).await;
    assert_eq!(snap.last_error.as_deref(), Some("list index out of range"));
}

#[tokio::test]
async fn tool_commands_reach_the_subscriber_in_order() {
    let backend = FakeBackend::start().await;
    let mut t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    t.session.connect().await.unwrap();

    backend.send(json!({
        "type": "tool_command",
        "tool_name": "navigate",
        "tool_args": "{\"route\": \"/chart\"}"
    }));
    backend.send(json!({"type": "tool_command", "tool_name": "self_destruct", "tool_args": {}}));
    backend.send(json!({"type": "tool_command", "tool_name": "show_panel", "tool_args": {"panel": 7}}));
    backend.send(json!({
        "type": "tool_command",
        "tool_name": "set_chart_state",
        "tool_args": {"chart_type": "transit"}
    }));

    let first = tokio::time::timeout(WAIT, t.tools.recv()).await.unwrap().unwrap();
    assert_eq!(
        first,
        ToolCommand::Navigate {
            route: "/chart".into(),
            params: None
        }
    );
    // The unknown and malformed commands are skipped, not fatal.
    let second = tokio::time::timeout(WAIT, t.tools.recv()).await.unwrap().unwrap();
    assert_eq!(second.name(), "set_chart_state");
    assert_eq!(
        t.session.snapshot().connection_status,
        ConnectionStatus::Connected
    );
}

#[tokio::test]
async fn denied_microphone_fails_start_listening_only() {
    let mut backend = FakeBackend::start().await;
    let t = spawn_session_with_mic(
        test_config(backend.url()),
        ProbeOutcome::Available,
        ScriptedCapture::denied(),
    );
    t.session.connect().await.unwrap();

    let err = t.session.start_listening().await.unwrap_err();
    assert!(matches!(err, SessionError::Device(_)));
    backend.expect("start_session").await;

    let snap = t.session.snapshot();
    assert_eq!(snap.connection_status, ConnectionStatus::Connected);
    assert_eq!(snap.voice_state, VoiceState::Idle);
    assert!(!snap.capture_active);
}

#[tokio::test]
async fn disconnect_stops_session_and_releases_everything() {
    let mut backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    t.session.connect().await.unwrap();
    t.session.start_listening().await.unwrap();
    backend.expect("start_session").await;

    t.session.disconnect().await.unwrap();
    backend.expect("stop_session").await;

    let snap = t.session.snapshot();
    assert_eq!(snap.connection_status, ConnectionStatus::Disconnected);
    assert_eq!(snap.voice_state, VoiceState::Idle);
    assert!(snap.session_id.is_none());
    assert!(!t.mic.is_active());

    // Nothing reconnects behind the caller's back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.connections(), 1);
    assert_eq!(
        t.session.snapshot().connection_status,
        ConnectionStatus::Disconnected
    );

    // And a fresh connect works.
    t.session.connect().await.unwrap();
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn link_loss_resets_turn_and_reconnects() {
    let backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    let mut events = t.session.subscribe();
    t.session.connect().await.unwrap();
    t.session.start_listening().await.unwrap();
    assert!(t.mic.is_active());

    backend.drop_connection();
    let mut saw_disconnect = false;
    let reconnecting = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StatusChanged {
                    status: ConnectionStatus::Disconnected,
                }) => saw_disconnect = true,
                Ok(SessionEvent::Reconnecting { attempt, .. }) => return attempt,
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(saw_disconnect);
    assert_eq!(reconnecting, 1);
    assert!(!t.mic.is_active());

    let snap = wait_for(&mut watch, |s| {
        s.connection_status == ConnectionStatus::Connected
    })
    .await;
    assert_eq!(snap.voice_state, VoiceState::Idle);
    assert!(!snap.capture_active);
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn exhausted_reconnects_surface_error() {
    let url = crate::helpers::unreachable_url().await;
    let mut config = test_config(&url);
    config.transport.max_attempts = 1;
    let t = spawn_session(config, ProbeOutcome::Available);

    let err = t.session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Connect(ConnectError::Exhausted(1))
    ));
    let snap = t.session.snapshot();
    assert_eq!(snap.connection_status, ConnectionStatus::Error);
    assert!(snap.last_error.is_some());
}

#[tokio::test]
async fn history_sync_and_clear() {
    let mut backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    t.session.connect().await.unwrap();

    t.session
        .sync_history(vec![voicelink::protocol::HistoryEntry {
            role: "user".into(),
            content: "hi".into(),
            mode: "text".into(),
        }])
        .await
        .unwrap();
    let sync = backend.expect("sync_history").await;
    assert_eq!(
        sync["history"],
        json!([{"role": "user", "content": "hi", "mode": "text"}])
    );

    t.session.clear_history().await.unwrap();
    backend.expect("clear_history").await;
}

#[tokio::test]
async fn context_rides_along_with_start_session() {
    let mut backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    t.session.connect().await.unwrap();
    wait_for(&mut watch, |s| s.session_id.is_some()).await;
    t.session
        .set_context(Some(json!({"sun": "leo", "moon": "pisces"})))
        .await
        .unwrap();
    t.session.start_listening().await.unwrap();

    let start = backend.expect("start_session").await;
    assert_eq!(start["astrological_context"]["sun"], "leo");
    assert_eq!(start["session_id"], "sess-1");
}

#[tokio::test]
async fn session_stopped_by_backend_returns_to_idle() {
    let backend = FakeBackend::start().await;
    let t = spawn_session(test_config(backend.url()), ProbeOutcome::Available);
    let mut watch = t.session.watch();
    t.session.connect().await.unwrap();
    t.session.start_listening().await.unwrap();

    backend.send(json!({"type": "session_stopped"}));
    let snap = wait_for(&mut watch, |s| !s.session_active).await;
    assert_eq!(snap.voice_state, VoiceState::Idle);
    assert!(!t.mic.is_active());
}
