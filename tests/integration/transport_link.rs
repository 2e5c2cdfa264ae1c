//! Reconnecting transport against a local WebSocket backend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use voicelink::config::TransportConfig;
use voicelink::protocol::{ClientMessage, ServerMessage};
use voicelink::transport::{
    CapabilityProbe, HttpCapabilityProbe, LinkEvent, ProbeOutcome, StaticProbe, Transport,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{FakeBackend, WAIT, unreachable_url};

fn transport_config(url: &str) -> TransportConfig {
    TransportConfig {
        server_url: url.to_owned(),
        initial_delay_ms: 10,
        max_delay_ms: 40,
        ..TransportConfig::default()
    }
}

fn available() -> Arc<dyn CapabilityProbe> {
    Arc::new(StaticProbe(ProbeOutcome::Available))
}

async fn next_event(rx: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("link event channel closed")
}

#[tokio::test]
async fn cold_connect_opens_and_pumps_messages() {
    let mut backend = FakeBackend::start().await;
    let mut transport = Transport::new(transport_config(backend.url()), available());
    let mut rx = transport.connect().unwrap().expect("fresh link");

    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut rx).await, LinkEvent::Open);
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::Message(ServerMessage::Connected {
            session_id: Some("sess-1".into())
        })
    );

    transport
        .send(ClientMessage::TextMessage {
            content: "hello".into(),
        })
        .unwrap();
    let sent = backend.expect("text_message").await;
    assert_eq!(sent["content"], "hello");
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn connect_while_running_is_idempotent() {
    let backend = FakeBackend::start().await;
    let mut transport = Transport::new(transport_config(backend.url()), available());
    let mut rx = transport.connect().unwrap().expect("fresh link");
    assert!(transport.connect().unwrap().is_none());

    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut rx).await, LinkEvent::Open);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn unavailable_backend_opens_no_socket() {
    let backend = FakeBackend::start().await;
    let mut transport = Transport::new(
        transport_config(backend.url()),
        Arc::new(StaticProbe(ProbeOutcome::Unavailable)),
    );
    let mut rx = transport.connect().unwrap().expect("fresh link");

    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut rx).await, LinkEvent::NoCredentials);
    let end = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert!(end.is_none(), "link task should stop");
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn forbidden_probe_maps_to_no_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/voice/status"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let probe = HttpCapabilityProbe::new(
        format!("{}/api/voice/status", server.uri()),
        Duration::from_secs(2),
    )
    .unwrap();

    let backend = FakeBackend::start().await;
    let mut transport = Transport::new(transport_config(backend.url()), Arc::new(probe));
    let mut rx = transport.connect().unwrap().expect("fresh link");
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut rx).await, LinkEvent::NoCredentials);
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn invalid_url_is_rejected_up_front() {
    let mut transport = Transport::new(transport_config("not a url"), available());
    assert!(matches!(
        transport.connect(),
        Err(voicelink::ConnectError::InvalidUrl(_))
    ));
    assert!(!transport.is_running());
}

#[tokio::test]
async fn reconnects_after_unexpected_drop_and_resets_attempts() {
    let backend = FakeBackend::start().await;
    let mut transport = Transport::new(transport_config(backend.url()), available());
    let mut rx = transport.connect().unwrap().expect("fresh link");

    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut rx).await, LinkEvent::Open);
    let _connected = next_event(&mut rx).await;

    backend.drop_connection();
    match next_event(&mut rx).await {
        LinkEvent::Closed {
            retry_in, attempt, ..
        } => {
            assert_eq!(retry_in, Some(Duration::from_millis(10)));
            assert_eq!(attempt, 1);
        }
        other => unreachable!("expected Closed, got {other:?}"),
    }
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 1 });
    assert_eq!(next_event(&mut rx).await, LinkEvent::Open);
    assert_eq!(transport.policy().attempts(), 0);
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let mut config = transport_config(&unreachable_url().await);
    config.max_attempts = 2;
    let mut transport = Transport::new(config, available());
    let mut rx = transport.connect().unwrap().expect("fresh link");

    let mut delays = Vec::new();
    let mut attempts_seen = Vec::new();
    loop {
        match next_event(&mut rx).await {
            LinkEvent::Connecting { .. } => {}
            LinkEvent::Closed {
                retry_in, attempt, ..
            } => {
                delays.push(retry_in);
                attempts_seen.push(attempt);
            }
            LinkEvent::Exhausted { attempts } => {
                assert_eq!(attempts, 2);
                break;
            }
            other => unreachable!("unexpected event {other:?}"),
        }
    }
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_millis(10)),
            Some(Duration::from_millis(20)),
            None
        ]
    );
    assert_eq!(attempts_seen, vec![1, 2, 2]);
    let end = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn close_cancels_pending_reconnect() {
    let mut config = transport_config(&unreachable_url().await);
    config.initial_delay_ms = 200;
    let mut transport = Transport::new(config, available());
    let mut rx = transport.connect().unwrap().expect("fresh link");

    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 0 });
    assert!(matches!(
        next_event(&mut rx).await,
        LinkEvent::Closed {
            retry_in: Some(_),
            ..
        }
    ));

    // Backoff timer is pending; closing must stop it from firing.
    transport.close();
    assert!(!transport.policy().should_reconnect());
    let end = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert!(end.is_none(), "no events after close");
}

#[tokio::test]
async fn close_flushes_queued_messages() {
    let mut backend = FakeBackend::start().await;
    let mut transport = Transport::new(transport_config(backend.url()), available());
    let mut rx = transport.connect().unwrap().expect("fresh link");
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut rx).await, LinkEvent::Open);

    transport.send(ClientMessage::StopSession).unwrap();
    transport.close();
    backend.expect("stop_session").await;
    assert!(transport.send(ClientMessage::Ping).is_err());
}

#[tokio::test]
async fn sends_keepalive_pings() {
    let mut backend = FakeBackend::start().await;
    let mut config = transport_config(backend.url());
    config.ping_interval_ms = 50;
    let mut transport = Transport::new(config, available());
    let _rx = transport.connect().unwrap().expect("fresh link");

    let ping = backend.expect_raw("ping").await;
    assert_eq!(ping, json!({"type": "ping"}));
}

#[tokio::test]
async fn undecodable_frames_are_dropped() {
    let backend = FakeBackend::start().await;
    let mut transport = Transport::new(transport_config(backend.url()), available());
    let mut rx = transport.connect().unwrap().expect("fresh link");
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut rx).await, LinkEvent::Open);
    let _connected = next_event(&mut rx).await;

    backend.send(json!({"type": "mystery"}));
    backend.send(json!({"type": "pong"}));
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::Message(ServerMessage::Pong {})
    );
}
