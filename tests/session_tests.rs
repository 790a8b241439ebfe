mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{bgr_frame, garbage_jpeg, FailingTransport, GatedTransport, ScriptedTransport, Step};
use irsnap::pipeline::{ErrorReason, HorizontalMirror, Identity, SessionError};
use irsnap::transport::{DeviceSelector, LinkState, PatternTransport};
use irsnap::{FrameBuffer, SessionConfig, SessionState, SnapshotError, StreamSession};

fn session_with(transport: Arc<ScriptedTransport>) -> StreamSession {
    StreamSession::new(
        transport,
        Arc::new(HorizontalMirror),
        Arc::new(FrameBuffer::new()),
        SessionConfig::default(),
    )
}

#[tokio::test]
async fn test_three_frames_then_disconnect() {
    let (release, gate) = flume::bounded(1);
    let transport = ScriptedTransport::new(vec![
        Step::Frame(bgr_frame(1)),
        Step::Gate(gate),
        Step::Frame(bgr_frame(2)),
        Step::Frame(bgr_frame(3)),
        Step::State(LinkState::Disconnected),
    ]);
    let session = session_with(transport.clone());
    let snapshots = session.snapshots();

    session.start(&DeviceSelector::Auto).unwrap();

    // first frame alone brings the session up
    let state = session.wait_for(|s| *s == SessionState::Active).await;
    assert_eq!(state, SessionState::Active);

    release.send(()).unwrap();
    let state = session.wait_until_finished().await;
    assert_eq!(state, SessionState::Stopped);
    assert_eq!(session.frames_published(), 3);
    assert_eq!(session.buffer().version(), 3);

    // mirrored frame 3: left/right swapped
    let frame = snapshots.capture().unwrap();
    assert_eq!(frame.sequence(), 3);
    assert_eq!(frame.pixel(0, 0), &[0, 0, 3]);
    assert_eq!(frame.pixel(1, 0), &[3, 0, 0]);

    assert_eq!(transport.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_transport_times_out() {
    let transport = ScriptedTransport::silent();
    let session = session_with(transport.clone());

    let started = tokio::time::Instant::now();
    session.start(&DeviceSelector::Auto).unwrap();
    let state = session.wait_until_finished().await;

    assert_eq!(state, SessionState::Error(ErrorReason::Timeout));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(3), "gave up after {waited:?}");
    assert!(waited < Duration::from_secs(4), "gave up after {waited:?}");
    assert_eq!(transport.released(), 1);
    assert_eq!(
        session.snapshots().capture().unwrap_err(),
        SnapshotError::NotAvailable
    );
}

#[tokio::test(start_paused = true)]
async fn test_miss_budget_is_configurable() {
    let transport = ScriptedTransport::silent();
    let config = SessionConfig {
        frame_timeout_ms: 200,
        miss_budget: 5,
        ..SessionConfig::default()
    };
    let session = StreamSession::new(
        transport,
        Arc::new(Identity),
        Arc::new(FrameBuffer::new()),
        config,
    );

    let started = tokio::time::Instant::now();
    session.start(&DeviceSelector::Auto).unwrap();
    session.wait_until_finished().await;
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert!(started.elapsed() < Duration::from_millis(1200));
}

#[tokio::test]
async fn test_stream_going_quiet_after_activation_times_out() {
    let transport = ScriptedTransport::new(vec![Step::Frame(bgr_frame(1)), Step::Hold]);
    let config = SessionConfig {
        frame_timeout_ms: 50,
        ..SessionConfig::default()
    };
    let session = StreamSession::new(
        transport.clone(),
        Arc::new(Identity),
        Arc::new(FrameBuffer::new()),
        config,
    );

    session.start(&DeviceSelector::Auto).unwrap();
    session.wait_for(|s| *s == SessionState::Active).await;
    let active_at = std::time::Instant::now();

    let state = session.wait_until_finished().await;
    assert_eq!(state, SessionState::Error(ErrorReason::Timeout));
    assert!(active_at.elapsed() >= Duration::from_millis(100));
    assert_eq!(session.frames_published(), 1);
    assert_eq!(transport.released(), 1);

    // the last good frame stays readable after the failure
    assert_eq!(session.snapshots().capture().unwrap().sequence(), 1);
}

#[tokio::test]
async fn test_decode_failures_exhaust_budget() {
    let transport = ScriptedTransport::new(vec![
        Step::State(LinkState::Connected),
        Step::Frame(garbage_jpeg()),
        Step::Frame(garbage_jpeg()),
        Step::Frame(garbage_jpeg()),
        Step::Hold,
    ]);
    let session = session_with(transport);

    session.start(&DeviceSelector::Auto).unwrap();
    let state = session.wait_until_finished().await;

    assert!(
        matches!(state, SessionState::Error(ErrorReason::DecodeFailure(_))),
        "{state:?}"
    );
    assert_eq!(session.frames_published(), 0);
}

#[tokio::test]
async fn test_good_frame_resets_miss_count() {
    let transport = ScriptedTransport::new(vec![
        Step::Frame(bgr_frame(1)),
        Step::Frame(garbage_jpeg()),
        Step::Frame(garbage_jpeg()),
        Step::Frame(bgr_frame(2)),
        Step::Frame(garbage_jpeg()),
        Step::Frame(garbage_jpeg()),
        Step::State(LinkState::Disconnected),
    ]);
    let config = SessionConfig {
        channel_capacity: 16,
        ..SessionConfig::default()
    };
    let session = StreamSession::new(
        transport,
        Arc::new(Identity),
        Arc::new(FrameBuffer::new()),
        config,
    );

    session.start(&DeviceSelector::Auto).unwrap();
    assert_eq!(session.wait_until_finished().await, SessionState::Stopped);
    assert_eq!(session.frames_published(), 2);
}

#[tokio::test]
async fn test_disconnect_while_connecting_is_an_error() {
    let transport = ScriptedTransport::new(vec![Step::State(LinkState::Disconnected), Step::Hold]);
    let session = session_with(transport);

    session.start(&DeviceSelector::Auto).unwrap();
    assert_eq!(
        session.wait_until_finished().await,
        SessionState::Error(ErrorReason::Disconnected)
    );
}

#[tokio::test]
async fn test_transport_going_away_ends_session() {
    // script ends without a disconnect signal; the sink is dropped with the thread
    let transport = ScriptedTransport::new(vec![Step::Frame(bgr_frame(7))]);
    let session = session_with(transport);

    session.start(&DeviceSelector::Auto).unwrap();
    assert_eq!(session.wait_until_finished().await, SessionState::Stopped);
    assert_eq!(session.frames_published(), 1);
}

#[tokio::test]
async fn test_transport_failure_surfaces_reason() {
    let transport = ScriptedTransport::new(vec![
        Step::State(LinkState::Connected),
        Step::State(LinkState::Failed("usb unplugged".into())),
        Step::Hold,
    ]);
    let session = session_with(transport);

    session.start(&DeviceSelector::Auto).unwrap();
    assert_eq!(
        session.wait_until_finished().await,
        SessionState::Error(ErrorReason::Transport("usb unplugged".into()))
    );
}

#[tokio::test]
async fn test_connected_signal_activates_without_frames() {
    let transport = ScriptedTransport::new(vec![Step::State(LinkState::Connected), Step::Hold]);
    let session = session_with(transport.clone());

    session.start(&DeviceSelector::Auto).unwrap();
    session.wait_for(|s| *s == SessionState::Active).await;
    assert_eq!(
        session.snapshots().capture().unwrap_err(),
        SnapshotError::NotAvailable
    );

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_subscribe_failure() {
    let session = StreamSession::from_config(Arc::new(FailingTransport), SessionConfig::default());

    let err = session
        .start(&DeviceSelector::Path("/dev/video9".into()))
        .unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)));
    assert!(matches!(
        session.state(),
        SessionState::Error(ErrorReason::Transport(_))
    ));
}

#[tokio::test]
async fn test_stop_twice_is_a_noop() {
    let transport = ScriptedTransport::new(vec![Step::State(LinkState::Connected), Step::Hold]);
    let session = session_with(transport.clone());

    session.start(&DeviceSelector::Auto).unwrap();
    session.wait_for(|s| *s == SessionState::Active).await;

    session.stop();
    session.stop();

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(transport.released(), 1);

    // the loop exits on its own and must not release again
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_while_subscribing_releases_late_handle() {
    let (transport, entered, open) = GatedTransport::new();
    let session = Arc::new(StreamSession::from_config(
        transport.clone(),
        SessionConfig::default(),
    ));

    let starting = {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.start(&DeviceSelector::Auto))
    };
    entered.recv_async().await.unwrap();

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    // no handle yet, nothing to release
    assert_eq!(transport.released(), 0);

    open.send(()).unwrap();
    starting.await.unwrap().unwrap();

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(transport.released(), 1);
}

#[tokio::test]
async fn test_stop_before_start() {
    let transport = ScriptedTransport::silent();
    let session = session_with(transport.clone());

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(transport.released(), 0);
}

#[tokio::test]
async fn test_terminal_states_stick() {
    let transport = ScriptedTransport::new(vec![Step::State(LinkState::Disconnected), Step::Hold]);
    let session = session_with(transport.clone());

    session.start(&DeviceSelector::Auto).unwrap();
    let terminal = session.wait_until_finished().await;
    assert!(terminal.is_terminal());

    assert!(matches!(
        session.start(&DeviceSelector::Auto),
        Err(SessionError::AlreadyStarted(_))
    ));
    session.stop();
    assert_eq!(session.state(), terminal);
    assert_eq!(transport.subscribed.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let session = session_with(ScriptedTransport::silent());
    session.start(&DeviceSelector::Auto).unwrap();

    let err = session.start(&DeviceSelector::Auto).unwrap_err();
    assert!(matches!(err, SessionError::AlreadyStarted(SessionState::Connecting)));
    session.stop();
}

#[test]
fn test_start_needs_runtime() {
    let session = session_with(ScriptedTransport::silent());
    assert!(matches!(
        session.start(&DeviceSelector::Auto),
        Err(SessionError::NoRuntime)
    ));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_dropping_session_releases_subscription() {
    let transport = ScriptedTransport::new(vec![Step::State(LinkState::Connected), Step::Hold]);
    {
        let session = session_with(transport.clone());
        session.start(&DeviceSelector::Auto).unwrap();
        session.wait_for(|s| *s == SessionState::Active).await;
    }
    assert_eq!(transport.released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pattern_source_end_to_end() {
    let transport = Arc::new(PatternTransport::new(32, 8, 120));
    let session = StreamSession::from_config(transport.clone(), SessionConfig::default());
    let snapshots = session.snapshots();

    session.start(&DeviceSelector::Auto).unwrap();
    session.wait_for(|s| *s == SessionState::Active).await;

    let mut fresh = None;
    for _ in 0..100 {
        if let Ok(snapshot) = snapshots.capture_fresh() {
            fresh = Some(snapshot);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = fresh.expect("no frame within a second");
    assert_eq!(snapshot.shape(), (8, 32, 3));

    session.stop();
    assert_eq!(transport.active_subscriptions(), 0);
    assert_eq!(session.state(), SessionState::Stopped);
}
