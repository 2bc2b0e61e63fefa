//! Integration tests: rendezvous server and audio bridge on loopback.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use micphone_audio::mock::{MockMixingGroup, MockMixingGroupHandle};
use micphone_audio::{MixingGroup, SoftwareMixer};
use micphone_rendezvous::{BridgeHandler, RendezvousConfig, RendezvousServer, ServerEvent};
use micphone_types::FailureKind;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> RendezvousConfig {
    RendezvousConfig {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

fn start() -> (
    Arc<RendezvousServer>,
    UnboundedReceiver<ServerEvent>,
    Arc<BridgeHandler>,
    MockMixingGroupHandle,
) {
    let group = MockMixingGroup::new();
    let handle = group.handle();
    let handler = Arc::new(BridgeHandler::new(Arc::new(group)));
    let (server, events) = RendezvousServer::start(loopback(), handler.clone()).unwrap();
    (Arc::new(server), events, handler, handle)
}

fn connect(port: u16) -> TcpStream {
    TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap()
}

fn drain(events: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// The accept thread owns the only event sender, so a disconnected channel
/// means the thread has exited.
fn assert_thread_exited(events: &mut UnboundedReceiver<ServerEvent>) {
    assert!(matches!(events.try_recv(), Err(TryRecvError::Disconnected)));
}

#[test]
fn port_is_unassigned_until_bound_then_fixed() {
    let (server, mut events, _handler, handle) = start();

    let early = server.local_port();
    let port = server.wait_for_port(WAIT).expect("port assigned");
    assert!(early.is_none() || early == Some(port));
    assert!(matches!(events.blocking_recv(), Some(ServerEvent::Listening(p)) if p == port));

    // Sessions never move the port.
    let _a = connect(port);
    let _b = connect(port);
    assert!(handle.wait_for_joins(2, WAIT));
    assert_eq!(server.local_port(), Some(port));

    server.tear_down();
    assert_eq!(server.local_port(), Some(port));
}

#[test]
fn accepted_connection_joins_mix_as_receive_only() {
    let (server, mut events, handler, handle) = start();
    let port = server.wait_for_port(WAIT).unwrap();

    let mut client = connect(port);
    client.write_all(&[0, 1, 2, 3]).unwrap();
    assert!(handle.wait_for_joins(1, WAIT));

    let joined = handle.joined();
    assert_eq!(joined[0].mode, micphone_audio::StreamMode::ReceiveOnly);
    assert_eq!(joined[0].remote.port(), client.local_addr().unwrap().port());
    assert_eq!(handler.active_sessions(), 1);

    assert!(matches!(events.blocking_recv(), Some(ServerEvent::Listening(_))));
    assert!(matches!(
        events.blocking_recv(),
        Some(ServerEvent::SessionStarted { stream, .. }) if stream == joined[0].id
    ));
    server.tear_down();
}

#[test]
fn tear_down_twice_is_a_no_op() {
    let (server, mut events, _handler, _handle) = start();
    server.wait_for_port(WAIT).unwrap();

    server.tear_down();
    assert!(!server.is_running());
    server.tear_down();
    assert!(!server.is_running());

    let stopped = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::Stopped))
        .count();
    assert_eq!(stopped, 1);
    assert_thread_exited(&mut events);
}

#[test]
fn concurrent_tear_down_waits_for_thread_exit() {
    let (server, mut events, _handler, _handle) = start();
    server.wait_for_port(WAIT).unwrap();

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let server = Arc::clone(&server);
            std::thread::spawn(move || {
                server.tear_down();
                server.is_running()
            })
        })
        .collect();
    for caller in callers {
        assert!(!caller.join().unwrap());
    }
    // Every caller returned after the thread was gone.
    let seen = drain(&mut events);
    assert!(matches!(seen.last(), Some(ServerEvent::Stopped)));
    assert_thread_exited(&mut events);
}

#[test]
fn tear_down_unblocks_accept_and_stops_accepting() {
    let (server, mut events, _handler, handle) = start();
    let port = server.wait_for_port(WAIT).unwrap();
    assert!(server.is_running());

    // The accept thread is parked in accept with no peer in sight.
    std::thread::sleep(Duration::from_millis(20));
    server.tear_down();
    assert!(!server.is_running());

    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err());
    assert!(handle.joined().is_empty());

    let seen = drain(&mut events);
    assert!(matches!(seen.last(), Some(ServerEvent::Stopped)));
    assert!(!seen.iter().any(|e| matches!(e, ServerEvent::Faulted(_))));
    assert_thread_exited(&mut events);
}

#[test]
fn connection_accepted_before_tear_down_completes_its_join() {
    let (server, mut events, handler, handle) = start();
    let port = server.wait_for_port(WAIT).unwrap();

    handle.close_gate();
    let _client = connect(port);
    assert!(handle.wait_for_blocked_join(WAIT));

    let tearing = {
        let server = Arc::clone(&server);
        std::thread::spawn(move || server.tear_down())
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!tearing.is_finished(), "teardown must wait for the in-flight join");

    handle.open_gate();
    tearing.join().unwrap();

    assert_eq!(handle.joined().len(), 1);
    assert_eq!(handler.active_sessions(), 1);
    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, ServerEvent::SessionStarted { .. })));
    assert!(matches!(seen.last(), Some(ServerEvent::Stopped)));
    assert_thread_exited(&mut events);
}

#[test]
fn join_failure_keeps_server_accepting() {
    let (server, mut events, handler, handle) = start();
    let port = server.wait_for_port(WAIT).unwrap();

    handle.fail_joins(true);
    let _rejected = connect(port);
    let deadline = Instant::now() + WAIT;
    let mut failed = false;
    while !failed && Instant::now() < deadline {
        match events.try_recv() {
            Ok(ServerEvent::BridgeFailed { error, .. }) => {
                assert_eq!(error.kind(), Some(FailureKind::AudioJoinFailure));
                failed = true;
            }
            Ok(_) => {}
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    assert!(failed);
    assert!(server.is_running());

    handle.fail_joins(false);
    let _accepted = connect(port);
    assert!(handle.wait_for_joins(1, WAIT));
    assert_eq!(handler.active_sessions(), 1);

    server.tear_down();
    assert_eq!(handler.detach_all(), 1);
    assert_eq!(handle.left().len(), 1);
}

#[test]
fn bind_failure_faults_without_a_port() {
    let group = MockMixingGroup::new();
    let handler = Arc::new(BridgeHandler::new(Arc::new(group)));
    // TEST-NET-1 is never a local address.
    let config = RendezvousConfig {
        bind: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
    };
    let (server, mut events) = RendezvousServer::start(config, handler).unwrap();

    match events.blocking_recv() {
        Some(ServerEvent::Faulted(error)) => {
            assert_eq!(error.kind(), Some(FailureKind::BindOrAcceptFailure));
        }
        other => panic!("expected Faulted, got {other:?}"),
    }
    assert_eq!(server.local_port(), None);
    server.tear_down();
    assert!(!server.is_running());
    assert!(events.blocking_recv().is_none());
}

#[test]
fn peer_hang_up_releases_its_session() {
    let mixer = Arc::new(SoftwareMixer::default());
    let handler = Arc::new(BridgeHandler::new(mixer.clone()));
    let (server, mut events) = RendezvousServer::start(loopback(), handler.clone()).unwrap();
    let port = server.wait_for_port(WAIT).unwrap();

    let mut leaving = connect(port);
    leaving.write_all(&[5, 0, 6, 0]).unwrap();
    let _staying = connect(port);
    drop(leaving);

    // Mixing drains the hung-up stream; the group then reports it ended.
    let deadline = Instant::now() + WAIT;
    let mut frame = [0i16; 64];
    let mut started = Vec::new();
    let ended = loop {
        assert!(Instant::now() < deadline, "session never ended");
        mixer.mix_into(&mut frame);
        match events.try_recv() {
            Ok(ServerEvent::SessionStarted { stream, .. }) => started.push(stream),
            Ok(ServerEvent::SessionEnded { stream, .. }) => break stream,
            Ok(_) => {}
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    };
    assert_eq!(started.first(), Some(&ended));
    assert_eq!(handler.active_sessions(), 1);
    assert_eq!(mixer.stream_count(), 1);

    server.tear_down();
    assert_eq!(handler.detach_all(), 1);
    assert_eq!(mixer.stream_count(), 0);
}
