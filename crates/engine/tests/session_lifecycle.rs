//! Session start/stop behaviour: handshake failures, teardown while a read
//! is parked, pulls racing teardown, and reaping.

mod common;

use common::{wait_until, Harness, StreamPeer};
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vs_engine::{
    encode_packet, CodecKind, EngineConfig, EngineError, HeadlessSurface, SessionManager,
    SessionPhase, SyntheticBackend,
};

#[test]
fn connect_to_closed_port_fails_without_leaking() {
    let harness = Harness::new();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let err = harness
        .manager
        .start(&format!("tcp://127.0.0.1:{port}"))
        .unwrap_err();
    assert!(matches!(err, EngineError::ConnectFailed { .. }), "{err}");

    assert!(harness.manager.is_empty());
    assert!(harness.surface.registered().is_empty());
    assert_eq!(harness.backend.decoders_opened(), 0);

    let metrics = harness.manager.metrics();
    assert_eq!(metrics.active_sessions, 0);
    assert_eq!(metrics.active_buffers, 0);
}

#[test]
fn connect_to_unresponsive_listener_times_out() {
    // A listener that never accepts, with its backlog already full, leaves
    // further SYNs unanswered.
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&bind.into()).unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    let _backlog: Vec<TcpStream> = (0..2)
        .filter_map(|_| TcpStream::connect_timeout(&addr, Duration::from_millis(200)).ok())
        .collect();

    let harness = Harness::with_config(EngineConfig {
        connect_timeout_ms: Some(300),
        ..EngineConfig::default()
    });

    let started = Instant::now();
    let err = harness.manager.start(&format!("tcp://{addr}")).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(err, EngineError::ConnectFailed { .. }), "{err}");

    assert!(harness.manager.is_empty());
    assert!(harness.surface.registered().is_empty());
    assert_eq!(harness.backend.decoders_opened(), 0);
    assert_eq!(harness.manager.metrics().active_sessions, 0);
}

#[test]
fn decoder_open_failure_is_reported() {
    let backend = SyntheticBackend::with_codecs(4, 4, vec![CodecKind::H264]);
    let surface = Arc::new(HeadlessSurface::new());
    let manager = SessionManager::new(
        Arc::new(backend.clone()),
        surface.clone(),
        EngineConfig::default(),
    )
    .unwrap();
    let peer = StreamPeer::start();

    let err = manager.start(&peer.address).unwrap_err();
    assert!(matches!(err, EngineError::Decoder(_)), "{err}");
    assert!(manager.is_empty());
    assert!(surface.registered().is_empty());
    assert_eq!(manager.metrics().active_sessions, 0);
}

#[test]
fn stop_unblocks_a_parked_read() {
    let harness = Harness::new();
    let peer = StreamPeer::start();
    let id = harness.manager.start(&peer.address).unwrap();
    assert_eq!(harness.manager.phase(id), Some(SessionPhase::Decoding));

    // The session thread is now blocked in read with nothing to receive.
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    harness.manager.stop(id);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(harness.manager.phase(id).is_none());

    let started = Instant::now();
    harness.manager.shutdown();
    assert!(started.elapsed() < Duration::from_secs(5));

    let metrics = harness.manager.metrics();
    assert_eq!(metrics.threads_reaped, 1);
    assert_eq!(metrics.active_sessions, 0);
    assert_eq!(harness.backend.decoders_closed(), 1);
}

#[test]
fn stop_is_idempotent() {
    let harness = Harness::new();
    let peer = StreamPeer::start();
    let id = harness.manager.start(&peer.address).unwrap();
    let surface_id = harness.manager.surface_id(id).unwrap();

    harness.manager.stop(id);
    harness.manager.stop(id);
    harness.manager.stop_all();

    assert!(!harness.surface.is_registered(surface_id));
    harness.manager.shutdown();
    assert_eq!(harness.manager.metrics().threads_reaped, 1);
}

#[test]
fn concurrent_stops_while_rendering_tear_down_once() {
    let harness = Harness::new();
    let peers: Vec<StreamPeer> = (0..3)
        .map(|_| StreamPeer::flood(encode_packet(0, false, &[5, 5, 5, 5]).unwrap()))
        .collect();
    let ids: Vec<_> = peers
        .iter()
        .map(|peer| harness.manager.start(&peer.address).unwrap())
        .collect();
    for id in &ids {
        assert!(wait_until(|| harness.manager.pull(*id).is_some()));
    }

    let rendering = AtomicBool::new(true);
    thread::scope(|scope| {
        let manager = &harness.manager;
        let ids = &ids;
        let rendering = &rendering;

        let renderer = scope.spawn(move || {
            let mut scratch = Vec::new();
            while rendering.load(Ordering::SeqCst) {
                for id in ids {
                    if let Some(view) = manager.pull(*id) {
                        view.copy_to(&mut scratch);
                        assert_eq!(scratch.len(), 4 * 4 * 4);
                    }
                }
            }
        });

        let stoppers: Vec<_> = (0..8)
            .map(|n| {
                scope.spawn(move || {
                    if n % 2 == 0 {
                        manager.stop_all();
                    } else {
                        for id in ids {
                            manager.stop(*id);
                        }
                    }
                })
            })
            .collect();
        for stopper in stoppers {
            stopper.join().unwrap();
        }

        rendering.store(false, Ordering::SeqCst);
        renderer.join().unwrap();
    });

    assert!(harness.manager.is_empty());
    assert!(harness.surface.registered().is_empty());
    for id in &ids {
        assert!(harness.manager.pull(*id).is_none());
    }

    harness.manager.shutdown();
    let metrics = harness.manager.metrics();
    assert_eq!(metrics.threads_reaped, 3);
    assert_eq!(metrics.active_sessions, 0);
    assert_eq!(metrics.active_buffers, 0);
    assert_eq!(harness.backend.decoders_closed(), 3);
}

#[test]
fn pulls_racing_teardown_never_see_a_frame_afterwards() {
    let harness = Harness::new();
    let peer = StreamPeer::flood(encode_packet(0, false, &[5, 5, 5, 5]).unwrap());
    let id = harness.manager.start(&peer.address).unwrap();
    let surface_id = harness.manager.surface_id(id).unwrap();
    let source = harness.surface.source(surface_id).unwrap();

    assert!(wait_until(|| source.pull().is_some()));

    let running = Arc::new(AtomicBool::new(true));
    let pulls = Arc::new(AtomicU64::new(0));
    let renderer = {
        let source = source.clone();
        let running = Arc::clone(&running);
        let pulls = Arc::clone(&pulls);
        thread::spawn(move || {
            let mut scratch = Vec::new();
            while running.load(Ordering::SeqCst) {
                if let Some(view) = source.pull() {
                    view.copy_to(&mut scratch);
                    assert_eq!(scratch.len(), 4 * 4 * 4);
                    assert!(scratch.chunks_exact(4).all(|p| p == [20, 20, 20, 255]));
                }
                pulls.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    // Hold a view across the stop: it must stay readable.
    let held = source.pull().unwrap();
    thread::sleep(Duration::from_millis(20));

    harness.manager.stop(id);
    assert!(source.pull().is_none());
    assert!(harness.manager.pull(id).is_none());
    assert_eq!(held.pixels()[0], 20);

    thread::sleep(Duration::from_millis(20));
    running.store(false, Ordering::SeqCst);
    renderer.join().unwrap();
    assert!(pulls.load(Ordering::Relaxed) > 0);
    assert!(source.pull().is_none());

    drop(held);
    harness.manager.shutdown();
    let metrics = harness.manager.metrics();
    assert_eq!(metrics.active_sessions, 0);
    assert_eq!(metrics.active_buffers, 0);
}

#[test]
fn many_sessions_run_and_stop_together() {
    let harness = Harness::new();
    let peers: Vec<StreamPeer> = (0..4).map(|_| StreamPeer::start()).collect();

    let ids: Vec<_> = peers
        .iter()
        .map(|peer| harness.manager.start(&peer.address).unwrap())
        .collect();
    assert_eq!(harness.manager.session_ids(), ids);
    assert_eq!(harness.manager.metrics().active_sessions, 4);

    for (n, peer) in peers.iter().enumerate() {
        peer.send_packet(n as u64, false, &[n as u8 + 1]);
    }
    for (n, id) in ids.iter().enumerate() {
        assert!(wait_until(|| harness.manager.pull(*id).is_some()));
        let view = harness.manager.pull(*id).unwrap();
        assert_eq!(view.pixels()[0], n as u8 + 1);
    }

    harness.manager.stop_all();
    assert!(harness.manager.is_empty());
    assert!(harness.surface.registered().is_empty());

    harness.manager.shutdown();
    let metrics = harness.manager.metrics();
    assert_eq!(metrics.threads_reaped, 4);
    assert_eq!(metrics.active_sessions, 0);
    assert_eq!(harness.backend.decoders_opened(), 4);
    assert_eq!(harness.backend.decoders_closed(), 4);
}
