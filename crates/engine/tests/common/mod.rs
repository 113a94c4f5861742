//! Loopback stream peers for the session integration tests.

#![allow(dead_code)]

use crossbeam::channel::{self, Sender};
use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use vs_engine::{
    encode_packet, EngineConfig, HeadlessSurface, SessionManager, SyntheticBackend,
};

/// A TCP peer that accepts one connection and writes whatever the test
/// sends it. Dropping the sender side closes the connection.
pub struct StreamPeer {
    pub address: String,
    tx: Option<Sender<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamPeer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("tcp://{}", listener.local_addr().unwrap());
        let (tx, rx) = channel::unbounded::<Vec<u8>>();

        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            for bytes in rx.iter() {
                if stream.write_all(&bytes).is_err() {
                    return;
                }
            }
        });

        Self {
            address,
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// A peer that writes `packet` in a loop until the session hangs up.
    pub fn flood(packet: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("tcp://{}", listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            while stream.write_all(&packet).is_ok() {
                thread::sleep(Duration::from_micros(200));
            }
        });

        Self {
            address,
            tx: None,
            handle: Some(handle),
        }
    }

    pub fn send(&self, bytes: Vec<u8>) {
        if let Some(tx) = &self.tx {
            tx.send(bytes).unwrap();
        }
    }

    pub fn send_packet(&self, pts: u64, is_config: bool, payload: &[u8]) {
        self.send(encode_packet(pts, is_config, payload).unwrap());
    }

    /// Close the connection after everything queued so far was written.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for StreamPeer {
    fn drop(&mut self) {
        // Detach: a peer nobody connected to would block in accept forever.
        self.tx.take();
    }
}

pub struct Harness {
    pub backend: SyntheticBackend,
    pub surface: Arc<HeadlessSurface>,
    pub manager: SessionManager<SyntheticBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let backend = SyntheticBackend::new(4, 4);
        let surface = Arc::new(HeadlessSurface::new());
        let manager = SessionManager::new(Arc::new(backend.clone()), surface.clone(), config).unwrap();
        Self {
            backend,
            surface,
            manager,
        }
    }

    pub fn frames_published(&self) -> u64 {
        self.manager.metrics().frames_published
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
