//! Loopback test-pattern streamer for `--synthetic` runs without URLs.

use anyhow::{Context, Result};
use std::io::Write;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use vs_engine::codec::dim_payload;
use vs_engine::encode_packet;

/// Listen on an ephemeral loopback port and stream synthetic packets to the
/// first client at `fps`. Returns the `tcp://` address to start a session on.
pub fn spawn_demo_stream(width: u16, height: u16, fps: u32) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").context("Failed to bind demo streamer")?;
    let address = format!("tcp://{}", listener.local_addr()?);
    let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    let config_packet = encode_packet(0, true, &dim_payload(width, height))?;

    thread::Builder::new()
        .name("vs-demo-stream".into())
        .spawn(move || {
            let (mut stream, peer) = match listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("Demo streamer accept failed: {}", e);
                    return;
                }
            };
            info!(%peer, "Demo streamer connected");

            if stream.write_all(&config_packet).is_err() {
                return;
            }

            let mut pts: u64 = 0;
            loop {
                let payload = [(pts % 251) as u8; 16];
                let Ok(packet) = encode_packet(pts, false, &payload) else {
                    return;
                };
                if stream.write_all(&packet).is_err() {
                    debug!(frames = pts, "Demo streamer: client went away");
                    return;
                }
                pts += 1;
                thread::sleep(interval);
            }
        })
        .context("Failed to spawn demo streamer")?;

    Ok(address)
}
