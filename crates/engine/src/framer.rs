//! Incremental decoder for the coded packet stream.
//!
//! Every packet on the wire is a 12-byte big-endian header followed by the
//! payload:
//!
//! ```text
//! offset  size  field
//!      0     8  presentation timestamp, top bit = config packet flag
//!      8     4  payload length in bytes
//!     12     N  payload (coded video or parameter sets)
//! ```
//!
//! The framer is fed arbitrary chunks as they come off the socket and yields
//! whole [`CodedPacket`]s. It is driven by exactly one thread per session.

use byteorder::{BigEndian, ByteOrder};
use tracing::{trace, warn};

use crate::config::{DEFAULT_MAX_BUFFERED_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::error::FramingError;

/// Size of the packet header on the wire.
pub const HEADER_LEN: usize = 12;

/// Top bit of the timestamp field marks a config/parameter-set packet.
pub const CONFIG_FLAG: u64 = 1 << 63;

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Timestamp with the config bit stripped.
    pub pts: u64,
    pub is_config: bool,
    pub payload_len: u32,
}

impl PacketHeader {
    pub const SIZE: usize = HEADER_LEN;

    pub fn new(pts: u64, is_config: bool, payload_len: u32) -> Self {
        Self {
            pts: pts & !CONFIG_FLAG,
            is_config,
            payload_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let raw_pts = if self.is_config {
            self.pts | CONFIG_FLAG
        } else {
            self.pts
        };
        BigEndian::write_u64(&mut buf[0..8], raw_pts);
        BigEndian::write_u32(&mut buf[8..12], self.payload_len);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        let raw_pts = BigEndian::read_u64(&buf[0..8]);
        let payload_len = BigEndian::read_u32(&buf[8..12]);

        Some(Self {
            pts: raw_pts & !CONFIG_FLAG,
            is_config: raw_pts & CONFIG_FLAG != 0,
            payload_len,
        })
    }
}

/// One framed unit of the coded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedPacket {
    pub pts: u64,
    pub is_config: bool,
    pub payload: Vec<u8>,
}

/// Serialize a packet the way a stream producer would put it on the wire.
pub fn encode_packet(pts: u64, is_config: bool, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let length = wire_length(payload.len())?;
    let header = PacketHeader::new(pts, is_config, length);
    let mut msg = Vec::with_capacity(HEADER_LEN + payload.len());
    msg.extend_from_slice(&header.to_bytes());
    msg.extend_from_slice(payload);
    Ok(msg)
}

fn wire_length(len: usize) -> Result<u32, FramingError> {
    u32::try_from(len).map_err(|_| FramingError::PayloadUnencodable { length: len })
}

/// Result of handing a chunk to the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Buffered,
    /// Unparsed bytes crossed the buffering limit and were dropped; parsing
    /// restarts with the next byte received.
    Overflowed { discarded: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    ReadingHeader,
    ReadingPayload(PacketHeader),
}

/// Stateful header/payload state machine.
pub struct WireFramer {
    buffer: Vec<u8>,
    cursor: usize,
    state: FramerState,
    max_payload_bytes: u32,
    max_buffered_bytes: usize,
    overflow_resets: u64,
}

impl Default for WireFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_BUFFERED_BYTES)
    }
}

impl WireFramer {
    pub fn new(max_payload_bytes: u32, max_buffered_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            cursor: 0,
            state: FramerState::ReadingHeader,
            max_payload_bytes,
            max_buffered_bytes,
            overflow_resets: 0,
        }
    }

    /// Append bytes received from the transport.
    pub fn feed(&mut self, chunk: &[u8]) -> FeedOutcome {
        self.buffer.extend_from_slice(chunk);

        let pending = self.buffered_len();
        if pending > self.max_buffered_bytes {
            warn!(
                pending,
                limit = self.max_buffered_bytes,
                "Framer buffer overflow, discarding unparsed bytes"
            );
            self.reset();
            self.overflow_resets += 1;
            return FeedOutcome::Overflowed { discarded: pending };
        }

        FeedOutcome::Buffered
    }

    /// Pull the next complete packet, or `Ok(None)` if more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<CodedPacket>, FramingError> {
        loop {
            match self.state {
                FramerState::ReadingHeader => {
                    let header = match PacketHeader::from_bytes(&self.buffer[self.cursor..]) {
                        Some(header) => header,
                        None => {
                            self.compact();
                            return Ok(None);
                        }
                    };
                    self.cursor += HEADER_LEN;

                    if header.payload_len > self.max_payload_bytes {
                        self.reset();
                        return Err(FramingError::PayloadTooLarge {
                            length: header.payload_len,
                            limit: self.max_payload_bytes,
                        });
                    }

                    if header.payload_len == 0 {
                        trace!(pts = header.pts, "Empty packet");
                        continue;
                    }

                    self.state = FramerState::ReadingPayload(header);
                }
                FramerState::ReadingPayload(header) => {
                    let needed = header.payload_len as usize;
                    if self.buffered_len() < needed {
                        self.compact();
                        return Ok(None);
                    }

                    let end = self.cursor + needed;
                    let payload = self.buffer[self.cursor..end].to_vec();
                    self.cursor = end;
                    self.state = FramerState::ReadingHeader;

                    return Ok(Some(CodedPacket {
                        pts: header.pts,
                        is_config: header.is_config,
                        payload,
                    }));
                }
            }
        }
    }

    /// Iterate over the packets that are complete in the current buffer.
    pub fn packets(&mut self) -> Packets<'_> {
        Packets { framer: self }
    }

    /// Bytes received but not yet emitted as part of a packet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    pub fn overflow_resets(&self) -> u64 {
        self.overflow_resets
    }

    /// Drop everything buffered and wait for a fresh header.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.state = FramerState::ReadingHeader;
    }

    fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        if self.cursor == self.buffer.len() {
            self.buffer.clear();
        } else {
            self.buffer.drain(..self.cursor);
        }
        self.cursor = 0;
    }
}

/// Iterator returned by [`WireFramer::packets`].
pub struct Packets<'a> {
    framer: &'a mut WireFramer,
}

impl Iterator for Packets<'_> {
    type Item = Result<CodedPacket, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_packet().transpose()
    }
}
