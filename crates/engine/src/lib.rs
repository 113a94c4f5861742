//! Embedded low-latency video session engine.
//!
//! Each session reads a framed, compressed elementary stream over TCP on its
//! own thread, decodes it, converts every frame to RGBA and exposes the most
//! recent one to a pull-based render surface:
//!
//! ```text
//! TCP ─► WireFramer ─► DecodeEngine ─► ColorConverter ─► FrameHandoff ─► pull()
//! ```
//!
//! [`SessionManager`] is the entry point. Codecs plug in through
//! [`CodecBackend`]; the FFmpeg backend is behind the `ffmpeg` feature and
//! [`SyntheticBackend`] is always available.

pub mod codec;
pub mod config;
pub mod convert;
pub mod decode;
pub mod error;
pub mod framer;
pub mod handoff;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod reaper;
pub mod session;
pub mod surface;
pub mod transport;

#[cfg(feature = "ffmpeg")]
pub use codec::FfmpegBackend;
pub use codec::{CodecBackend, SyntheticBackend};
pub use config::{CodecKind, EngineConfig};
pub use error::{ConvertError, DecodeError, EngineError, FramingError};
pub use framer::{encode_packet, CodedPacket, WireFramer};
pub use handoff::FrameView;
pub use manager::SessionManager;
pub use metrics::{EngineContext, EngineMetrics, MetricsSnapshot};
pub use session::{EndReason, SessionId, SessionPhase};
pub use surface::{FrameSource, HeadlessSurface, RenderSurface, SurfaceId};
pub use transport::StreamAddress;
