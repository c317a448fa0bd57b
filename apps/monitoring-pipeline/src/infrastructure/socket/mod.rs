//! Push Link Adapter
//!
//! WebSocket implementation of the transport port:
//!
//! - `messages`: wire payload types
//! - `codec`: frame decoding and request encoding
//! - `heartbeat`: application-level ping/pong supervision
//! - `client`: the transport itself

pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod messages;

pub use client::{WebSocketConfig, WebSocketTransport};
pub use codec::{CodecError, Frame, FrameCodec, parse_severity, parse_status, severity_str, status_str};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
