//! Data-plane core of the RuralPipe split-tunnel VPN.
//!
//! One logical layer-3 tunnel is multiplexed across several physical
//! network paths: outbound IP datagrams read from a multi-queue TUN device
//! are batched into tunnel frames, optionally signed, and striped across
//! one or more TCP connections to the peer, which unpacks them back into
//! its own TUN device. The reverse direction is symmetric.
//!
//! Frames travel through a linear, bidirectional pipe chain:
//!
//! ```text
//! TUN queues <-> tunnel <-> compressing <-> signing <-> socket <-> TCP streams
//! ```
//!
//! # Modules
//!
//! - `proto`: tunnel frame wire format, reader and writer
//! - `pipe`: the chain substrate and its attach/detach contract
//! - `compress`, `sign`: the symmetric pass-through stages
//! - `tunnel`: batching of TUN datagrams into frames and back
//! - `socket`: sessions, streams, striping and sequencing
//! - `stream`: length-prefixed frame I/O over one descriptor
//! - `tun`: multi-queue TUN device creation (Linux)
//! - `control`: configuration records and statistics snapshots
//!
//! Connection establishment, configuration parsing and logging transport
//! belong to the client and server binaries, not to this crate.

pub mod compress;
pub mod control;
pub mod fd;
pub mod interrupt;
pub mod ip;
pub mod pipe;
pub mod proto;
pub mod sign;
pub mod socket;
pub mod stream;
pub mod tunnel;

#[cfg(target_os = "linux")]
pub mod tun;

pub use pipe::{PipeError, TunnelFramePipe};
pub use proto::{SessionId, TunnelFrameReader, TunnelFrameWriter, TUNNEL_FRAME_MAX_SIZE};
pub use socket::SocketProducerConsumer;
pub use stream::TunnelFrameStream;
pub use tunnel::TunnelProducerConsumer;
