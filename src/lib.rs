//! A message-oriented transport protocol implementation.
//! The protocol is a thin layer above UDP.
//! It is connection-oriented with the client-server peer relationship.
//!
//! The design goals are:
//!
//! 1. Reliable, in-order, exactly-once message transmission, interleaved
//!    with best-effort unreliable messages in the same stream.
//! 2. Transparent splitting and reassembly of messages larger than one
//!    datagram.
//! 3. Built-in liveness: RTT estimation with back-off retransmission,
//!    keepalive probing and peer-drop detection.
//! 4. Simplicity.
//!
//! A [`server::Server`] multiplexes any number of peers on one socket;
//! a [`client::Client`] tracks exactly one peer. Both are driven by polling
//! their `next_event()` future in a loop; all retransmission and keepalive
//! scheduling happens inside those polls.

use std::{
    fmt,
    io::Error as StdIoError,
    mem,
    time::Instant,
};

pub mod client;
mod endpoint;
mod packet;
mod peer;
pub mod server;

pub use peer::Timeouts;

/// Size of the receive buffer, and therefore the largest datagram the
/// protocol will ever produce or accept.
pub const RECV_BUFFER_SIZE: usize = 1500;

/// Size of the fixed packet header preceding every payload.
pub const HEADER_SIZE: usize = 4 * mem::size_of::<u8>() // version, command, opt, reserved
    + mem::size_of::<u16>() // reliable_seq
    + mem::size_of::<u16>() // unreliable_seq
    + mem::size_of::<u16>() // reliable_ack
    + mem::size_of::<u16>() // segment_index
    + mem::size_of::<u16>(); // segments_size

/// Maximum amount of data bytes that fits into one datagram.
/// Larger messages are split into segments of this size.
pub const MAX_SEGMENT_DATA: usize = RECV_BUFFER_SIZE - HEADER_SIZE;

/// Channel id type. Channels are independent application-level message tags;
/// the protocol itself does not order messages across channels differently.
pub type Channel = u8;

/// Number of channels available to the application.
pub const CHANNELS: usize = (u8::MAX - packet::Command::APP) as usize + 1;

/// The error that can be returned by clients, servers and senders.
#[derive(Debug)]
pub enum Error {
    /// IO error wrapper. Also carries transient `sendto` failures captured
    /// during background flushes, surfaced by the next send call.
    Io(StdIoError),
    /// Bad channel, empty payload or an operation on a dead peer.
    InvalidArgument,
    /// The handshake has not completed yet.
    NotConnected,
    /// The address does not belong to any connected peer.
    UnknownPeer,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotConnected => write!(f, "not connected"),
            Self::UnknownPeer => write!(f, "unknown peer"),
        }
    }
}

impl std::error::Error for Error {}

impl From<StdIoError> for Error {
    fn from(from: StdIoError) -> Self {
        Self::Io(from)
    }
}

/// Monotonic millisecond clock. All protocol timestamps are milliseconds
/// since the owning endpoint was created.
pub(crate) struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

/// Signed distance from `b` to `a` in 16-bit modular sequence space.
pub(crate) fn seq_delta(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

#[cfg(test)]
mod tests {
    use super::seq_delta;

    #[test]
    fn seq_delta_wraps() {
        assert_eq!(seq_delta(1, 0xFFFF), 2);
        assert_eq!(seq_delta(0xFFFF, 1), -2);
        assert_eq!(seq_delta(5, 5), 0);
        assert_eq!(seq_delta(0x8000, 0), i16::MIN);
    }
}
