//! Fixed-layout packet header codec and the pooled packet buffers.

use crate::{
    HEADER_SIZE,
    RECV_BUFFER_SIZE,
};
use bytes::{
    Buf,
    BufMut,
};
use std::{
    alloc::{
        self,
        Layout,
    },
    cell::RefCell,
    rc::Rc,
};

/// Version byte carried by every packet; anything else is dropped.
pub const PROTOCOL_VERSION: u8 = 1;

pub struct Command;

#[rustfmt::skip]
impl Command {
    pub const NOOP: u8 = 0;
        // no payload; carries piggybacked acks when nothing else is queued

    pub const CLOSE: u8 = 1;
        // no payload; sender is tearing the session down

    pub const CONN_REQ: u8 = 2;
        // no payload; always a bare header

    pub const CONN_RSP: u8 = 3;
        // accepted: u32, nonzero means the connection was accepted

    pub const PING: u8 = 4;
        // timestamp: i64, sender monotonic milliseconds

    pub const PONG: u8 = 5;
        // timestamp: i64, echoed from the PING verbatim

    pub const APP: u8 = 16;
        // commands APP..=255 carry application data on channel (command - APP)
}

pub struct Opt;

impl Opt {
    pub const RELIABLE: u8 = 1;
    pub const RETRANSMITTED: u8 = 2;
    pub const ACK: u8 = 4;
}

/// The decoded packet header. The `reserved` wire byte is always written as
/// zero and never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub command: u8,
    pub opt: u8,
    pub reliable_seq: u16,
    pub unreliable_seq: u16,
    pub reliable_ack: u16,
    pub segment_index: u16,
    pub segments_size: u16,
}

impl Header {
    pub fn new(command: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
            opt: 0,
            reliable_seq: 0,
            unreliable_seq: 0,
            reliable_ack: 0,
            segment_index: 0,
            segments_size: 1,
        }
    }

    /// Write the header into the first [`HEADER_SIZE`] bytes of `buf`.
    /// All multi-byte fields are big-endian.
    pub fn encode(&self, mut buf: &mut [u8]) {
        buf.put_u8(self.version);
        buf.put_u8(self.command);
        buf.put_u8(self.opt);
        buf.put_u8(0);
        buf.put_u16(self.reliable_seq);
        buf.put_u16(self.unreliable_seq);
        buf.put_u16(self.reliable_ack);
        buf.put_u16(self.segment_index);
        buf.put_u16(self.segments_size);
    }

    /// Read a header back from a datagram. Returns `None` when the datagram
    /// is shorter than a header.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }

        let version = buf.get_u8();
        let command = buf.get_u8();
        let opt = buf.get_u8();
        buf.advance(1);

        Some(Self {
            version,
            command,
            opt,
            reliable_seq: buf.get_u16(),
            unreliable_seq: buf.get_u16(),
            reliable_ack: buf.get_u16(),
            segment_index: buf.get_u16(),
            segments_size: buf.get_u16(),
        })
    }

    pub fn is_reliable(&self) -> bool {
        self.opt & Opt::RELIABLE != 0
    }

    pub fn is_retransmitted(&self) -> bool {
        self.opt & Opt::RETRANSMITTED != 0
    }

    pub fn has_ack(&self) -> bool {
        self.opt & Opt::ACK != 0
    }
}

type BufferBox = Box<[u8; RECV_BUFFER_SIZE]>;

fn allocate_buffer() -> BufferBox {
    // SAFETY: fast and safe way to get Box of [0u8; RECV_BUFFER_SIZE]
    // without copying stack to heap (as would be with Box::new())
    // https://doc.rust-lang.org/std/boxed/index.html#memory-layout
    unsafe {
        let layout = Layout::new::<[u8; RECV_BUFFER_SIZE]>();
        let ptr = alloc::alloc_zeroed(layout);
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Box::from_raw(ptr.cast())
    }
}

/// Free list of packet buffers. One pool serves every peer of an endpoint;
/// buffers return to the list when their [`PooledBuffer`] handle drops.
pub struct BufferPool {
    free: RefCell<Vec<BufferBox>>,
}

impl BufferPool {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            free: RefCell::new(Vec::new()),
        })
    }

    pub fn take(self: &Rc<Self>) -> PooledBuffer {
        let buffer = self
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(allocate_buffer);

        PooledBuffer {
            buffer: Some(buffer),
            len: 0,
            pool: Rc::clone(self),
        }
    }

    fn put(&self, buffer: BufferBox) {
        self.free.borrow_mut().push(buffer);
    }
}

/// A packet buffer checked out of the pool, carrying the used length.
pub struct PooledBuffer {
    buffer: Option<BufferBox>,
    len: usize,
    pool: Rc<BufferPool>,
}

impl PooledBuffer {
    pub fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    /// The whole underlying buffer, regardless of the used length.
    pub fn capacity_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut().unwrap().as_mut_slice()
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buffer.as_ref().unwrap()[.. self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.put(buffer);
        }
    }
}
