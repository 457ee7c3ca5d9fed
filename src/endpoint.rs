//! One UDP socket plus the packet buffer pool shared by its peers.

use crate::{
    packet::{
        BufferPool,
        PooledBuffer,
    },
    peer::Sink,
    RECV_BUFFER_SIZE,
};
use log::trace;
use std::{
    io::Error as StdIoError,
    net::SocketAddr,
    rc::Rc,
};
use tokio::net::UdpSocket;

pub(crate) struct Endpoint {
    socket: UdpSocket,
    pool: Rc<BufferPool>,
}

impl Endpoint {
    pub async fn bind(local: SocketAddr) -> Result<Self, StdIoError> {
        let socket = UdpSocket::bind(local).await?;

        Ok(Self {
            socket,
            pool: BufferPool::new(),
        })
    }

    pub fn pool(&self) -> &Rc<BufferPool> {
        &self.pool
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StdIoError> {
        self.socket.local_addr()
    }

    /// Receive exactly one datagram into a pool buffer. On failure the
    /// buffer goes straight back to the pool; the caller decides whether
    /// the error is fatal.
    pub async fn recv(&self) -> Result<(PooledBuffer, SocketAddr), StdIoError> {
        let mut buffer = self.pool.take();
        debug_assert_eq!(buffer.capacity_mut().len(), RECV_BUFFER_SIZE);

        let (len, source) = self.socket.recv_from(buffer.capacity_mut()).await?;
        buffer.set_len(len);

        trace!("{}: received {} bytes", source, len);

        Ok((buffer, source))
    }
}

impl Sink for Endpoint {
    fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<(), StdIoError> {
        trace!("{}: sending {} bytes", target, data.len());
        self.socket.try_send_to(data, target).map(|_| ())
    }
}
