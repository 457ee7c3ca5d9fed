//! Client side of the protocol implementation.
//!
//! # Examples
//!
//! ```no_run
//! use relink::client::{
//!     Client,
//!     Event,
//! };
//!
//! async fn example() {
//!     let mut client = Client::connect(([127, 0, 0, 1], 12345), ([127, 0, 0, 1], 12346))
//!         .await
//!         .expect("socket bound");
//!
//!     // The handshake completes and all retransmission happens while
//!     // next_event() is being polled; poll it in a loop.
//!     loop {
//!         match client.next_event().await.expect("connection alive") {
//!             Event::Connected => {
//!                 client.send_reliable(0, b"Hello Server!").expect("connected");
//!             },
//!             Event::Message { channel, data } => {
//!                 println!("channel {}: {} bytes", channel, data.len());
//!             },
//!             Event::Disconnected => break,
//!             Event::Acked { .. } => {},
//!         }
//!     }
//! }
//! ```

use crate::{
    endpoint::Endpoint,
    peer::{
        Peer,
        Timeouts,
        Upcall,
    },
    Channel,
    Clock,
    Error,
};
use futures_lite::FutureExt;
use log::{
    error,
    warn,
};
use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::Duration,
};
use tokio::time;

/// What happened on the connection since the last poll.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// The server accepted the connection; sending is possible from now on.
    Connected,
    /// A message arrived, reassembled if it was split.
    Message { channel: Channel, data: Vec<u8> },
    /// The server acknowledged the reliable sequence.
    Acked { seq: u16 },
    /// The server closed the session or went silent past the drop timeout.
    Disconnected,
}

pub struct Client {
    endpoint: Endpoint,
    peer: Peer,
    clock: Clock,
    events: VecDeque<Event>,
    upcalls: VecDeque<Upcall>,
}

impl Client {
    /// Bind the local socket and start the handshake with default timeouts.
    /// [`Event::Connected`] is produced once the server responds.
    pub async fn connect<A, B>(local: A, server: B) -> Result<Self, Error>
    where
        A: Into<SocketAddr>,
        B: Into<SocketAddr>,
    {
        Self::connect_with(local, server, Timeouts::default()).await
    }

    /// Bind the local socket and start the handshake.
    pub async fn connect_with<A, B>(
        local: A,
        server: B,
        timeouts: Timeouts,
    ) -> Result<Self, Error>
    where
        A: Into<SocketAddr>,
        B: Into<SocketAddr>,
    {
        let endpoint = Endpoint::bind(local.into()).await?;
        let clock = Clock::new();
        let now = clock.now();

        let mut peer = Peer::new(server.into(), timeouts, endpoint.pool().clone(), now);
        peer.send_connect(now)?;

        Ok(Self {
            endpoint,
            peer,
            clock,
            events: VecDeque::new(),
            upcalls: VecDeque::new(),
        })
    }

    /// Wait for the next protocol event.
    ///
    /// **Internally, this method performs all socket and timer handling.
    /// The futures it returns must be polled in a loop constantly for the
    /// connection to work.**
    pub async fn next_event(&mut self) -> Result<Event, Error> {
        loop {
            let now = self.clock.now();

            if self.peer.service_at() <= now && !self.peer.is_dead() {
                self.peer.service(now, &self.endpoint, &mut self.upcalls);
                self.drain_upcalls();
            }

            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }

            if self.peer.is_dead() {
                // Disconnected was already delivered; there is nothing left
                // to wait for.
                return Err(Error::NotConnected);
            }

            let wake_at = self.peer.service_at();
            let endpoint = &self.endpoint;

            let incoming = async { Some(endpoint.recv().await) }
                .or(async {
                    if wake_at > now {
                        time::sleep(Duration::from_millis((wake_at - now) as u64)).await;
                    }
                    None
                })
                .await;

            match incoming {
                Some(Ok((buffer, source))) => {
                    if source != self.peer.remote() {
                        warn!("{}: dropping datagram from unknown source", source);
                        continue;
                    }
                    let now = self.clock.now();
                    if let Err(err) =
                        self.peer.handle_datagram(buffer.as_ref(), now, &mut self.upcalls)
                    {
                        warn!("{}: bad datagram: {}", source, err);
                    }
                    self.drain_upcalls();
                },
                Some(Err(err)) => {
                    error!("receive failed: {}", err);
                    return Err(err.into());
                },
                None => {},
            }
        }
    }

    fn drain_upcalls(&mut self) {
        while let Some(upcall) = self.upcalls.pop_front() {
            let event = match upcall {
                Upcall::Connected => Event::Connected,
                Upcall::Message { channel, data } => Event::Message { channel, data },
                Upcall::Acked { seq } => Event::Acked { seq },
                Upcall::Dropped => Event::Disconnected,
            };

            self.events.push_back(event);
        }
    }

    /// Send a data slice reliably. The message goes out while `next_event`
    /// is being polled.
    pub fn send_reliable(&mut self, channel: Channel, data: &[u8]) -> Result<(), Error> {
        let now = self.clock.now();
        self.peer.send(true, channel, data, now)
    }

    /// Send a data slice unreliably.
    pub fn send_unreliable(&mut self, channel: Channel, data: &[u8]) -> Result<(), Error> {
        let now = self.clock.now();
        self.peer.send(false, channel, data, now)
    }

    /// Close the session. The server is told once, without retransmission;
    /// in-flight unacked data is lost.
    pub fn disconnect(mut self) {
        self.peer.send_close(&self.endpoint);
    }

    /// Smoothed round-trip time to the server, `None` before the first
    /// keepalive sample.
    pub fn rtt(&self) -> Option<i64> {
        self.peer.rtt()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.peer.remote()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.endpoint.local_addr()?)
    }
}
