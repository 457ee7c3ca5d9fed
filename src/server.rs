//! Server side of the protocol implementation.
//!
//! # Examples
//!
//! ```no_run
//! use relink::server::{
//!     Event,
//!     ServerParameters,
//! };
//!
//! async fn example() {
//!     let mut server = ServerParameters::default()
//!         .bind(([127, 0, 0, 1], 12345))
//!         .await
//!         .expect("socket bound");
//!
//!     // All routing, retransmission and keepalive scheduling happens
//!     // inside next_event(), so the future must be polled in a loop even
//!     // when the incoming events are not interesting.
//!     loop {
//!         match server.next_event().await.expect("server alive") {
//!             Event::Connected(peer) => println!("{} connected", peer),
//!             Event::Message { from, channel, data } => {
//!                 println!("{}: channel {}, {} bytes", from, channel, data.len());
//!                 server.send_reliable(from, channel, &data).expect("peer known");
//!             },
//!             Event::Disconnected(peer) => println!("{} gone", peer),
//!             Event::Acked { .. } => {},
//!         }
//!     }
//! }
//! ```

use crate::{
    endpoint::Endpoint,
    packet::{
        Command,
        Header,
    },
    peer::{
        Peer,
        Timeouts,
        Upcall,
    },
    Channel,
    Clock,
    Error,
    HEADER_SIZE,
};
use futures_lite::FutureExt;
use log::{
    error,
    warn,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    net::SocketAddr,
    time::Duration,
};
use tokio::time;

/// What happened on the socket since the last poll.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// A new peer completed the handshake.
    Connected(SocketAddr),
    /// A message arrived, reassembled if it was split.
    Message {
        from: SocketAddr,
        channel: Channel,
        data: Vec<u8>,
    },
    /// The peer acknowledged the reliable sequence.
    Acked { from: SocketAddr, seq: u16 },
    /// The peer closed the session or went silent past its drop timeout.
    Disconnected(SocketAddr),
}

/// Server parameters.
#[derive(Debug, Default)]
pub struct ServerParameters {
    /// Timeout configuration applied to every accepted peer.
    pub timeouts: Timeouts,
}

impl ServerParameters {
    /// Bind the socket and produce a `Server` with the given parameters.
    pub async fn bind<A>(self, local: A) -> Result<Server, Error>
    where
        A: Into<SocketAddr>,
    {
        let endpoint = Endpoint::bind(local.into()).await?;

        Ok(Server {
            endpoint,
            peers: HashMap::new(),
            timeouts: self.timeouts,
            clock: Clock::new(),
            events: VecDeque::new(),
            upcalls: VecDeque::new(),
        })
    }
}

pub struct Server {
    endpoint: Endpoint,
    peers: HashMap<SocketAddr, Peer>,
    timeouts: Timeouts,
    clock: Clock,
    events: VecDeque<Event>,
    upcalls: VecDeque<Upcall>,
}

impl Server {
    /// Wait for the next protocol event.
    ///
    /// **Internally, this method performs all socket and timer handling for
    /// every connected peer. The futures it returns must be polled in a loop
    /// constantly for the existing connections to work.**
    pub async fn next_event(&mut self) -> Result<Event, Error> {
        loop {
            let now = self.clock.now();
            self.service_due(now);

            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }

            let wake_at = self.peers.values().map(Peer::service_at).min();
            let endpoint = &self.endpoint;

            let incoming = async { Some(endpoint.recv().await) }
                .or(async {
                    match wake_at {
                        Some(at) if at > now => {
                            time::sleep(Duration::from_millis((at - now) as u64)).await;
                        },
                        Some(_) => {},
                        None => futures_lite::future::pending::<()>().await,
                    }
                    None
                })
                .await;

            match incoming {
                Some(Ok((buffer, source))) => {
                    let now = self.clock.now();
                    self.handle_datagram(buffer.as_ref(), source, now);
                },
                Some(Err(err)) => {
                    error!("receive failed: {}", err);
                    return Err(err.into());
                },
                None => {},
            }
        }
    }

    fn service_due(&mut self, now: i64) {
        let due: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.service_at() <= now)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in due {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.service(now, &self.endpoint, &mut self.upcalls);
                self.drain_upcalls(addr);
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr, now: i64) {
        if let Some(peer) = self.peers.get_mut(&source) {
            if let Err(err) = peer.handle_datagram(data, now, &mut self.upcalls) {
                warn!("{}: bad datagram: {}", source, err);
            }
            self.drain_upcalls(source);
            return;
        }

        // Unknown sources may only open a connection, and a connection
        // request is always a bare header.
        let is_request = data.len() == HEADER_SIZE
            && Header::decode(data).is_some_and(|h| h.command == Command::CONN_REQ);
        if !is_request {
            warn!("{}: dropping garbage datagram of {} bytes", source, data.len());
            return;
        }

        let mut peer = Peer::new(source, self.timeouts, self.endpoint.pool().clone(), now);

        match peer.handle_datagram(data, now, &mut self.upcalls) {
            Ok(()) => {
                self.peers.insert(source, peer);
                self.events.push_back(Event::Connected(source));
                self.drain_upcalls(source);
            },
            Err(_) => {
                self.upcalls.clear();
            },
        }
    }

    fn drain_upcalls(&mut self, addr: SocketAddr) {
        while let Some(upcall) = self.upcalls.pop_front() {
            let event = match upcall {
                Upcall::Connected => Event::Connected(addr),
                Upcall::Message { channel, data } => {
                    Event::Message {
                        from: addr,
                        channel,
                        data,
                    }
                },
                Upcall::Acked { seq } => Event::Acked { from: addr, seq },
                Upcall::Dropped => {
                    self.peers.remove(&addr);
                    Event::Disconnected(addr)
                },
            };

            self.events.push_back(event);
        }
    }

    /// Send a data slice reliably. The message goes out while `next_event`
    /// is being polled.
    pub fn send_reliable(
        &mut self,
        peer: SocketAddr,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), Error> {
        self.send(peer, true, channel, data)
    }

    /// Send a data slice unreliably.
    pub fn send_unreliable(
        &mut self,
        peer: SocketAddr,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), Error> {
        self.send(peer, false, channel, data)
    }

    fn send(
        &mut self,
        peer: SocketAddr,
        reliable: bool,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), Error> {
        let now = self.clock.now();
        self.peers
            .get_mut(&peer)
            .ok_or(Error::UnknownPeer)?
            .send(reliable, channel, data, now)
    }

    /// Send a data slice reliably to every connected peer.
    /// The first failure is reported after all peers were attempted.
    pub fn send_all_reliable(&mut self, channel: Channel, data: &[u8]) -> Result<(), Error> {
        self.send_all(true, channel, data)
    }

    /// Send a data slice unreliably to every connected peer.
    pub fn send_all_unreliable(&mut self, channel: Channel, data: &[u8]) -> Result<(), Error> {
        self.send_all(false, channel, data)
    }

    fn send_all(&mut self, reliable: bool, channel: Channel, data: &[u8]) -> Result<(), Error> {
        let now = self.clock.now();
        let mut result = Ok(());

        for peer in self.peers.values_mut() {
            if let Err(err) = peer.send(reliable, channel, data, now) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// Close the session with the peer and forget it. In-flight unacked
    /// data is lost; the peer is told once, without retransmission.
    pub fn disconnect(&mut self, peer: SocketAddr) -> Result<(), Error> {
        let mut peer = self.peers.remove(&peer).ok_or(Error::UnknownPeer)?;
        peer.send_close(&self.endpoint);
        Ok(())
    }

    /// Addresses of all connected peers.
    pub fn peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.peers.keys().copied()
    }

    /// Smoothed round-trip time of the peer, `None` before the first sample.
    pub fn peer_rtt(&self, peer: SocketAddr) -> Option<i64> {
        self.peers.get(&peer).and_then(Peer::rtt)
    }

    /// Replace the timeout configuration of one connected peer.
    pub fn set_peer_timeouts(&mut self, peer: SocketAddr, timeouts: Timeouts) -> Result<(), Error> {
        self.peers
            .get_mut(&peer)
            .ok_or(Error::UnknownPeer)?
            .set_timeouts(timeouts);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.endpoint.local_addr()?)
    }
}
