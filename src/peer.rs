//! The per-peer protocol engine.
//!
//! A [`Peer`] is a synchronous state machine: socket readability and timer
//! expiry are delivered to it as plain method calls together with the current
//! monotonic time, and everything it wants to tell the owner comes back as
//! [`Upcall`] values. Outgoing datagrams are written through the [`Sink`]
//! capability so the engine never owns a socket, which also makes it fully
//! testable without one.

use crate::{
    packet::{
        BufferPool,
        Command,
        Header,
        Opt,
        PooledBuffer,
        PROTOCOL_VERSION,
    },
    seq_delta,
    Channel,
    Error,
    HEADER_SIZE,
    MAX_SEGMENT_DATA,
    RECV_BUFFER_SIZE,
};
use log::{
    debug,
    trace,
    warn,
};
use rand_core::{
    OsRng,
    RngCore,
};
use std::{
    collections::VecDeque,
    io::{
        Error as StdIoError,
        ErrorKind,
    },
    net::SocketAddr,
    rc::Rc,
};

/// "No reliable packet accepted yet" sentinel for `in_seq_reliable`.
const IN_SEQ_NONE: u16 = 0xFFFF;

/// RFC 6298 clock granularity, milliseconds.
const RTO_GRANULARITY: i64 = 1000;

/// Destination the engine writes datagrams through.
pub(crate) trait Sink {
    fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<(), StdIoError>;
}

/// Peer timeout configuration, milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Lower retransmission timeout bound.
    pub min_rto: i64,
    /// Upper retransmission timeout bound, also the back-off ceiling.
    pub max_rto: i64,
    /// Idle interval after which a keepalive ping is sent.
    pub action: i64,
    /// Silence interval after which the peer is declared lost.
    pub drop: i64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            min_rto: 100,
            max_rto: 1000,
            action: 500,
            drop: 5000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    New,
    Connecting,
    Run,
    Dead,
}

/// What the engine tells its owner. Owners translate these into their public
/// event types; `Dropped` obliges the owner to discard the peer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Upcall {
    Connected,
    Message { channel: Channel, data: Vec<u8> },
    Acked { seq: u16 },
    Dropped,
}

enum Sequencing {
    Sequenced,
    Retransmitted,
    Unsequenced,
}

/// One framed datagram in the send queue. The header copy is restamped into
/// the buffer before every transmission so ack piggybacking and the
/// retransmission flag stay current.
struct Segment {
    header: Header,
    buffer: PooledBuffer,
}

impl Segment {
    fn restamp(&mut self) {
        self.header.encode(&mut self.buffer.capacity_mut()[.. HEADER_SIZE]);
    }
}

/// In-progress multi-segment message. At most one exists per peer; a new
/// first segment discards whatever was accumulated before.
struct Reassembly {
    command: u8,
    expected: u16,
    buffer: Vec<u8>,
}

pub(crate) struct Peer {
    remote: SocketAddr,
    state: State,
    in_seq_reliable: u16,
    in_seq_unreliable: u16,
    out_seq_reliable: u16,
    out_seq_unreliable: u16,
    out_seq_acked: u16,
    send_queue: VecDeque<Segment>,
    reassembly: Option<Reassembly>,
    srtt: Option<i64>,
    rttvar: i64,
    rto: i64,
    timeouts: Timeouts,
    last_out_time: i64,
    drop_deadline: i64,
    service_at: i64,
    must_ack: bool,
    last_send_error: Option<StdIoError>,
    pool: Rc<BufferPool>,
}

impl Peer {
    pub fn new(remote: SocketAddr, timeouts: Timeouts, pool: Rc<BufferPool>, now: i64) -> Self {
        // The handshake cannot complete when CONN_REQ lands on the
        // IN_SEQ_NONE sentinel or right after it, so those two seeds are
        // excluded from the otherwise full range.
        let out_seq_reliable = loop {
            let seed = OsRng.next_u32() as u16;
            if seed != IN_SEQ_NONE && seed != IN_SEQ_NONE.wrapping_sub(1) {
                break seed;
            }
        };

        Self {
            remote,
            state: State::New,
            in_seq_reliable: IN_SEQ_NONE,
            in_seq_unreliable: 0,
            out_seq_reliable,
            out_seq_unreliable: 0,
            out_seq_acked: out_seq_reliable.wrapping_sub(1),
            send_queue: VecDeque::new(),
            reassembly: None,
            srtt: None,
            rttvar: 0,
            rto: timeouts.max_rto,
            timeouts,
            last_out_time: now,
            drop_deadline: now + timeouts.drop,
            service_at: now + timeouts.action,
            must_ack: false,
            last_send_error: None,
            pool,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_dead(&self) -> bool {
        self.state == State::Dead
    }

    pub fn service_at(&self) -> i64 {
        self.service_at
    }

    /// Smoothed round-trip time, `None` until the first keepalive sample.
    pub fn rtt(&self) -> Option<i64> {
        self.srtt
    }

    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
        self.rto = self.rto.clamp(timeouts.min_rto, timeouts.max_rto);
    }

    /// Feed one inbound datagram through the engine. Errors mean the
    /// datagram was malformed; the peer itself stays usable.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        now: i64,
        upcalls: &mut VecDeque<Upcall>,
    ) -> Result<(), Error> {
        let header = match Header::decode(data) {
            Some(header) => header,
            None => {
                warn!("{}: dropping truncated datagram of {} bytes", self.remote, data.len());
                return Err(Error::InvalidArgument);
            },
        };

        if header.version != PROTOCOL_VERSION {
            warn!("{}: dropping packet with version {}", self.remote, header.version);
            return Err(Error::InvalidArgument);
        }

        let payload = &data[HEADER_SIZE ..];

        trace!(
            "{}: in command {} opt {:#x} rel {} unrel {} payload {}",
            self.remote,
            header.command,
            header.opt,
            header.reliable_seq,
            header.unreliable_seq,
            payload.len(),
        );

        if header.has_ack() {
            if seq_delta(header.reliable_ack, self.out_seq_reliable) > 0 {
                warn!(
                    "{}: ack {} is ahead of anything sent ({})",
                    self.remote, header.reliable_ack, self.out_seq_reliable,
                );
                return Err(Error::InvalidArgument);
            }
            self.process_ack(header.reliable_ack, upcalls);
        }

        match self.classify(&header) {
            Sequencing::Unsequenced => {
                match (self.state, header.command) {
                    (State::New, Command::CONN_REQ) => {
                        self.in_seq_reliable = header.reliable_seq;
                        self.in_seq_unreliable = 0;
                        self.enqueue_control(Command::CONN_RSP, &1u32.to_be_bytes(), false);
                        self.state = State::Run;
                        debug!("{}: connection accepted", self.remote);
                    },
                    (State::Connecting, Command::CONN_RSP) => {
                        if payload.len() < 4 {
                            warn!("{}: truncated connection response", self.remote);
                            return Err(Error::InvalidArgument);
                        }
                        let accepted = u32::from_be_bytes(payload[.. 4].try_into().unwrap());
                        if accepted == 0 {
                            debug!("{}: connection rejected", self.remote);
                            return Ok(());
                        }
                        self.in_seq_reliable = header.reliable_seq;
                        self.in_seq_unreliable = 0;
                        self.state = State::Run;
                        upcalls.push_back(Upcall::Connected);
                        debug!("{}: connection established", self.remote);
                    },
                    (state, command) => {
                        debug!(
                            "{}: dropping unsequenced command {} in state {:?}",
                            self.remote, command, state,
                        );
                        return Ok(());
                    },
                }
            },
            Sequencing::Retransmitted => {
                // Seen before; keep the peer alive but do not re-deliver.
                self.drop_deadline = now + self.timeouts.drop;
            },
            Sequencing::Sequenced => {
                self.drop_deadline = now + self.timeouts.drop;

                if header.is_reliable() {
                    self.in_seq_reliable = header.reliable_seq;
                    self.in_seq_unreliable = 0;
                } else {
                    self.in_seq_unreliable = header.unreliable_seq;
                }

                match header.command {
                    Command::CLOSE => {
                        self.state = State::Dead;
                        debug!("{}: close received", self.remote);
                        upcalls.push_back(Upcall::Dropped);
                        return Ok(());
                    },
                    Command::PING if self.state == State::Run => {
                        // Replying to a retransmitted ping would bias the
                        // peer's RTT estimate; the ack below still goes out.
                        if !header.is_retransmitted() {
                            self.enqueue_control(Command::PONG, payload, false);
                        }
                    },
                    Command::PONG if self.state == State::Run => {
                        if payload.len() >= 8 {
                            let echoed =
                                i64::from_be_bytes(payload[.. 8].try_into().unwrap());
                            let sample = now - echoed;
                            if sample >= 0 {
                                self.update_rtt(sample);
                            } else {
                                warn!("{}: pong from the future, ignoring", self.remote);
                            }
                        } else {
                            warn!("{}: truncated pong", self.remote);
                        }
                    },
                    Command::NOOP | Command::CONN_REQ | Command::CONN_RSP => {},
                    command if command >= Command::APP && self.state == State::Run => {
                        self.reassemble(&header, payload, upcalls);
                    },
                    command => {
                        debug!(
                            "{}: dropping command {} in state {:?}",
                            self.remote, command, self.state,
                        );
                    },
                }
            },
        }

        if header.is_reliable() {
            self.must_ack = true;
            if self.send_queue.is_empty() {
                // Nothing queued for the ack to ride on.
                self.enqueue_control(Command::NOOP, &[], false);
            }
        }

        self.schedule(now);

        Ok(())
    }

    fn classify(&self, header: &Header) -> Sequencing {
        if header.is_reliable() {
            if header.reliable_seq == self.in_seq_reliable {
                Sequencing::Retransmitted
            } else if header.reliable_seq == self.in_seq_reliable.wrapping_add(1) {
                Sequencing::Sequenced
            } else {
                Sequencing::Unsequenced
            }
        } else if header.reliable_seq == self.in_seq_reliable
            && seq_delta(header.unreliable_seq, self.in_seq_unreliable) > 0
        {
            Sequencing::Sequenced
        } else {
            Sequencing::Unsequenced
        }
    }

    fn process_ack(&mut self, ack: u16, upcalls: &mut VecDeque<Upcall>) {
        if seq_delta(ack, self.out_seq_acked) < 0 {
            // Duplicate or stale.
            return;
        }

        self.out_seq_acked = ack;

        while let Some(segment) = self.send_queue.front() {
            let header = &segment.header;
            let delivered = header.is_reliable()
                && header.is_retransmitted()
                && seq_delta(header.reliable_seq, ack) <= 0;

            if !delivered {
                // The queue is in assignment order, everything behind this
                // entry has a higher sequence.
                break;
            }

            upcalls.push_back(Upcall::Acked {
                seq: header.reliable_seq,
            });
            self.send_queue.pop_front();
        }
    }

    fn reassemble(&mut self, header: &Header, payload: &[u8], upcalls: &mut VecDeque<Upcall>) {
        let channel = header.command - Command::APP;
        let total = header.segments_size;
        let index = header.segment_index;

        if total == 0 {
            warn!("{}: dropping packet with zero segment count", self.remote);
            return;
        }

        if total == 1 {
            upcalls.push_back(Upcall::Message {
                channel,
                data: payload.to_vec(),
            });
            return;
        }

        if index == 0 {
            if self.reassembly.take().is_some() {
                debug!("{}: discarding incomplete split message", self.remote);
            }
            let mut buffer = Vec::with_capacity(total as usize * RECV_BUFFER_SIZE);
            buffer.extend_from_slice(payload);
            self.reassembly = Some(Reassembly {
                command: header.command,
                expected: total,
                buffer,
            });
            return;
        }

        // Middle and final segments inherit their ordering from the reliable
        // stream; an unreliable split that lost a middle segment corrupts
        // the assembly until the next first segment resets it.
        let Some(reassembly) = self.reassembly.as_mut() else {
            debug!("{}: split segment {} without a started message", self.remote, index);
            return;
        };

        if reassembly.command != header.command || reassembly.expected != total {
            debug!("{}: split segment does not match the started message", self.remote);
            return;
        }

        reassembly.buffer.extend_from_slice(payload);

        if index == total - 1 {
            let reassembly = self.reassembly.take().unwrap();
            upcalls.push_back(Upcall::Message {
                channel: reassembly.command - Command::APP,
                data: reassembly.buffer,
            });
        }
    }

    /// Queue one application message, splitting it into segments as needed.
    /// Surfaces (and clears) any send error captured by an earlier flush.
    pub fn send(
        &mut self,
        reliable: bool,
        channel: Channel,
        data: &[u8],
        now: i64,
    ) -> Result<(), Error> {
        match self.state {
            State::Run => {},
            State::Dead => return Err(Error::InvalidArgument),
            State::New | State::Connecting => return Err(Error::NotConnected),
        }

        let command = Command::APP.checked_add(channel).ok_or(Error::InvalidArgument)?;
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let segments = data.len().div_ceil(MAX_SEGMENT_DATA);
        let segments: u16 = segments.try_into().map_err(|_| Error::InvalidArgument)?;

        for (index, chunk) in data.chunks(MAX_SEGMENT_DATA).enumerate() {
            let mut header = Header::new(command);
            header.segment_index = index as u16;
            header.segments_size = segments;
            self.assign_seq(&mut header, reliable);
            self.push_segment(header, chunk);
        }

        self.schedule(now);

        match self.last_send_error.take() {
            Some(err) => Err(Error::Io(err)),
            None => Ok(()),
        }
    }

    /// Begin the handshake: queue a reliable CONN_REQ and wait for the
    /// response. Valid once, on a freshly created peer.
    pub fn send_connect(&mut self, now: i64) -> Result<(), Error> {
        if self.state != State::New {
            return Err(Error::InvalidArgument);
        }

        self.enqueue_control(Command::CONN_REQ, &[], true);
        self.state = State::Connecting;
        self.schedule(now);

        Ok(())
    }

    /// Tell the peer we are going away. Bypasses the send queue entirely,
    /// the owner is expected to discard the peer right after.
    pub fn send_close<S: Sink>(&mut self, sink: &S) {
        let mut header = Header::new(Command::CLOSE);
        self.out_seq_unreliable = self.out_seq_unreliable.wrapping_add(1);
        header.reliable_seq = self.out_seq_reliable;
        header.unreliable_seq = self.out_seq_unreliable;

        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);

        if let Err(err) = sink.send_to(self.remote, &buf) {
            debug!("{}: close not sent: {}", self.remote, err);
        }
    }

    fn assign_seq(&mut self, header: &mut Header, reliable: bool) {
        if reliable {
            self.out_seq_unreliable = 0;
            self.out_seq_reliable = self.out_seq_reliable.wrapping_add(1);
            header.reliable_seq = self.out_seq_reliable;
            header.unreliable_seq = 0;
            header.opt = Opt::RELIABLE;
        } else {
            self.out_seq_unreliable = self.out_seq_unreliable.wrapping_add(1);
            header.reliable_seq = self.out_seq_reliable;
            header.unreliable_seq = self.out_seq_unreliable;
            header.opt = 0;
        }
    }

    fn enqueue_control(&mut self, command: u8, payload: &[u8], reliable: bool) {
        let mut header = Header::new(command);
        self.assign_seq(&mut header, reliable);
        self.push_segment(header, payload);
    }

    fn push_segment(&mut self, header: Header, payload: &[u8]) {
        let mut buffer = self.pool.take();
        let buf = buffer.capacity_mut();
        header.encode(&mut buf[.. HEADER_SIZE]);
        buf[HEADER_SIZE .. HEADER_SIZE + payload.len()].copy_from_slice(payload);
        buffer.set_len(HEADER_SIZE + payload.len());
        self.send_queue.push_back(Segment { header, buffer });
    }

    /// The service tick: drop-deadline check, keepalive injection, queue
    /// flush and timer rescheduling. Runs on timer expiry; cheap enough to
    /// also run after any queue change.
    pub fn service<S: Sink>(&mut self, now: i64, sink: &S, upcalls: &mut VecDeque<Upcall>) {
        if self.state == State::Dead {
            return;
        }

        if now > self.drop_deadline {
            self.state = State::Dead;
            debug!("{}: drop deadline exceeded", self.remote);
            upcalls.push_back(Upcall::Dropped);
            return;
        }

        if self.state == State::Run
            && self.send_queue.is_empty()
            && now - self.last_out_time > self.timeouts.action
        {
            self.enqueue_control(Command::PING, &now.to_be_bytes(), true);
        }

        self.flush(now, sink);
        self.schedule(now);
    }

    fn flush<S: Sink>(&mut self, now: i64, sink: &S) {
        let mut index = 0;

        while index < self.send_queue.len() {
            let must_ack = self.must_ack;
            let in_seq_reliable = self.in_seq_reliable;

            let segment = &mut self.send_queue[index];
            if must_ack {
                segment.header.opt |= Opt::ACK;
                segment.header.reliable_ack = in_seq_reliable;
            }
            let already_sent = segment.header.is_retransmitted();
            let reliable = segment.header.is_reliable();
            segment.restamp();

            match sink.send_to(self.remote, self.send_queue[index].buffer.as_ref()) {
                Ok(()) => {
                    self.last_out_time = now;
                },
                Err(err) => {
                    if err.kind() != ErrorKind::InvalidInput {
                        self.last_out_time = now;
                    }
                    debug!("{}: send failed: {}", self.remote, err);
                    self.last_send_error = Some(err);
                },
            }

            if must_ack {
                self.must_ack = false;
            }

            if reliable && already_sent {
                // One retransmission per tick. The back-off formula pins at
                // max_rto; kept exactly as the original computes it.
                self.rto = (self.rto * 2).max(self.timeouts.max_rto).min(self.timeouts.max_rto);
                trace!("{}: retransmitted, rto {}", self.remote, self.rto);
                break;
            } else if reliable {
                self.send_queue[index].header.opt |= Opt::RETRANSMITTED;
                index += 1;
            } else {
                let _ = self.send_queue.remove(index);
            }
        }
    }

    fn schedule(&mut self, now: i64) {
        let mut delta = self.timeouts.action;

        match self.send_queue.front() {
            Some(segment) if segment.header.is_reliable() && segment.header.is_retransmitted() => {
                delta = self.last_out_time + self.rto - now;
            },
            Some(_) => {
                delta = 0;
            },
            None => {},
        }

        let delta = delta.clamp(0, (self.drop_deadline - now).max(0));
        self.service_at = now + delta;
    }

    fn update_rtt(&mut self, sample: i64) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            },
            Some(srtt) => {
                self.rttvar = (3 * self.rttvar + (srtt - sample).abs()) / 4;
                self.srtt = Some((7 * srtt + sample) / 8);
            },
        }

        let srtt = self.srtt.unwrap();
        self.rto = (srtt + RTO_GRANULARITY.max(4 * self.rttvar))
            .clamp(self.timeouts.min_rto, self.timeouts.max_rto);

        trace!(
            "{}: rtt sample {}, srtt {}, rttvar {}, rto {}",
            self.remote,
            sample,
            srtt,
            self.rttvar,
            self.rto,
        );
    }
}
