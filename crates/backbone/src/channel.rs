//! The live session bound to one endpoint.
//!
//! State only moves forward: `Created -> Active -> Condemned ->
//! CondemnedAndDestroy -> Destroyed`, with `Condemned` optional. A condemned
//! channel takes no new sends but keeps draining what is already queued;
//! `CondemnedAndDestroy` drops the queue at teardown.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, BundlePool};
use crate::config::{NetworkConfig, TlsPolicy};
use crate::endpoint::{Endpoint, EndpointKind};
use crate::error::{NetError, Reason, Result};
use crate::error_reporter::ErrorReporter;
use crate::message::{Message, MessageReader, MessageTable};
use crate::pool::Handle;
use crate::sniff::{Sniffed, sniff};
use crate::stats::ChannelStats;
use crate::transport::{Transport, TransportState};
use crate::websocket::{Handshake, WebSocketCodec};

pub type ChannelHandle = Handle<Channel>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u8 {
        const HANDSHAKE_DONE = 0b0001;
        const WEBSOCKET = 0b0010;
        const SNIFFED = 0b0100;
        const REGISTERED = 0b1000;
    }
}

/// Trust level of the link. External links face the public internet and
/// are condemned on repeated send failure; internal links only report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelTraits {
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Active,
    Condemned,
    CondemnedAndDestroy,
    Destroyed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Created => "created",
            ChannelState::Active => "active",
            ChannelState::Condemned => "condemned",
            ChannelState::CondemnedAndDestroy => "condemned-and-destroy",
            ChannelState::Destroyed => "destroyed",
        }
    }

    pub fn is_condemned(&self) -> bool {
        matches!(
            self,
            ChannelState::Condemned | ChannelState::CondemnedAndDestroy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Nothing was queued.
    Idle,
    Flushed,
    /// The socket took part of the data; the rest waits for the next tick.
    Partial,
    /// Transient failure; the count of consecutive failures so far.
    Failing(u32),
    Condemned(Reason),
}

pub struct Channel {
    endpoint: Box<dyn Endpoint>,
    traits: ChannelTraits,
    transport: Transport,
    state: ChannelState,
    codec: TransportState,
    flags: ChannelFlags,
    config: Rc<NetworkConfig>,
    bundles: BundlePool,
    reader: MessageReader,
    pending: VecDeque<Bundle>,
    control: VecDeque<(Vec<u8>, usize)>,
    inbox: VecDeque<Message>,
    sniff_buf: Vec<u8>,
    created_at: Instant,
    last_received: Instant,
    clock: Instant,
    condemned_at: Option<Instant>,
    condemn_reason: Option<Reason>,
    send_failures: u32,
    stats: ChannelStats,
}

impl Channel {
    pub fn new(
        endpoint: Box<dyn Endpoint>,
        traits: ChannelTraits,
        transport: Transport,
        config: Rc<NetworkConfig>,
        bundles: BundlePool,
        now: Instant,
    ) -> Self {
        let codec = TransportState::new(transport, &config.reliable, config.max_message_len);
        Self {
            endpoint,
            traits,
            transport,
            state: ChannelState::Created,
            codec,
            flags: ChannelFlags::empty(),
            reader: MessageReader::new(config.max_message_len),
            config,
            bundles,
            pending: VecDeque::new(),
            control: VecDeque::new(),
            inbox: VecDeque::new(),
            sniff_buf: Vec::new(),
            created_at: now,
            last_received: now,
            clock: now,
            condemned_at: None,
            condemn_reason: None,
            send_failures: 0,
            stats: ChannelStats::default(),
        }
    }

    /// Binds the transport to the endpoint and activates the channel.
    /// `sniff` requests first-bytes classification of an accepted stream.
    pub fn initialize(&mut self, sniff: bool) -> Result<()> {
        if self.state != ChannelState::Created {
            return Err(self.illegal("active"));
        }

        let expected = if self.transport.is_datagram() {
            EndpointKind::Datagram
        } else {
            EndpointKind::Stream
        };
        if self.endpoint.kind() != expected {
            return Err(NetError::Unsupported("transport does not match the endpoint"));
        }

        let needs_sniff = sniff
            && self.traits == ChannelTraits::External
            && self.transport == Transport::Stream;
        if !needs_sniff {
            self.flags.insert(ChannelFlags::SNIFFED);
        }

        self.state = ChannelState::Active;
        log::debug!(
            "channel {} initialized ({}, {:?})",
            self.peer_addr(),
            self.transport,
            self.traits
        );
        Ok(())
    }

    fn illegal(&self, to: &'static str) -> NetError {
        log::error!(
            "channel {}: illegal transition {} -> {}",
            self.peer_addr(),
            self.state.as_str(),
            to
        );
        NetError::InvalidTransition {
            from: self.state.as_str(),
            to,
        }
    }

    /// Stops new sends. Returns whether the state changed.
    pub fn condemn(&mut self, reason: Reason) -> Result<bool> {
        match self.state {
            ChannelState::Active => {
                self.state = ChannelState::Condemned;
                self.mark_condemned(reason);
                Ok(true)
            }
            ChannelState::Condemned | ChannelState::CondemnedAndDestroy => Ok(false),
            ChannelState::Created | ChannelState::Destroyed => Err(self.illegal("condemned")),
        }
    }

    /// Stops new sends and drops the queue at teardown.
    pub fn condemn_and_destroy(&mut self, reason: Reason) -> Result<bool> {
        match self.state {
            ChannelState::Active | ChannelState::Condemned => {
                if self.state == ChannelState::Active {
                    self.mark_condemned(reason);
                } else {
                    self.condemn_reason = Some(reason);
                }
                self.state = ChannelState::CondemnedAndDestroy;
                Ok(true)
            }
            ChannelState::CondemnedAndDestroy => Ok(false),
            ChannelState::Created | ChannelState::Destroyed => {
                Err(self.illegal("condemned-and-destroy"))
            }
        }
    }

    fn mark_condemned(&mut self, reason: Reason) {
        self.condemn_reason = Some(reason);
        self.condemned_at = Some(self.clock);
        log::info!(
            "channel {} ({:?}) condemned: {}",
            self.peer_addr(),
            self.traits,
            reason
        );
    }

    /// Queues a bundle. Condemned channels refuse new sends.
    pub fn send(&mut self, mut bundle: Bundle) -> Result<()> {
        match self.state {
            ChannelState::Active => {}
            ChannelState::Condemned | ChannelState::CondemnedAndDestroy => {
                self.bundles.release(bundle);
                return Err(NetError::ChannelCondemned);
            }
            ChannelState::Created | ChannelState::Destroyed => {
                self.bundles.release(bundle);
                return Err(NetError::Unsupported("send on an inactive channel"));
            }
        }

        if let Err(err) = bundle.finish_message() {
            self.bundles.release(bundle);
            return Err(err);
        }
        if bundle.is_empty() {
            self.bundles.release(bundle);
            return Ok(());
        }

        self.stats.messages_sent += bundle.message_count() as u64;
        self.pending.push_back(bundle);
        Ok(())
    }

    /// A bundle shaped for this channel's transport.
    pub fn new_bundle(&self) -> Bundle {
        self.bundles
            .acquire_aligned(self.transport.aligned_bundles())
    }

    fn queue_control(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.control.push_back((bytes, 0));
        }
    }

    /// Drains control traffic then queued bundles, in FIFO order.
    pub fn process_send(&mut self, now: Instant, reporter: &mut ErrorReporter) -> SendStatus {
        self.clock = now;
        if !matches!(
            self.state,
            ChannelState::Active | ChannelState::Condemned
        ) {
            return SendStatus::Idle;
        }
        if self.control.is_empty() && self.pending.is_empty() {
            return SendStatus::Idle;
        }

        match self.drain(now) {
            Ok(flushed) => {
                self.send_failures = 0;
                if flushed {
                    SendStatus::Flushed
                } else {
                    SendStatus::Partial
                }
            }
            Err(err) => self.on_send_error(err, now, reporter),
        }
    }

    fn drain(&mut self, now: Instant) -> Result<bool> {
        let datagram = self.endpoint.kind() == EndpointKind::Datagram;

        while let Some((bytes, offset)) = self.control.front_mut() {
            let n = self.endpoint.send(&bytes[*offset..])?;
            self.stats.bytes_sent += n as u64;
            *offset += n;
            if !datagram && *offset < bytes.len() {
                return Ok(false);
            }
            self.control.pop_front();
        }

        loop {
            let Some(bundle) = self.pending.front_mut() else {
                break;
            };
            if bundle.is_drained() {
                if let Some(done) = self.pending.pop_front() {
                    self.stats.bundles_sent += 1;
                    self.bundles.release(done);
                }
                continue;
            }

            let Some(buffer) = bundle.front_mut() else {
                continue;
            };
            if !buffer.is_wire_ready() {
                match self.codec.encode(buffer.readable())? {
                    Some(wire) => buffer.replace_with_wire(wire),
                    None => buffer.mark_wire_ready(),
                }
            }

            let n = self.endpoint.send(buffer.readable())?;
            self.stats.bytes_sent += n as u64;
            self.codec.on_sent(now);
            if datagram {
                buffer.advance(buffer.readable_len());
            } else {
                buffer.advance(n);
            }

            if buffer.is_consumed() {
                bundle.release_front();
            } else {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn on_send_error(
        &mut self,
        err: NetError,
        now: Instant,
        reporter: &mut ErrorReporter,
    ) -> SendStatus {
        let reason = err.reason();
        let addr = self.peer_addr();

        if !reason.is_transient() {
            reporter.report(reason, addr, now);
            log::warn!("channel {} send failed: {}", addr, err);
            let _ = self.condemn_and_destroy(reason);
            return SendStatus::Condemned(reason);
        }

        self.send_failures += 1;
        self.stats.send_failures += 1;
        let threshold = self.config.send_failure_threshold;
        if self.send_failures < threshold {
            return SendStatus::Failing(self.send_failures);
        }

        reporter.report(reason, addr, now);
        match self.traits {
            ChannelTraits::External => {
                log::warn!(
                    "external channel {} failed {} consecutive sends, condemning",
                    addr,
                    self.send_failures
                );
                let _ = self.condemn(reason);
                SendStatus::Condemned(reason)
            }
            ChannelTraits::Internal => {
                if self.send_failures == threshold {
                    log::warn!(
                        "internal channel {} failed {} consecutive sends: {}",
                        addr,
                        self.send_failures,
                        err
                    );
                }
                SendStatus::Failing(self.send_failures)
            }
        }
    }

    /// Reads what the endpoint has, up to the configured batch.
    pub fn process_recv(
        &mut self,
        table: &MessageTable,
        scratch: &mut [u8],
        now: Instant,
        reporter: &mut ErrorReporter,
    ) {
        self.clock = now;
        let stream = self.endpoint.kind() == EndpointKind::Stream;

        for _ in 0..self.config.recv_batch.max(1) {
            if self.state != ChannelState::Active {
                return;
            }
            match self.endpoint.recv(scratch) {
                Ok(0) if stream => {
                    log::debug!("channel {} closed by peer", self.peer_addr());
                    let _ = self.condemn_and_destroy(Reason::ChannelLost);
                    return;
                }
                Ok(n) => self.on_bytes(&scratch[..n], table, now),
                Err(err) => {
                    let reason = Reason::from_io(&err);
                    if reason.is_transient() {
                        return;
                    }
                    reporter.report(reason, self.peer_addr(), now);
                    log::debug!("channel {} recv failed: {}", self.peer_addr(), err);
                    let _ = self.condemn_and_destroy(reason);
                    return;
                }
            }
        }
    }

    /// Feeds bytes read from the endpoint or, for a shared datagram socket,
    /// one datagram routed here by the listener.
    pub fn on_bytes(&mut self, bytes: &[u8], table: &MessageTable, now: Instant) {
        if self.state != ChannelState::Active {
            return;
        }
        self.last_received = now;
        self.stats.bytes_received += bytes.len() as u64;

        if self.flags.contains(ChannelFlags::SNIFFED) {
            self.decode(bytes, table, now);
            return;
        }

        self.sniff_buf.extend_from_slice(bytes);
        let data = std::mem::take(&mut self.sniff_buf);
        self.classify(data, table, now);
    }

    fn classify(&mut self, data: Vec<u8>, table: &MessageTable, now: Instant) {
        let addr = self.peer_addr();
        match sniff(&data, table, self.config.websocket) {
            Sniffed::Incomplete => self.sniff_buf = data,
            Sniffed::Tls(version) => {
                match self.config.tls_policy {
                    TlsPolicy::Reject => {
                        log::warn!("{} opened a {} handshake on a plaintext listener", addr, version)
                    }
                    TlsPolicy::RejectQuietly => {
                        log::debug!("{} opened a {} handshake, dropping", addr, version)
                    }
                }
                let _ = self.condemn_and_destroy(Reason::ProtocolMismatch);
            }
            Sniffed::Unrecognized => {
                log::warn!("{} speaks an unrecognized protocol, dropping", addr);
                let _ = self.condemn_and_destroy(Reason::ProtocolMismatch);
            }
            Sniffed::Native => {
                self.flags.insert(ChannelFlags::SNIFFED);
                self.decode(&data, table, now);
            }
            Sniffed::WebSocket => match Handshake::parse(&data) {
                Ok(Some((handshake, consumed))) => {
                    log::debug!("{} upgraded to websocket on {}", addr, handshake.path);
                    self.queue_control(handshake.response());
                    self.transport = Transport::WebSocket;
                    self.codec = TransportState::WebSocket(WebSocketCodec::server(
                        self.config.max_message_len,
                    ));
                    self.flags.insert(
                        ChannelFlags::SNIFFED | ChannelFlags::WEBSOCKET | ChannelFlags::HANDSHAKE_DONE,
                    );
                    if consumed < data.len() {
                        self.decode(&data[consumed..], table, now);
                    }
                }
                Ok(None) => self.sniff_buf = data,
                Err(err) => {
                    log::warn!("{} sent a bad websocket upgrade: {}", addr, err);
                    let _ = self.condemn_and_destroy(Reason::ProtocolMismatch);
                }
            },
        }
    }

    fn decode(&mut self, bytes: &[u8], table: &MessageTable, now: Instant) {
        let raw_datagram = self.transport == Transport::Datagram;

        let incoming = match self.codec.decode(bytes, now) {
            Ok(incoming) => incoming,
            Err(err) if self.transport.is_datagram() => {
                log::debug!("dropping datagram from {}: {}", self.peer_addr(), err);
                self.stats.datagrams_dropped += 1;
                return;
            }
            Err(err) => {
                log::warn!("{} sent malformed framing: {}", self.peer_addr(), err);
                let _ = self.condemn_and_destroy(Reason::ProtocolMismatch);
                return;
            }
        };

        for reply in incoming.replies {
            self.queue_control(reply);
        }

        for chunk in incoming.chunks {
            self.reader.feed(&chunk);
            loop {
                match self.reader.next_message(table) {
                    Ok(Some(message)) => {
                        self.stats.messages_received += 1;
                        self.inbox.push_back(message);
                    }
                    Ok(None) => break,
                    Err(err) if raw_datagram => {
                        log::debug!("dropping datagram from {}: {}", self.peer_addr(), err);
                        self.reader.reset();
                        self.stats.datagrams_dropped += 1;
                        break;
                    }
                    Err(err) => {
                        log::warn!(
                            "{} sent a malformed message header: {}",
                            self.peer_addr(),
                            err
                        );
                        let _ = self.condemn_and_destroy(Reason::ProtocolMismatch);
                        return;
                    }
                }
            }

            // A datagram carries whole messages only.
            if raw_datagram && self.reader.buffered() > 0 {
                log::debug!("truncated message in datagram from {}", self.peer_addr());
                self.reader.reset();
                self.stats.datagrams_dropped += 1;
            }
        }

        if incoming.closed {
            log::debug!("{} closed the websocket", self.peer_addr());
            let _ = self.condemn(Reason::ChannelLost);
        }
    }

    /// Timer work: reliable retransmissions and acks.
    pub fn tick(&mut self, now: Instant) {
        self.clock = now;
        if self.state != ChannelState::Active {
            return;
        }
        match self.codec.poll(now) {
            Ok(segments) => {
                for segment in segments {
                    self.queue_control(segment);
                }
            }
            Err(err) => {
                log::warn!("channel {}: {}", self.peer_addr(), err);
                let _ = self.condemn_and_destroy(err.reason());
            }
        }
    }

    /// Flushes what it can when plainly condemned, drops the rest, closes
    /// the endpoint. The arena slot is released by the caller.
    pub fn destroy(&mut self, now: Instant) {
        if matches!(
            self.state,
            ChannelState::Active | ChannelState::Condemned
        ) {
            if let Err(err) = self.drain(now) {
                log::debug!("channel {} final flush failed: {}", self.peer_addr(), err);
            }
        }

        let dropped = self.pending.len();
        for bundle in self.pending.drain(..) {
            self.bundles.release(bundle);
        }
        if dropped > 0 {
            log::debug!(
                "channel {} destroyed with {} bundle(s) unsent",
                self.peer_addr(),
                dropped
            );
        }
        self.control.clear();
        self.inbox.clear();
        self.endpoint.close();
        self.state = ChannelState::Destroyed;
    }

    pub fn pop_message(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    pub fn has_messages(&self) -> bool {
        !self.inbox.is_empty()
    }

    pub fn is_inactive(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_received) > timeout
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Whether a condemned channel is ready for teardown.
    pub fn ready_to_destroy(&self, now: Instant, grace: Duration) -> bool {
        match self.state {
            ChannelState::CondemnedAndDestroy => true,
            ChannelState::Condemned => {
                (self.pending.is_empty() && self.control.is_empty())
                    || self
                        .condemned_at
                        .is_some_and(|at| now.duration_since(at) >= grace)
            }
            _ => false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn traits(&self) -> ChannelTraits {
        self.traits
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn flags(&self) -> ChannelFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: ChannelFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: ChannelFlags) {
        self.flags.remove(flag);
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.endpoint.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn condemn_reason(&self) -> Option<Reason> {
        self.condemn_reason
    }

    pub fn send_failures(&self) -> u32 {
        self.send_failures
    }

    pub fn pending_bundles(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn srtt_ms(&self) -> Option<f32> {
        self.codec.reliable().map(|session| session.srtt_ms())
    }

    /// Reliable segments sent but not yet acknowledged.
    pub fn reliable_in_flight(&self) -> Option<usize> {
        self.codec.reliable().map(|session| session.in_flight())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer_addr())
            .field("traits", &self.traits)
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}
