//! The per-process network context.
//!
//! `NetworkInterface` owns every channel, listener and pool, and is driven
//! by calling [`NetworkInterface::tick`] from the reactor thread. Nothing in
//! here is shared across threads.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Instant;

use crate::buffer::BufferPool;
use crate::bundle::{Bundle, BundlePool};
use crate::channel::{Channel, ChannelHandle, ChannelState, ChannelTraits, SendStatus};
use crate::config::NetworkConfig;
use crate::endpoint::{Endpoint, TcpEndpoint, UdpEndpoint};
use crate::error::{NetError, Reason, Result};
use crate::error_reporter::ErrorReporter;
use crate::listener::{AcceptAction, Acceptor, Listener, TcpAcceptor, UdpListener};
use crate::message::{Message, MessageTable};
use crate::pool::Arena;
use crate::stats::{ChannelStats, NetworkStats};
use crate::transport::Transport;

/// What the application hears about from a tick.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    ChannelOpened {
        channel: ChannelHandle,
        addr: SocketAddr,
        traits: ChannelTraits,
    },
    Message {
        channel: ChannelHandle,
        message: Message,
    },
    /// Terminal for the channel; reported once.
    ChannelCondemned {
        channel: ChannelHandle,
        addr: SocketAddr,
        reason: Reason,
    },
    ChannelClosed {
        channel: ChannelHandle,
        addr: SocketAddr,
        reason: Option<Reason>,
    },
}

impl NetworkEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkEvent::ChannelOpened { .. } => "channel_opened",
            NetworkEvent::Message { .. } => "message",
            NetworkEvent::ChannelCondemned { .. } => "channel_condemned",
            NetworkEvent::ChannelClosed { .. } => "channel_closed",
        }
    }
}

pub struct NetworkInterface {
    config: Rc<NetworkConfig>,
    table: MessageTable,
    channels: Arena<Channel>,
    by_addr: HashMap<SocketAddr, ChannelHandle>,
    listeners: Vec<Listener>,
    udp_listeners: Vec<UdpListener>,
    udp_peers: HashMap<(usize, SocketAddr), ChannelHandle>,
    bundles: BundlePool,
    reporter: ErrorReporter,
    events: VecDeque<NetworkEvent>,
    condemned: HashSet<ChannelHandle>,
    scratch: Vec<u8>,
    stats: NetworkStats,
}

impl NetworkInterface {
    pub fn new(config: NetworkConfig, table: MessageTable, now: Instant) -> Self {
        let buffers = BufferPool::new(config.buffer_capacity, config.buffer_pool_size);
        let bundles = BundlePool::new(buffers, config.bundle_pool_size);
        let reporter = ErrorReporter::new(config.report_interval(), now);
        // Large enough for one datagram or a healthy stream read.
        let scratch = vec![0u8; 64 * 1024];
        Self {
            config: Rc::new(config),
            table,
            channels: Arena::new(),
            by_addr: HashMap::new(),
            listeners: Vec::new(),
            udp_listeners: Vec::new(),
            udp_peers: HashMap::new(),
            bundles,
            reporter,
            events: VecDeque::new(),
            condemned: HashSet::new(),
            scratch,
            stats: NetworkStats::default(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn table(&self) -> &MessageTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut MessageTable {
        &mut self.table
    }

    pub fn listen_tcp<A: ToSocketAddrs>(&mut self, addr: A, traits: ChannelTraits) -> Result<SocketAddr> {
        let acceptor = TcpAcceptor::bind(addr)?;
        Ok(self.add_acceptor(Box::new(acceptor), traits, Transport::Stream))
    }

    pub fn add_acceptor(
        &mut self,
        acceptor: Box<dyn Acceptor>,
        traits: ChannelTraits,
        transport: Transport,
    ) -> SocketAddr {
        let listener = Listener::new(acceptor, traits, transport);
        let local = listener.local_addr();
        log::info!("listening on {} ({}, {:?})", local, transport, traits);
        self.listeners.push(listener);
        local
    }

    pub fn listen_udp<A: ToSocketAddrs>(
        &mut self,
        addr: A,
        traits: ChannelTraits,
        transport: Transport,
    ) -> Result<SocketAddr> {
        if !transport.is_datagram() {
            return Err(NetError::Unsupported("udp listener with a stream transport"));
        }
        let listener = UdpListener::bind(addr, traits, transport)?;
        let local = listener.local_addr();
        log::info!("listening on {} ({}, {:?})", local, transport, traits);
        self.udp_listeners.push(listener);
        Ok(local)
    }

    pub fn connect_tcp<A: ToSocketAddrs>(
        &mut self,
        addr: A,
        traits: ChannelTraits,
        now: Instant,
    ) -> Result<ChannelHandle> {
        let endpoint = TcpEndpoint::connect(addr, self.config.connect_timeout())?;
        self.register_endpoint(Box::new(endpoint), traits, Transport::Stream, false, now)
    }

    pub fn connect_udp(
        &mut self,
        peer: SocketAddr,
        traits: ChannelTraits,
        transport: Transport,
        now: Instant,
    ) -> Result<ChannelHandle> {
        let endpoint = UdpEndpoint::connect(peer)?;
        self.register_endpoint(Box::new(endpoint), traits, transport, false, now)
    }

    fn open_channel(
        &mut self,
        endpoint: Box<dyn Endpoint>,
        traits: ChannelTraits,
        transport: Transport,
        sniff: bool,
        now: Instant,
    ) -> Result<ChannelHandle> {
        let mut channel = Channel::new(
            endpoint,
            traits,
            transport,
            Rc::clone(&self.config),
            self.bundles.clone(),
            now,
        );
        if let Err(err) = channel.initialize(sniff) {
            log::warn!("channel {} failed to initialize: {}", channel.peer_addr(), err);
            channel.destroy(now);
            self.stats.rejected += 1;
            return Err(err);
        }

        let addr = channel.peer_addr();
        let handle = self.channels.insert(channel);
        self.events.push_back(NetworkEvent::ChannelOpened {
            channel: handle,
            addr,
            traits,
        });
        Ok(handle)
    }

    /// Turns an endpoint into a live channel. A channel that fails to
    /// initialize is destroyed on the spot and never registered.
    pub fn register_endpoint(
        &mut self,
        mut endpoint: Box<dyn Endpoint>,
        traits: ChannelTraits,
        transport: Transport,
        sniff: bool,
        now: Instant,
    ) -> Result<ChannelHandle> {
        let addr = endpoint.peer_addr();
        if self.by_addr.contains_key(&addr) {
            log::warn!("refusing a second channel to {}", addr);
            endpoint.close();
            self.stats.rejected += 1;
            return Err(NetError::DuplicateChannel(addr));
        }
        let handle = self.open_channel(endpoint, traits, transport, sniff, now)?;
        self.by_addr.insert(addr, handle);
        Ok(handle)
    }

    pub fn channel(&self, handle: ChannelHandle) -> Option<&Channel> {
        self.channels.get(handle)
    }

    pub fn channel_mut(&mut self, handle: ChannelHandle) -> Option<&mut Channel> {
        self.channels.get_mut(handle)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<ChannelHandle> {
        self.by_addr.get(&addr).copied().or_else(|| {
            self.udp_peers
                .iter()
                .find(|((_, peer), _)| *peer == addr)
                .map(|(_, handle)| *handle)
        })
    }

    pub fn channels(&self) -> impl Iterator<Item = (ChannelHandle, &Channel)> {
        self.channels.iter()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// A bundle shaped for the channel's transport.
    pub fn new_bundle_for(&self, handle: ChannelHandle) -> Option<Bundle> {
        self.channels.get(handle).map(Channel::new_bundle)
    }

    pub fn new_bundle(&self) -> Bundle {
        self.bundles.acquire()
    }

    pub fn release_bundle(&self, bundle: Bundle) {
        self.bundles.release(bundle);
    }

    pub fn send(&mut self, handle: ChannelHandle, bundle: Bundle) -> Result<()> {
        match self.channels.get_mut(handle) {
            Some(channel) => channel.send(bundle),
            None => {
                self.bundles.release(bundle);
                Err(NetError::ChannelNotFound)
            }
        }
    }

    pub fn condemn(&mut self, handle: ChannelHandle, reason: Reason) -> Result<bool> {
        let channel = self
            .channels
            .get_mut(handle)
            .ok_or(NetError::ChannelNotFound)?;
        channel.condemn(reason)
    }

    /// Refreshes liveness, e.g. on a heartbeat.
    pub fn touch(&mut self, handle: ChannelHandle, now: Instant) {
        if let Some(channel) = self.channels.get_mut(handle) {
            channel.touch(now);
        }
    }

    pub fn tick(&mut self, now: Instant) {
        self.accept(now);
        self.demux_datagrams(now);
        self.receive(now);
        self.send_pending(now);
        self.sweep_inactive(now);
        self.collect_condemned();
        self.destroy_condemned(now);
        self.reporter.flush(now);
    }

    fn accept(&mut self, now: Instant) {
        let cap = self.config.accept_cap;
        for index in 0..self.listeners.len() {
            let listener = &mut self.listeners[index];
            let (traits, transport) = (listener.traits(), listener.transport());
            let mut accepted = Vec::new();
            let outcome = listener.poll_accept(cap, |endpoint| {
                accepted.push(endpoint);
                AcceptAction::Continue
            });

            for endpoint in accepted {
                let addr = endpoint.peer_addr();
                if self
                    .register_endpoint(endpoint, traits, transport, true, now)
                    .is_ok()
                {
                    self.stats.accepted += 1;
                    log::debug!("accepted {} ({:?})", addr, traits);
                }
            }

            if let Some(reason) = outcome.error {
                let local = self.listeners[index].local_addr();
                self.reporter.report(reason, local, now);
            }
        }
    }

    fn demux_datagrams(&mut self, now: Instant) {
        let cap = self.config.accept_cap;
        for index in 0..self.udp_listeners.len() {
            let datagrams = match self.udp_listeners[index].recv_batch(cap, &mut self.scratch) {
                Ok(datagrams) => datagrams,
                Err(err) => {
                    let local = self.udp_listeners[index].local_addr();
                    log::warn!("udp listener {} recv failed: {}", local, err);
                    self.reporter.report(Reason::from_io(&err), local, now);
                    continue;
                }
            };

            for (addr, datagram) in datagrams {
                let handle = match self.udp_peers.get(&(index, addr)) {
                    Some(handle) => *handle,
                    None => match self.open_udp_peer(index, addr, now) {
                        Ok(handle) => handle,
                        Err(err) => {
                            log::debug!("dropping datagram from new peer {}: {}", addr, err);
                            continue;
                        }
                    },
                };
                if let Some(channel) = self.channels.get_mut(handle) {
                    channel.on_bytes(&datagram, &self.table, now);
                }
            }
        }
    }

    fn open_udp_peer(&mut self, index: usize, addr: SocketAddr, now: Instant) -> Result<ChannelHandle> {
        let listener = &self.udp_listeners[index];
        let (traits, transport) = (listener.traits(), listener.transport());
        let endpoint = UdpEndpoint::shared(listener.socket(), addr)?;
        let handle = self.open_channel(Box::new(endpoint), traits, transport, false, now)?;
        self.udp_peers.insert((index, addr), handle);
        self.stats.accepted += 1;
        log::debug!("new udp peer {} ({}, {:?})", addr, transport, traits);
        Ok(handle)
    }

    fn receive(&mut self, now: Instant) {
        for (handle, channel) in self.channels.iter_mut() {
            channel.process_recv(&self.table, &mut self.scratch, now, &mut self.reporter);
            channel.tick(now);
            while let Some(message) = channel.pop_message() {
                self.events.push_back(NetworkEvent::Message {
                    channel: handle,
                    message,
                });
            }
        }
    }

    fn send_pending(&mut self, now: Instant) {
        for (_, channel) in self.channels.iter_mut() {
            if let SendStatus::Failing(count) = channel.process_send(now, &mut self.reporter) {
                log::trace!("channel {} send failing ({})", channel.peer_addr(), count);
            }
        }
    }

    fn sweep_inactive(&mut self, now: Instant) {
        let internal = self.config.internal_inactivity();
        let external = self.config.external_inactivity();
        for (_, channel) in self.channels.iter_mut() {
            if channel.state() != ChannelState::Active {
                continue;
            }
            let timeout = match channel.traits() {
                ChannelTraits::Internal => internal,
                ChannelTraits::External => external,
            };
            if channel.is_inactive(now, timeout) {
                log::info!(
                    "channel {} silent for over {:?}",
                    channel.peer_addr(),
                    timeout
                );
                let _ = channel.condemn(Reason::InactivityTimeout);
            }
        }
    }

    fn collect_condemned(&mut self) {
        for (handle, channel) in self.channels.iter() {
            if channel.state().is_condemned() && self.condemned.insert(handle) {
                self.stats.condemned += 1;
                self.events.push_back(NetworkEvent::ChannelCondemned {
                    channel: handle,
                    addr: channel.peer_addr(),
                    reason: channel.condemn_reason().unwrap_or(Reason::ChannelCondemned),
                });
            }
        }
    }

    fn destroy_condemned(&mut self, now: Instant) {
        let grace = self.config.condemn_grace();
        let doomed: Vec<ChannelHandle> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.ready_to_destroy(now, grace))
            .map(|(handle, _)| handle)
            .collect();

        for handle in doomed {
            self.retire(handle, now);
        }
    }

    fn retire(&mut self, handle: ChannelHandle, now: Instant) {
        let Ok(mut channel) = self.channels.remove(handle) else {
            return;
        };
        channel.destroy(now);
        let addr = channel.peer_addr();
        self.by_addr.retain(|_, h| *h != handle);
        self.udp_peers.retain(|_, h| *h != handle);
        self.condemned.remove(&handle);
        self.stats.retired.merge(&channel.stats());
        self.stats.destroyed += 1;
        log::debug!("channel {} destroyed", addr);
        self.events.push_back(NetworkEvent::ChannelClosed {
            channel: handle,
            addr,
            reason: channel.condemn_reason(),
        });
    }

    pub fn drain_events(&mut self) -> Vec<NetworkEvent> {
        self.events.drain(..).collect()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.stats;
        let mut live = ChannelStats::default();
        for (_, channel) in self.channels.iter() {
            live.merge(&channel.stats());
        }
        stats.live = live;
        stats.channels = self.channels.len();
        stats
    }

    /// Flushes what can be flushed and tears every channel down.
    pub fn shutdown(&mut self, now: Instant) {
        for handle in self.channels.handles() {
            if let Some(channel) = self.channels.get_mut(handle) {
                let _ = channel.condemn(Reason::ChannelLost);
            }
            self.retire(handle, now);
        }
        self.reporter.flush_now(now);
        log::info!("network interface shut down");
    }
}
