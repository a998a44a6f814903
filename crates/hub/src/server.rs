use std::collections::{HashSet, VecDeque};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use backbone::{
    ACTIVE_TICK, ActiveTick, CROSS_SERVER_CALL, ChannelFlags, ChannelHandle, ChannelTraits,
    ClusterId, ComponentAnnounce, ComponentInfo, ComponentRegistry, ComponentType, DataWrite,
    GLOBAL_DATA_WRITE, GlobalData, Message, NetworkEvent, NetworkInterface, NetworkStats,
    REGISTER, Reactor, Reason, RegisterAck, RegisterRequest, Snapshot, WorkerPool,
    announce_component, cluster_of, control_table, relay, replay_components,
};

use crate::config::HubConfig;
use crate::events::{HubEvent, LossReason};
use crate::tui::ComponentRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubTimer {
    Heartbeat,
    StaleSweep,
    Snapshot,
}

#[derive(Debug)]
struct SnapshotWrite {
    path: PathBuf,
    entries: usize,
    error: Option<String>,
}

pub struct HubServer {
    net: NetworkInterface,
    registry: ComponentRegistry,
    data: GlobalData,
    reactor: Reactor<HubTimer>,
    workers: WorkerPool<SnapshotWrite>,
    config: HubConfig,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    start_time: Instant,
    tick: u64,
    forwarded: u64,
    dropped: u64,
    pending_events: VecDeque<HubEvent>,
}

impl HubServer {
    pub fn new(config: HubConfig) -> Result<Self> {
        let now = Instant::now();
        let mut net = NetworkInterface::new(config.network.clone(), control_table(), now);
        let local_addr = net
            .listen_tcp(config.bind_addr(), ChannelTraits::Internal)
            .with_context(|| format!("listening on {}", config.bind_addr()))?;

        let data = match &config.snapshot_path {
            Some(path) if path.exists() => load_snapshot(path)?,
            _ => GlobalData::new(),
        };

        let mut reactor = Reactor::new(config.tick_duration());
        reactor.add_periodic(now, config.heartbeat_period(), HubTimer::Heartbeat);
        reactor.add_periodic(now, config.heartbeat_period(), HubTimer::StaleSweep);
        if config.snapshot_path.is_some() {
            reactor.add_periodic(now, config.snapshot_interval(), HubTimer::Snapshot);
        }

        let workers = WorkerPool::from_config(&config.network).context("starting worker pool")?;

        let mut pending_events = VecDeque::new();
        pending_events.push_back(HubEvent::Listening { addr: local_addr });

        Ok(Self {
            net,
            registry: ComponentRegistry::new(),
            data,
            running: reactor.running(),
            reactor,
            workers,
            config,
            local_addr,
            start_time: now,
            tick: 0,
            forwarded: 0,
            dropped: 0,
            pending_events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = HubEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            let start = Instant::now();
            self.tick_once();
            for event in self.pending_events.drain(..) {
                log_event(&event);
            }

            let mut wake = start + self.reactor.tick_interval();
            if let Some(deadline) = self.reactor.next_deadline() {
                wake = wake.min(deadline);
            }
            let now = Instant::now();
            if wake > now {
                std::thread::sleep(wake - now);
            }
        }
        self.shutdown_connections();
    }

    pub fn shutdown_connections(&mut self) {
        let now = Instant::now();
        if let Some(path) = self.config.snapshot_path.clone() {
            let write = write_snapshot(path, self.data.snapshot());
            self.on_snapshot_written(write);
        }
        self.net.shutdown(now);
        self.workers.shutdown(Duration::from_secs(1));
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.tick += 1;

        self.net.tick(now);
        for event in self.net.drain_events() {
            self.handle_network_event(event, now);
        }

        for timer in self.reactor.poll(now) {
            match timer {
                HubTimer::Heartbeat => self.send_heartbeats(),
                HubTimer::StaleSweep => self.sweep_stale(now),
                HubTimer::Snapshot => self.schedule_snapshot(),
            }
        }

        for done in self.workers.drain() {
            self.on_snapshot_written(done.output);
        }
    }

    fn handle_network_event(&mut self, event: NetworkEvent, now: Instant) {
        match event {
            NetworkEvent::ChannelOpened { addr, .. } => {
                log::debug!("peer connected from {}", addr);
            }
            NetworkEvent::Message { channel, message } => {
                self.handle_message(channel, message, now);
            }
            NetworkEvent::ChannelCondemned { addr, reason, .. } => {
                self.pending_events
                    .push_back(HubEvent::ChannelCondemned { addr, reason });
            }
            NetworkEvent::ChannelClosed { channel, .. } => {
                let cluster = cluster_of(&self.registry, channel);
                for info in self.registry.deregister(channel) {
                    if let Some(cluster) = cluster {
                        self.announce_removal(&info, cluster);
                    }
                    self.pending_events.push_back(HubEvent::ComponentLost {
                        component_type: info.component_type,
                        component_id: info.component_id,
                        reason: LossReason::Disconnected,
                    });
                }
            }
        }
    }

    fn handle_message(&mut self, channel: ChannelHandle, message: Message, now: Instant) {
        if message.id == REGISTER.id {
            self.handle_register(channel, &message, now);
        } else if message.id == ACTIVE_TICK.id {
            self.handle_active_tick(channel, &message, now);
        } else if message.id == CROSS_SERVER_CALL.id {
            self.handle_cross_server_call(channel, &message);
        } else if message.id == GLOBAL_DATA_WRITE.id {
            self.handle_data_write(channel, &message);
        } else {
            log::debug!("ignoring message {} from {}", message.id, channel);
        }
    }

    fn peer_addr(&self, channel: ChannelHandle) -> Option<SocketAddr> {
        self.net.channel(channel).map(|c| c.peer_addr())
    }

    fn handle_register(&mut self, channel: ChannelHandle, message: &Message, now: Instant) {
        let Some(addr) = self.peer_addr(channel) else {
            return;
        };
        let registration =
            RegisterRequest::decode(&message.payload).and_then(|request| request.to_registration());
        let registration = match registration {
            Ok(registration) => registration,
            Err(err) => {
                self.reply(channel, &RegisterAck::rejected(err.to_string()));
                self.pending_events.push_back(HubEvent::RegistrationRejected {
                    addr,
                    reason: err.to_string(),
                });
                return;
            }
        };

        let info = self.registry.register(registration, Some(channel), now).clone();
        let cluster = cluster_of(&self.registry, channel).unwrap_or(info.global_order);
        let ack = RegisterAck::accepted(info.global_order, info.group_order, cluster);

        if let Some(ch) = self.net.channel_mut(channel) {
            ch.set_flag(ChannelFlags::REGISTERED);
        }
        self.reply(channel, &ack);
        self.data.replay(&mut self.net, channel);
        replay_components(&mut self.net, &self.registry, channel);
        announce_component(
            &mut self.net,
            &self.registry,
            &ComponentAnnounce::of(&info, cluster, false),
            Some(channel),
        );
        self.pending_events.push_back(HubEvent::ComponentRegistered {
            component_type: info.component_type,
            component_id: info.component_id,
            addr,
            global_order: info.global_order,
        });
    }

    fn reply(&mut self, channel: ChannelHandle, ack: &RegisterAck) {
        let Some(mut bundle) = self.net.new_bundle_for(channel) else {
            return;
        };
        if let Err(err) = ack.write(&mut bundle) {
            self.net.release_bundle(bundle);
            self.pending_events.push_back(HubEvent::Error {
                message: format!("Failed to encode registration reply: {}", err),
            });
            return;
        }
        if let Err(err) = self.net.send(channel, bundle) {
            log::debug!("registration reply to {} not sent: {}", channel, err);
        }
    }

    fn handle_active_tick(&mut self, channel: ChannelHandle, message: &Message, now: Instant) {
        match ActiveTick::parse(message) {
            Ok(tick) => {
                if !self
                    .registry
                    .on_active_tick(tick.component_type, tick.component_id, now)
                {
                    log::debug!(
                        "heartbeat from unregistered {} {}",
                        tick.component_type,
                        tick.component_id
                    );
                }
                self.net.touch(channel, now);
            }
            Err(err) => log::warn!("bad heartbeat on {}: {}", channel, err),
        }
    }

    fn handle_cross_server_call(&mut self, channel: ChannelHandle, message: &Message) {
        match relay(&mut self.net, &self.registry, channel, &message.payload) {
            Ok(forward) => {
                self.forwarded += 1;
                self.pending_events.push_back(HubEvent::CallForwarded {
                    entity_id: forward.envelope.entity_id,
                    origin: forward.envelope.origin_cluster,
                    dest: forward.envelope.dest_cluster,
                });
            }
            Err(err) => {
                self.dropped += 1;
                log::warn!("dropping cross-server call from {}: {}", channel, err);
                self.pending_events.push_back(HubEvent::CallDropped {
                    reason: err.to_string(),
                });
            }
        }
    }

    fn handle_data_write(&mut self, channel: ChannelHandle, message: &Message) {
        let write = match DataWrite::parse(message) {
            Ok(write) => write,
            Err(err) => {
                log::warn!("bad global data write on {}: {}", channel, err);
                return;
            }
        };
        let writer = self
            .registry
            .find_by_channel(channel)
            .first()
            .map(|info| info.component_type)
            .unwrap_or(ComponentType::Unknown);

        let Some(change) = self.data.apply(write, writer) else {
            return;
        };
        let peers = self
            .data
            .broadcast(&mut self.net, &self.registry, &change, Some(channel));
        self.pending_events.push_back(HubEvent::DataChanged {
            key: String::from_utf8_lossy(&change.key).into_owned(),
            is_delete: change.is_delete,
            peers,
        });
    }

    fn send_heartbeats(&mut self) {
        let tick = ActiveTick {
            component_type: ComponentType::Centermgr,
            component_id: self.config.component_id,
        };
        let channels: HashSet<ChannelHandle> =
            self.registry.iter().filter_map(|info| info.channel).collect();
        for channel in channels {
            let Some(mut bundle) = self.net.new_bundle_for(channel) else {
                continue;
            };
            if tick.write(&mut bundle).is_err() {
                self.net.release_bundle(bundle);
                continue;
            }
            let _ = self.net.send(channel, bundle);
        }
    }

    fn sweep_stale(&mut self, now: Instant) {
        for (component_type, component_id) in
            self.registry.stale(now, self.config.liveness_timeout())
        {
            let cluster = self
                .registry
                .find(component_type, component_id)
                .and_then(|info| info.channel)
                .and_then(|channel| cluster_of(&self.registry, channel));
            let Some(info) = self.registry.remove(component_type, component_id) else {
                continue;
            };
            if let Some(cluster) = cluster {
                self.announce_removal(&info, cluster);
            }
            if let Some(channel) = info.channel {
                let _ = self.net.condemn(channel, Reason::InactivityTimeout);
            }
            self.pending_events.push_back(HubEvent::ComponentLost {
                component_type,
                component_id,
                reason: LossReason::Stale,
            });
        }
    }

    fn announce_removal(&mut self, info: &ComponentInfo, cluster: ClusterId) {
        let announce = ComponentAnnounce::of(info, cluster, true);
        announce_component(&mut self.net, &self.registry, &announce, info.channel);
    }

    fn schedule_snapshot(&mut self) {
        let Some(path) = self.config.snapshot_path.clone() else {
            return;
        };
        // Overlapping writes to one file could land out of order.
        if self.workers.in_flight() > 0 {
            log::debug!("snapshot skipped: previous write still running");
            return;
        }
        let snapshot = self.data.snapshot();
        let submitted = self.workers.submit(move |token| {
            if token.is_cancelled() {
                return SnapshotWrite {
                    path,
                    entries: 0,
                    error: Some("cancelled".to_string()),
                };
            }
            write_snapshot(path, snapshot)
        });
        if let Err(err) = submitted {
            log::debug!("snapshot skipped: {}", err);
        }
    }

    fn on_snapshot_written(&mut self, write: SnapshotWrite) {
        match write.error {
            None => self.pending_events.push_back(HubEvent::SnapshotWritten {
                path: write.path,
                entries: write.entries,
            }),
            Some(error) => self.pending_events.push_back(HubEvent::Error {
                message: format!("Failed to write {}: {}", write.path.display(), error),
            }),
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            tick: self.tick,
            cluster_id: self.config.cluster_id,
            component_count: self.registry.len(),
            forwarded: self.forwarded,
            dropped: self.dropped,
            global_entries: self.data.len(),
            global_writes: self.data.writes(),
            reported_errors: self.net.reporter().total(),
            network: self.net.stats(),
        }
    }

    pub fn component_rows(&self) -> Vec<ComponentRow> {
        let now = Instant::now();
        let mut rows: Vec<ComponentRow> = self
            .registry
            .iter()
            .map(|info| ComponentRow {
                component_type: info.component_type,
                component_id: info.component_id,
                addr: info.internal_addr.to_string(),
                global_order: info.global_order,
                group_order: info.group_order,
                idle_secs: now.duration_since(info.last_active).as_secs(),
            })
            .collect();
        rows.sort_by_key(|row| row.global_order);
        rows
    }
}

fn load_snapshot(path: &Path) -> Result<GlobalData> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&text)
        .with_context(|| format!("parsing snapshot {}", path.display()))?;
    let data = GlobalData::restore(&snapshot)
        .with_context(|| format!("restoring snapshot {}", path.display()))?;
    log::info!("restored {} global data entries from {}", data.len(), path.display());
    Ok(data)
}

fn write_snapshot(path: PathBuf, snapshot: Snapshot) -> SnapshotWrite {
    let entries = snapshot.entries.len();
    let result = serde_json::to_vec_pretty(&snapshot)
        .map_err(|err| err.to_string())
        .and_then(|json| fs::write(&path, json).map_err(|err| err.to_string()));
    SnapshotWrite {
        path,
        entries,
        error: result.err(),
    }
}

fn log_event(event: &HubEvent) {
    match event {
        HubEvent::Listening { addr } => log::info!("Hub listening on {}", addr),
        HubEvent::ComponentRegistered {
            component_type,
            component_id,
            addr,
            global_order,
        } => log::info!(
            "{} {} registered from {} as cluster {}",
            component_type,
            component_id,
            addr,
            global_order
        ),
        HubEvent::RegistrationRejected { addr, reason } => {
            log::warn!("Registration from {} rejected: {}", addr, reason)
        }
        HubEvent::ComponentLost {
            component_type,
            component_id,
            reason,
        } => log::info!("{} {} {}", component_type, component_id, reason.as_str()),
        HubEvent::CallForwarded {
            entity_id,
            origin,
            dest,
        } => log::debug!("Forwarded call for entity {} from {} to {}", entity_id, origin, dest),
        HubEvent::CallDropped { reason } => log::debug!("Dropped call: {}", reason),
        HubEvent::DataChanged {
            key,
            is_delete,
            peers,
        } => log::debug!(
            "Global data {} {} ({} peers)",
            if *is_delete { "deleted" } else { "set" },
            key,
            peers
        ),
        HubEvent::ChannelCondemned { addr, reason } => {
            log::info!("Channel to {} condemned: {}", addr, reason)
        }
        HubEvent::SnapshotWritten { path, entries } => {
            log::debug!("Wrote {} entries to {}", entries, path.display())
        }
        HubEvent::Error { message } => log::error!("{}", message),
    }
}

#[derive(Debug, Clone)]
pub struct HubStats {
    pub uptime_secs: u64,
    pub tick: u64,
    pub cluster_id: ClusterId,
    pub component_count: usize,
    pub forwarded: u64,
    pub dropped: u64,
    pub global_entries: usize,
    pub global_writes: u64,
    pub reported_errors: u64,
    pub network: NetworkStats,
}

#[cfg(test)]
mod tests {
    use std::thread;

    use backbone::{COMPONENT_ANNOUNCE, NetworkConfig, REGISTER_ACK, Registration};

    use super::*;

    fn test_config() -> HubConfig {
        HubConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    struct Peer {
        net: NetworkInterface,
        inbox: Vec<Message>,
    }

    fn connect_peer(hub: &HubServer, component_id: u64) -> Peer {
        let mut net =
            NetworkInterface::new(NetworkConfig::default(), control_table(), Instant::now());
        let channel = net
            .connect_tcp(hub.local_addr(), ChannelTraits::Internal, Instant::now())
            .unwrap();

        let registration = Registration {
            component_type: ComponentType::Baseappmgr,
            component_id,
            internal_addr: "127.0.0.1:30000".parse().unwrap(),
            external_addr: None,
            external_alias: String::new(),
        };
        let mut bundle = net.new_bundle_for(channel).unwrap();
        RegisterRequest::from_registration(&registration)
            .write(&mut bundle)
            .unwrap();
        net.send(channel, bundle).unwrap();
        Peer {
            net,
            inbox: Vec::new(),
        }
    }

    /// Ticks the hub and `peer` until `pick` accepts one of the peer's
    /// messages. Messages it rejects stay in the inbox.
    fn wait_for<T>(
        hub: &mut HubServer,
        peer: &mut Peer,
        pick: impl Fn(&Message) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some((index, found)) = peer
                .inbox
                .iter()
                .enumerate()
                .find_map(|(index, message)| pick(message).map(|found| (index, found)))
            {
                peer.inbox.remove(index);
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            hub.tick_once();
            peer.net.tick(Instant::now());
            for event in peer.net.drain_events() {
                if let NetworkEvent::Message { message, .. } = event {
                    peer.inbox.push(message);
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn ack_of(message: &Message) -> Option<RegisterAck> {
        (message.id == REGISTER_ACK.id)
            .then(|| RegisterAck::decode(&message.payload).ok())
            .flatten()
    }

    fn announce_of(message: &Message) -> Option<ComponentAnnounce> {
        (message.id == COMPONENT_ANNOUNCE.id)
            .then(|| ComponentAnnounce::parse(message).ok())
            .flatten()
    }

    #[test]
    fn test_register_is_acknowledged() {
        let mut hub = HubServer::new(test_config()).unwrap();
        let mut peer = connect_peer(&hub, 42);

        let ack = wait_for(&mut hub, &mut peer, ack_of).unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.global_order, 1);
        assert_eq!(ack.cluster, 1);
        assert_eq!(hub.stats().component_count, 1);
        assert_eq!(hub.component_rows()[0].component_id, 42);
        let (_, registered) = hub.net.channels().next().unwrap();
        assert!(registered.flags().contains(ChannelFlags::REGISTERED));
        assert!(
            hub.drain_events()
                .any(|event| matches!(event, HubEvent::ComponentRegistered { .. }))
        );
    }

    #[test]
    fn test_peers_learn_where_components_live() {
        let mut hub = HubServer::new(test_config()).unwrap();
        let mut first = connect_peer(&hub, 10);
        let first_cluster = wait_for(&mut hub, &mut first, ack_of).unwrap().cluster;

        let mut second = connect_peer(&hub, 20);
        let second_cluster = wait_for(&mut hub, &mut second, ack_of).unwrap().cluster;
        assert_ne!(first_cluster, second_cluster);

        // The late peer gets the directory replayed.
        let replayed = wait_for(&mut hub, &mut second, announce_of).unwrap();
        assert_eq!(replayed.component_id, 10);
        assert_eq!(replayed.cluster, first_cluster);
        assert!(!replayed.removed);

        // The earlier peer is told about the newcomer.
        let announced = wait_for(&mut hub, &mut first, announce_of).unwrap();
        assert_eq!(announced.component_id, 20);
        assert_eq!(announced.cluster, second_cluster);
    }

    #[test]
    fn test_worker_pool_follows_network_config() {
        let mut config = test_config();
        config.network.worker_threads = 2;
        config.network.worker_max_in_flight = 3;
        let hub = HubServer::new(config).unwrap();
        assert_eq!(hub.workers.max_in_flight(), 3);
    }

    #[test]
    fn test_snapshot_written_and_restored() {
        let path = std::env::temp_dir().join(format!("backbone-hub-{}.json", std::process::id()));
        let mut data = GlobalData::new();
        data.apply(
            DataWrite {
                key: b"motd".to_vec(),
                value: Some(b"hello".to_vec()),
            },
            ComponentType::Dbmgr,
        );

        let write = write_snapshot(path.clone(), data.snapshot());
        assert!(write.error.is_none());
        assert_eq!(write.entries, 1);

        let restored = load_snapshot(&path).unwrap();
        assert_eq!(restored.get(b"motd"), Some(&b"hello"[..]));
        let _ = fs::remove_file(&path);
    }
}
