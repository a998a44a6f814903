use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use backbone::{
    AcceptAction, Acceptor, BufferPool, BundlePool, Channel, ChannelState, ChannelTraits, Endpoint,
    EndpointKind, ErrorReporter, Listener, MessageSpec, MessageTable, NetworkConfig, NetworkEvent,
    NetworkInterface, Reason, SendStatus, Transport,
};

const NOTE: MessageSpec = MessageSpec::variable(50, "note");

/// An endpoint whose send results are scripted; once the script runs out
/// every send succeeds.
struct Scripted {
    sends: Rc<RefCell<VecDeque<io::ErrorKind>>>,
    written: Rc<RefCell<Vec<u8>>>,
    port: u16,
}

impl Endpoint for Scripted {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Stream
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.sends.borrow_mut().pop_front() {
            return Err(kind.into());
        }
        self.written.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }

    fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn peer_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1))
    }
}

struct Harness {
    channel: Channel,
    sends: Rc<RefCell<VecDeque<io::ErrorKind>>>,
    written: Rc<RefCell<Vec<u8>>>,
    reporter: ErrorReporter,
}

impl Harness {
    fn new(traits: ChannelTraits) -> Self {
        let sends = Rc::new(RefCell::new(VecDeque::new()));
        let written = Rc::new(RefCell::new(Vec::new()));
        let endpoint = Scripted {
            sends: Rc::clone(&sends),
            written: Rc::clone(&written),
            port: 7000,
        };
        let now = Instant::now();
        let mut channel = Channel::new(
            Box::new(endpoint),
            traits,
            Transport::Stream,
            Rc::new(NetworkConfig::default()),
            BundlePool::new(BufferPool::default(), 16),
            now,
        );
        channel.initialize(false).unwrap();
        Self {
            channel,
            sends,
            written,
            reporter: ErrorReporter::new(Duration::from_secs(10), now),
        }
    }

    fn fail_next(&self, count: usize, kind: io::ErrorKind) {
        self.sends.borrow_mut().extend(std::iter::repeat_n(kind, count));
    }

    fn queue_note(&mut self, body: u32) {
        let mut bundle = self.channel.new_bundle();
        bundle.new_message(NOTE).unwrap();
        bundle.write(&body);
        self.channel.send(bundle).unwrap();
    }

    fn attempt(&mut self) -> SendStatus {
        self.channel.process_send(Instant::now(), &mut self.reporter)
    }
}

#[test]
fn test_external_channel_condemned_after_ten_failures() {
    let mut harness = Harness::new(ChannelTraits::External);
    harness.queue_note(1);
    harness.fail_next(10, io::ErrorKind::WouldBlock);

    for attempt in 1..10 {
        assert_eq!(harness.attempt(), SendStatus::Failing(attempt));
        assert_eq!(harness.channel.state(), ChannelState::Active);
    }
    assert_eq!(
        harness.attempt(),
        SendStatus::Condemned(Reason::TransientResourceUnavailable)
    );
    assert_eq!(harness.channel.state(), ChannelState::Condemned);
    assert_eq!(harness.channel.pending_bundles(), 1);
    assert!(harness.reporter.total() >= 1);

    // Already queued data still drains once the socket recovers.
    assert_eq!(harness.attempt(), SendStatus::Flushed);
    assert_eq!(harness.channel.pending_bundles(), 0);
}

#[test]
fn test_internal_channel_survives_the_same_failures() {
    let mut harness = Harness::new(ChannelTraits::Internal);
    harness.queue_note(1);
    harness.fail_next(15, io::ErrorKind::WouldBlock);

    for _ in 0..15 {
        assert!(matches!(harness.attempt(), SendStatus::Failing(_)));
    }
    assert_eq!(harness.channel.state(), ChannelState::Active);
    assert_eq!(harness.channel.send_failures(), 15);
    assert!(harness.reporter.total() >= 1);

    assert_eq!(harness.attempt(), SendStatus::Flushed);
    assert_eq!(harness.channel.send_failures(), 0);
    assert_eq!(harness.written.borrow().len(), 2 + 2 + 4);
}

#[test]
fn test_hard_error_condemns_regardless_of_traits() {
    for traits in [ChannelTraits::Internal, ChannelTraits::External] {
        let mut harness = Harness::new(traits);
        harness.queue_note(7);
        harness.fail_next(1, io::ErrorKind::PermissionDenied);

        assert_eq!(
            harness.attempt(),
            SendStatus::Condemned(Reason::FatalSocketError)
        );
        assert_eq!(harness.channel.state(), ChannelState::CondemnedAndDestroy);
        assert!(harness.channel.ready_to_destroy(Instant::now(), Duration::from_secs(5)));
    }
}

#[test]
fn test_failures_keep_fifo_order() {
    let mut harness = Harness::new(ChannelTraits::External);
    harness.queue_note(1);
    harness.queue_note(2);
    harness.fail_next(3, io::ErrorKind::WouldBlock);
    for _ in 0..3 {
        harness.attempt();
    }
    harness.queue_note(3);
    assert_eq!(harness.attempt(), SendStatus::Flushed);

    let written = harness.written.borrow();
    let bodies: Vec<u32> = written
        .chunks(8)
        .map(|chunk| u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]))
        .collect();
    assert_eq!(bodies, vec![1, 2, 3]);
}

struct Burst {
    remaining: usize,
    next_port: u16,
}

impl Acceptor for Burst {
    fn accept(&mut self) -> io::Result<Box<dyn Endpoint>> {
        if self.remaining == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.remaining -= 1;
        self.next_port += 1;
        Ok(Box::new(Scripted {
            sends: Rc::new(RefCell::new(VecDeque::new())),
            written: Rc::new(RefCell::new(Vec::new())),
            port: self.next_port,
        }))
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9999))
    }
}

#[test]
fn test_accept_burst_is_bounded_per_tick() {
    let mut net = NetworkInterface::new(
        NetworkConfig::default(),
        MessageTable::with(&[NOTE]),
        Instant::now(),
    );
    net.add_acceptor(
        Box::new(Burst {
            remaining: 300,
            next_port: 10000,
        }),
        ChannelTraits::Internal,
        Transport::Stream,
    );

    net.tick(Instant::now());
    assert_eq!(net.channel_count(), 256);
    let opened = net
        .drain_events()
        .iter()
        .filter(|e| matches!(e, NetworkEvent::ChannelOpened { .. }))
        .count();
    assert_eq!(opened, 256);

    net.tick(Instant::now());
    assert_eq!(net.channel_count(), 300);
    assert_eq!(net.stats().accepted, 300);
}

#[test]
fn test_listener_yields_at_cap() {
    let mut listener = Listener::new(
        Box::new(Burst {
            remaining: 1000,
            next_port: 20000,
        }),
        ChannelTraits::External,
        Transport::Stream,
    );
    let mut seen = 0;
    let outcome = listener.poll_accept(256, |_| {
        seen += 1;
        AcceptAction::Continue
    });
    assert_eq!(seen, 256);
    assert!(outcome.saturated);
}
