use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::rc::Rc;

use crate::channel::ChannelTraits;
use crate::endpoint::{Endpoint, TcpEndpoint};
use crate::error::Reason;
use crate::transport::Transport;

/// Source of freshly accepted endpoints.
pub trait Acceptor {
    fn accept(&mut self) -> io::Result<Box<dyn Endpoint>>;

    fn local_addr(&self) -> SocketAddr;
}

pub struct TcpAcceptor {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpAcceptor {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        Ok(Self { listener, local })
    }
}

impl Acceptor for TcpAcceptor {
    fn accept(&mut self) -> io::Result<Box<dyn Endpoint>> {
        let (stream, _) = self.listener.accept()?;
        Ok(Box::new(TcpEndpoint::from_stream(stream)?))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptAction {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptOutcome {
    pub accepted: usize,
    /// The cap was hit with connections possibly still waiting.
    pub saturated: bool,
    pub error: Option<Reason>,
}

pub struct Listener {
    acceptor: Box<dyn Acceptor>,
    traits: ChannelTraits,
    transport: Transport,
}

impl Listener {
    pub fn new(acceptor: Box<dyn Acceptor>, traits: ChannelTraits, transport: Transport) -> Self {
        Self {
            acceptor,
            traits,
            transport,
        }
    }

    pub fn traits(&self) -> ChannelTraits {
        self.traits
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Accepts at most `cap` connections, then yields back to the reactor.
    pub fn poll_accept<F>(&mut self, cap: usize, mut on_accept: F) -> AcceptOutcome
    where
        F: FnMut(Box<dyn Endpoint>) -> AcceptAction,
    {
        let mut outcome = AcceptOutcome::default();

        while outcome.accepted < cap {
            match self.acceptor.accept() {
                Ok(endpoint) => {
                    outcome.accepted += 1;
                    if on_accept(endpoint) == AcceptAction::Stop {
                        return outcome;
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        log::warn!("accept on {} failed: {}", self.local_addr(), err);
                        outcome.error = Some(Reason::from_io(&err));
                    }
                    return outcome;
                }
            }
        }

        outcome.saturated = true;
        if outcome.accepted > 0 {
            log::debug!(
                "listener {} hit its accept cap of {}",
                self.local_addr(),
                cap
            );
        }
        outcome
    }
}

/// A UDP socket whose peers become channels. Datagrams are read here and
/// routed by source address.
pub struct UdpListener {
    socket: Rc<UdpSocket>,
    local: SocketAddr,
    traits: ChannelTraits,
    transport: Transport,
}

impl UdpListener {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        traits: ChannelTraits,
        transport: Transport,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Rc::new(socket),
            local,
            traits,
            transport,
        })
    }

    pub fn socket(&self) -> Rc<UdpSocket> {
        Rc::clone(&self.socket)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn traits(&self) -> ChannelTraits {
        self.traits
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Reads at most `cap` datagrams.
    pub fn recv_batch(&self, cap: usize, scratch: &mut [u8]) -> io::Result<Vec<(SocketAddr, Vec<u8>)>> {
        let mut datagrams = Vec::new();
        while datagrams.len() < cap {
            match self.socket.recv_from(scratch) {
                Ok((size, addr)) => datagrams.push((addr, scratch[..size].to_vec())),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send surfaces here.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(datagrams)
    }
}
