use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::time::Duration;

use crate::error::{NetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Stream,
    Datagram,
}

/// A nonblocking OS socket bound to one peer.
///
/// `recv` returning `Ok(0)` on a stream means the peer closed. Datagram
/// endpoints deliver one datagram per call.
pub trait Endpoint {
    fn kind(&self) -> EndpointKind;

    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Datagram endpoints only talk to their bound peer.
    fn send_to(&mut self, _data: &[u8], _addr: SocketAddr) -> Result<usize> {
        Err(NetError::Unsupported("datagram send to an arbitrary address"))
    }

    fn peer_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> SocketAddr;

    fn close(&mut self) {}
}

pub struct TcpEndpoint {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
}

impl TcpEndpoint {
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved")))
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Self {
            stream,
            peer,
            local,
        })
    }
}

impl Endpoint for TcpEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Stream
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        self.stream.write(data)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.stream.read(buf)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// A UDP peer. Either owns a connected socket, or shares a listening socket
/// whose datagrams are demultiplexed by the listener and injected into the
/// channel; in that case `recv` always reports `WouldBlock`.
pub struct UdpEndpoint {
    socket: Rc<UdpSocket>,
    peer: SocketAddr,
    local: SocketAddr,
    connected: bool,
}

impl UdpEndpoint {
    pub fn connect(peer: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(peer)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Rc::new(socket),
            peer,
            local,
            connected: true,
        })
    }

    pub fn shared(socket: Rc<UdpSocket>, peer: SocketAddr) -> io::Result<Self> {
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            peer,
            local,
            connected: false,
        })
    }

    pub fn is_shared(&self) -> bool {
        !self.connected
    }
}

impl Endpoint for UdpEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Datagram
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.connected {
            self.socket.send(data)
        } else {
            self.socket.send_to(data, self.peer)
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.connected {
            self.socket.recv(buf)
        } else {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_send_to_is_unsupported() {
        let mut endpoint = UdpEndpoint::connect("127.0.0.1:9".parse().unwrap()).unwrap();
        let result = endpoint.send_to(b"x", "127.0.0.1:10".parse().unwrap());
        assert!(matches!(result, Err(NetError::Unsupported(_))));
    }

    #[test]
    fn test_shared_endpoint_never_reads() {
        let socket = Rc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        socket.set_nonblocking(true).unwrap();
        let mut endpoint = UdpEndpoint::shared(socket, "127.0.0.1:9".parse().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let err = endpoint.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
