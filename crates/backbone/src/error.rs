use std::io;

use thiserror::Error;

use crate::message::FrameError;

/// Outcome classification shared by the transport and routing layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Success,
    TransientResourceUnavailable,
    ProtocolMismatch,
    ChannelCondemned,
    FatalSocketError,
    RouteNotFound,
    InactivityTimeout,
    ChannelLost,
}

impl Reason {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory => Reason::TransientResourceUnavailable,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Reason::ChannelLost,
            io::ErrorKind::InvalidData => Reason::ProtocolMismatch,
            _ => Reason::FatalSocketError,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Reason::TransientResourceUnavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Success => "success",
            Reason::TransientResourceUnavailable => "resource temporarily unavailable",
            Reason::ProtocolMismatch => "protocol mismatch",
            Reason::ChannelCondemned => "channel condemned",
            Reason::FatalSocketError => "fatal socket error",
            Reason::RouteNotFound => "route not found",
            Reason::InactivityTimeout => "inactivity timeout",
            Reason::ChannelLost => "channel lost",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("channel is condemned")]
    ChannelCondemned,

    #[error("channel not found")]
    ChannelNotFound,

    #[error("channel already registered for {0}")]
    DuplicateChannel(std::net::SocketAddr),

    #[error("illegal channel transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("message of {len} bytes does not fit a {max} byte datagram")]
    MessageTooLarge { len: usize, max: usize },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("worker pool is saturated ({0} tasks in flight)")]
    WorkerBusy(usize),

    #[error("reliable send window full ({0} segments unacknowledged)")]
    WindowFull(usize),

    #[error("peer unresponsive after {0} retransmissions")]
    PeerUnresponsive(u32),
}

impl NetError {
    pub fn reason(&self) -> Reason {
        match self {
            NetError::Io(e) => Reason::from_io(e),
            NetError::Frame(_) => Reason::ProtocolMismatch,
            NetError::ChannelCondemned => Reason::ChannelCondemned,
            NetError::ChannelNotFound => Reason::RouteNotFound,
            NetError::WorkerBusy(_) | NetError::WindowFull(_) => {
                Reason::TransientResourceUnavailable
            }
            NetError::PeerUnresponsive(_) => Reason::ChannelLost,
            _ => Reason::FatalSocketError,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Registry and routing failures. These are logged and turned into "no
/// route" for the caller; they never cross a process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("component {0} is neither registered here nor in the hub directory")]
    UnknownComponent(u64),

    #[error("no channel serves component {0}")]
    NoChannel(u64),

    #[error("cluster {0} is not connected to this hub")]
    UnknownCluster(i32),

    #[error("no hub channel configured")]
    NoHub,

    #[error("route channel is gone")]
    ChannelGone,

    #[error("could not encode the call: {0}")]
    Encode(String),

    #[error("bad routing envelope: {0}")]
    Envelope(#[from] FrameError),
}

impl RouteError {
    pub fn reason(&self) -> Reason {
        match self {
            RouteError::Envelope(_) => Reason::ProtocolMismatch,
            RouteError::ChannelGone => Reason::ChannelCondemned,
            _ => Reason::RouteNotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(Reason::from_io(&would_block), Reason::TransientResourceUnavailable);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(Reason::from_io(&reset), Reason::ChannelLost);

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(Reason::from_io(&denied), Reason::FatalSocketError);
    }
}
