use std::net::SocketAddr;
use std::path::PathBuf;

use backbone::{ClusterId, ComponentId, ComponentOrder, ComponentType, EntityId, Reason};

#[derive(Debug, Clone)]
pub enum HubEvent {
    Listening {
        addr: SocketAddr,
    },
    ComponentRegistered {
        component_type: ComponentType,
        component_id: ComponentId,
        addr: SocketAddr,
        global_order: ComponentOrder,
    },
    RegistrationRejected {
        addr: SocketAddr,
        reason: String,
    },
    ComponentLost {
        component_type: ComponentType,
        component_id: ComponentId,
        reason: LossReason,
    },
    CallForwarded {
        entity_id: EntityId,
        origin: ClusterId,
        dest: ClusterId,
    },
    CallDropped {
        reason: String,
    },
    DataChanged {
        key: String,
        is_delete: bool,
        peers: usize,
    },
    ChannelCondemned {
        addr: SocketAddr,
        reason: Reason,
    },
    SnapshotWritten {
        path: PathBuf,
        entries: usize,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    Disconnected,
    Stale,
}

impl LossReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossReason::Disconnected => "disconnected",
            LossReason::Stale => "stopped sending heartbeats",
        }
    }
}
