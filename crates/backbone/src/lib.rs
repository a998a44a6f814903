pub mod buffer;
pub mod bundle;
pub mod channel;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod entity_call;
pub mod error;
pub mod error_reporter;
pub mod field;
pub mod global_data;
pub mod hub;
pub mod listener;
pub mod message;
pub mod network;
pub mod pool;
pub mod reactor;
pub mod registry;
pub mod reliable;
pub mod routing;
pub mod sniff;
pub mod stats;
pub mod transport;
pub mod websocket;
pub mod worker;

pub use buffer::{Buffer, BufferPool, DEFAULT_BUFFER_CAPACITY};
pub use bundle::{Bundle, BundlePool};
pub use channel::{Channel, ChannelFlags, ChannelHandle, ChannelState, ChannelTraits, SendStatus};
pub use config::{NetworkConfig, TlsPolicy};
pub use control::{
    ACTIVE_TICK, ActiveTick, COMPONENT_ANNOUNCE, CROSS_SERVER_CALL, CodecError, ComponentAnnounce,
    ENTITY_CALL, EntityCallMessage, GLOBAL_DATA_CHANGED, GLOBAL_DATA_WRITE, REGISTER, REGISTER_ACK,
    RegisterAck, RegisterRequest, control_table,
};
pub use endpoint::{Endpoint, EndpointKind, TcpEndpoint, UdpEndpoint};
pub use entity_call::{
    ClusterId, CrossServerEntityCall, EntityCall, EntityCallKind, EntityId, MethodTable,
    MethodTables,
};
pub use error::{NetError, Reason, RouteError};
pub use error_reporter::ErrorReporter;
pub use field::{Field, FieldReader};
pub use global_data::{DataChange, DataWrite, GlobalData, Snapshot, SnapshotEntry};
pub use hub::{
    CrossServerEnvelope, Forward, announce_component, cluster_of, open_cross_server_call, relay,
    replay_components, route_cross_server,
};
pub use listener::{AcceptAction, AcceptOutcome, Acceptor, Listener, TcpAcceptor, UdpListener};
pub use message::{FrameError, Message, MessageId, MessageReader, MessageSpec, MessageTable};
pub use network::{NetworkEvent, NetworkInterface};
pub use pool::{Arena, Handle, ObjectPool, PoolError, PoolStats, Reusable};
pub use reactor::{Reactor, TimerHandle};
pub use registry::{
    ComponentId, ComponentInfo, ComponentOrder, ComponentRegistry, ComponentType, Registration,
};
pub use reliable::{ReliableConfig, ReliableSession};
pub use routing::{Route, Router};
pub use sniff::{Sniffed, SslVersion, detect_ssl, sniff};
pub use stats::{ChannelStats, NetworkStats};
pub use transport::Transport;
pub use websocket::{Frame, FrameDecoder, Handshake, Opcode, WebSocketCodec};
pub use worker::{CancelToken, Completed, TaskHandle, WorkerPool};
