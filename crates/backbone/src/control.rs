//! Control-plane messages spoken between components and the hub.
//!
//! Registration bodies are rkyv archives; the small hot messages (heartbeat,
//! entity call, global data changes) are plain little-endian fields.

use std::net::SocketAddr;

use rkyv::{Archive, Deserialize, Serialize, rancor};
use thiserror::Error;

use crate::bundle::Bundle;
use crate::entity_call::{ClusterId, EntityId};
use crate::error::NetError;
use crate::message::{FrameError, Message, MessageSpec, MessageTable};
use crate::registry::{ComponentId, ComponentOrder, ComponentType, Registration};

pub const REGISTER: MessageSpec = MessageSpec::variable(1, "register");
pub const REGISTER_ACK: MessageSpec = MessageSpec::variable(2, "register_ack");
pub const ACTIVE_TICK: MessageSpec = MessageSpec::fixed(3, "active_tick", 9);
pub const CROSS_SERVER_CALL: MessageSpec = MessageSpec::variable(4, "cross_server_call");
pub const GLOBAL_DATA_WRITE: MessageSpec = MessageSpec::variable(5, "global_data_write");
pub const GLOBAL_DATA_CHANGED: MessageSpec = MessageSpec::variable(6, "global_data_changed");
pub const ENTITY_CALL: MessageSpec = MessageSpec::variable(7, "entity_call");
pub const COMPONENT_ANNOUNCE: MessageSpec = MessageSpec::fixed(8, "component_announce", 14);

/// Every control message. Applications register their own opcodes on top.
pub fn control_table() -> MessageTable {
    MessageTable::with(&[
        REGISTER,
        REGISTER_ACK,
        ACTIVE_TICK,
        CROSS_SERVER_CALL,
        GLOBAL_DATA_WRITE,
        GLOBAL_DATA_CHANGED,
        ENTITY_CALL,
        COMPONENT_ANNOUNCE,
    ])
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("unknown component type {0}")]
    UnknownComponentType(u8),
    #[error("bad address {0:?}")]
    BadAddress(String),
    #[error("bad base64 in snapshot: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Payload bytes sit at arbitrary offsets inside a receive buffer, so they
/// are copied into an aligned buffer before validation.
fn aligned(data: &[u8]) -> rkyv::util::AlignedVec<16> {
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len());
    aligned.extend_from_slice(data);
    aligned
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct RegisterRequest {
    pub component_type: u8,
    pub component_id: u64,
    pub internal_addr: String,
    pub external_addr: Option<String>,
    pub external_alias: String,
}

impl RegisterRequest {
    pub fn from_registration(registration: &Registration) -> Self {
        Self {
            component_type: registration.component_type.as_u8(),
            component_id: registration.component_id,
            internal_addr: registration.internal_addr.to_string(),
            external_addr: registration.external_addr.map(|addr| addr.to_string()),
            external_alias: registration.external_alias.clone(),
        }
    }

    pub fn to_registration(&self) -> Result<Registration, CodecError> {
        let component_type = ComponentType::from_u8(self.component_type)
            .ok_or(CodecError::UnknownComponentType(self.component_type))?;
        let internal_addr = parse_addr(&self.internal_addr)?;
        let external_addr = match &self.external_addr {
            Some(addr) => Some(parse_addr(addr)?),
            None => None,
        };
        Ok(Registration {
            component_type,
            component_id: self.component_id,
            internal_addr,
            external_addr,
            external_alias: self.external_alias.clone(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(CodecError::Serialize)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        rkyv::from_bytes::<Self, rancor::Error>(&aligned(data)).map_err(CodecError::Deserialize)
    }

    pub fn write(&self, bundle: &mut Bundle) -> Result<(), CodecError> {
        let body = self.encode()?;
        bundle.new_message(REGISTER)?;
        bundle.write_bytes(&body);
        Ok(())
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, CodecError> {
    addr.parse()
        .map_err(|_| CodecError::BadAddress(addr.to_string()))
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct RegisterAck {
    pub accepted: bool,
    pub global_order: ComponentOrder,
    pub group_order: ComponentOrder,
    /// The cluster id of the registering channel. Stays the same for every
    /// component registered over it.
    pub cluster: ClusterId,
    pub reason: String,
}

impl RegisterAck {
    pub fn accepted(
        global_order: ComponentOrder,
        group_order: ComponentOrder,
        cluster: ClusterId,
    ) -> Self {
        Self {
            accepted: true,
            global_order,
            group_order,
            cluster,
            reason: String::new(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            global_order: 0,
            group_order: 0,
            cluster: 0,
            reason: reason.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(CodecError::Serialize)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        rkyv::from_bytes::<Self, rancor::Error>(&aligned(data)).map_err(CodecError::Deserialize)
    }

    pub fn write(&self, bundle: &mut Bundle) -> Result<(), CodecError> {
        let body = self.encode()?;
        bundle.new_message(REGISTER_ACK)?;
        bundle.write_bytes(&body);
        Ok(())
    }
}

/// Heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTick {
    pub component_type: ComponentType,
    pub component_id: ComponentId,
}

impl ActiveTick {
    pub fn write(&self, bundle: &mut Bundle) -> Result<(), CodecError> {
        bundle.new_message(ACTIVE_TICK)?;
        bundle.write(&self.component_type.as_u8());
        bundle.write(&self.component_id);
        Ok(())
    }

    pub fn parse(message: &Message) -> Result<Self, CodecError> {
        let mut reader = message.reader();
        let raw: u8 = reader.read()?;
        let component_type =
            ComponentType::from_u8(raw).ok_or(CodecError::UnknownComponentType(raw))?;
        Ok(Self {
            component_type,
            component_id: reader.read()?,
        })
    }
}

/// Hub directory update: which cluster hosts a component, or that it is
/// gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentAnnounce {
    pub cluster: ClusterId,
    pub component_type: ComponentType,
    pub component_id: ComponentId,
    pub removed: bool,
}

impl ComponentAnnounce {
    pub fn write(&self, bundle: &mut Bundle) -> Result<(), CodecError> {
        bundle.new_message(COMPONENT_ANNOUNCE)?;
        bundle.write(&self.cluster);
        bundle.write(&self.component_type.as_u8());
        bundle.write(&self.component_id);
        bundle.write(&self.removed);
        Ok(())
    }

    pub fn parse(message: &Message) -> Result<Self, CodecError> {
        let mut reader = message.reader();
        let cluster = reader.read()?;
        let raw: u8 = reader.read()?;
        let component_type =
            ComponentType::from_u8(raw).ok_or(CodecError::UnknownComponentType(raw))?;
        Ok(Self {
            cluster,
            component_type,
            component_id: reader.read()?,
            removed: reader.read()?,
        })
    }
}

/// A method invocation on an entity hosted by the receiving component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCallMessage {
    pub entity_id: EntityId,
    pub method: u16,
    pub args: Vec<u8>,
}

impl EntityCallMessage {
    pub fn write(&self, bundle: &mut Bundle) -> Result<(), CodecError> {
        bundle.new_message(ENTITY_CALL)?;
        bundle.write(&self.entity_id);
        bundle.write(&self.method);
        bundle.write_bytes(&self.args);
        Ok(())
    }

    pub fn parse(message: &Message) -> Result<Self, CodecError> {
        Self::parse_payload(&message.payload)
    }

    pub fn parse_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let mut reader = crate::field::FieldReader::new(payload);
        let entity_id = reader.read()?;
        let method = reader.read()?;
        Ok(Self {
            entity_id,
            method,
            args: reader.rest().to_vec(),
        })
    }

    /// The framed message as it travels inside a cross-server envelope.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6 + self.args.len());
        payload.extend_from_slice(&self.entity_id.to_le_bytes());
        payload.extend_from_slice(&self.method.to_le_bytes());
        payload.extend_from_slice(&self.args);
        Message {
            id: ENTITY_CALL.id,
            payload,
        }
        .to_wire(&ENTITY_CALL)
    }
}
