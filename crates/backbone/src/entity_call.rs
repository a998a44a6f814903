//! Location-transparent references to remote entities.
//!
//! An [`EntityCall`] names an entity by the component hosting it. It owns no
//! socket; the router resolves it to a channel each time it is used.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::registry::ComponentId;

pub type EntityId = i32;

/// Hub-assigned cluster number.
pub type ClusterId = i32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityCallKind {
    Cell = 0,
    Base = 1,
    Client = 2,
    CellViaBase = 3,
    BaseViaCell = 4,
    ClientViaCell = 5,
    ClientViaBase = 6,
    CrossServerCell = 7,
    CrossServerBase = 8,
    CrossServerClient = 9,
}

impl EntityCallKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => EntityCallKind::Cell,
            1 => EntityCallKind::Base,
            2 => EntityCallKind::Client,
            3 => EntityCallKind::CellViaBase,
            4 => EntityCallKind::BaseViaCell,
            5 => EntityCallKind::ClientViaCell,
            6 => EntityCallKind::ClientViaBase,
            7 => EntityCallKind::CrossServerCell,
            8 => EntityCallKind::CrossServerBase,
            9 => EntityCallKind::CrossServerClient,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_cross_server(self) -> bool {
        matches!(
            self,
            EntityCallKind::CrossServerCell
                | EntityCallKind::CrossServerBase
                | EntityCallKind::CrossServerClient
        )
    }

    /// The cross-server flavor a call of this kind travels as.
    pub fn to_cross_server(self) -> Self {
        match self {
            EntityCallKind::Cell | EntityCallKind::CellViaBase | EntityCallKind::CrossServerCell => {
                EntityCallKind::CrossServerCell
            }
            EntityCallKind::Base | EntityCallKind::BaseViaCell | EntityCallKind::CrossServerBase => {
                EntityCallKind::CrossServerBase
            }
            EntityCallKind::Client
            | EntityCallKind::ClientViaCell
            | EntityCallKind::ClientViaBase
            | EntityCallKind::CrossServerClient => EntityCallKind::CrossServerClient,
        }
    }

    pub fn method_table(self) -> MethodTable {
        match self.to_cross_server() {
            EntityCallKind::CrossServerCell => MethodTable::Cell,
            EntityCallKind::CrossServerBase => MethodTable::Base,
            _ => MethodTable::Client,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityCallKind::Cell => "cell",
            EntityCallKind::Base => "base",
            EntityCallKind::Client => "client",
            EntityCallKind::CellViaBase => "cell-via-base",
            EntityCallKind::BaseViaCell => "base-via-cell",
            EntityCallKind::ClientViaCell => "client-via-cell",
            EntityCallKind::ClientViaBase => "client-via-base",
            EntityCallKind::CrossServerCell => "cross-server-cell",
            EntityCallKind::CrossServerBase => "cross-server-base",
            EntityCallKind::CrossServerClient => "cross-server-client",
        }
    }
}

impl fmt::Display for EntityCallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodTable {
    Cell,
    Base,
    Client,
}

/// One value per method table, picked by [`MethodTable`].
#[derive(Debug, Clone, Default)]
pub struct MethodTables<T> {
    pub cell: T,
    pub base: T,
    pub client: T,
}

impl<T> MethodTables<T> {
    pub fn select(&self, table: MethodTable) -> &T {
        match table {
            MethodTable::Cell => &self.cell,
            MethodTable::Base => &self.base,
            MethodTable::Client => &self.client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityCall {
    pub component_id: ComponentId,
    pub entity_id: EntityId,
    pub kind: EntityCallKind,
    /// Direct address of the hosting component, when known.
    pub addr: Option<SocketAddr>,
}

impl EntityCall {
    pub fn new(component_id: ComponentId, entity_id: EntityId, kind: EntityCallKind) -> Self {
        Self {
            component_id,
            entity_id,
            kind,
            addr: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn method_table(&self) -> MethodTable {
        self.kind.method_table()
    }
}

impl fmt::Display for EntityCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}",
            self.kind, self.entity_id, self.component_id
        )
    }
}

/// A call that has to leave its cluster. The prototype kind is fixed at
/// construction and picks the method table on the far side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossServerEntityCall {
    call: EntityCall,
    prototype: EntityCallKind,
    origin_cluster: ClusterId,
    dest_cluster: ClusterId,
}

impl CrossServerEntityCall {
    pub fn wrap(call: EntityCall, origin_cluster: ClusterId, dest_cluster: ClusterId) -> Self {
        let prototype = call.kind;
        Self {
            call: EntityCall {
                kind: prototype.to_cross_server(),
                ..call
            },
            prototype,
            origin_cluster,
            dest_cluster,
        }
    }

    /// Rebuilds a reference decoded off the wire. `kind` must already be a
    /// cross-server flavor.
    pub fn from_parts(
        component_id: ComponentId,
        entity_id: EntityId,
        prototype: EntityCallKind,
        origin_cluster: ClusterId,
        dest_cluster: ClusterId,
    ) -> Self {
        Self {
            call: EntityCall::new(component_id, entity_id, prototype.to_cross_server()),
            prototype,
            origin_cluster,
            dest_cluster,
        }
    }

    pub fn call(&self) -> &EntityCall {
        &self.call
    }

    pub fn component_id(&self) -> ComponentId {
        self.call.component_id
    }

    pub fn entity_id(&self) -> EntityId {
        self.call.entity_id
    }

    pub fn kind(&self) -> EntityCallKind {
        self.call.kind
    }

    pub fn prototype(&self) -> EntityCallKind {
        self.prototype
    }

    pub fn origin_cluster(&self) -> ClusterId {
        self.origin_cluster
    }

    pub fn dest_cluster(&self) -> ClusterId {
        self.dest_cluster
    }

    pub fn method_table(&self) -> MethodTable {
        self.prototype.method_table()
    }
}

impl fmt::Display for CrossServerEntityCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (prototype {}, cluster {} -> {})",
            self.call, self.prototype, self.origin_cluster, self.dest_cluster
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_server_mapping() {
        use EntityCallKind::*;
        let cases = [
            (Cell, CrossServerCell),
            (CellViaBase, CrossServerCell),
            (Base, CrossServerBase),
            (BaseViaCell, CrossServerBase),
            (Client, CrossServerClient),
            (ClientViaCell, CrossServerClient),
            (ClientViaBase, CrossServerClient),
        ];
        for (kind, expected) in cases {
            assert_eq!(kind.to_cross_server(), expected, "{}", kind);
            assert!(!kind.is_cross_server());
            assert!(expected.is_cross_server());
        }
    }

    #[test]
    fn test_wrap_keeps_prototype_table() {
        let call = EntityCall::new(42, 1001, EntityCallKind::BaseViaCell);
        let wrapped = CrossServerEntityCall::wrap(call, 1, 2);
        assert_eq!(wrapped.kind(), EntityCallKind::CrossServerBase);
        assert_eq!(wrapped.prototype(), EntityCallKind::BaseViaCell);
        assert_eq!(wrapped.method_table(), MethodTable::Base);

        let tables = MethodTables {
            cell: "cell methods",
            base: "base methods",
            client: "client methods",
        };
        assert_eq!(*tables.select(wrapped.method_table()), "base methods");
    }

    #[test]
    fn test_kind_byte_values() {
        for value in 0..=9u8 {
            let kind = EntityCallKind::from_u8(value).unwrap();
            assert_eq!(kind.as_u8(), value);
        }
        assert_eq!(EntityCallKind::from_u8(10), None);
    }
}
