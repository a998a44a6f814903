//! Live membership of the cluster.
//!
//! The registry maps `(type, id)` to a component descriptor and the channel
//! it was registered over. It holds channel handles only; the channels
//! themselves belong to the network interface. Dropping a channel must go
//! through [`ComponentRegistry::deregister`] so no descriptor outlives it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelHandle;

pub type ComponentId = u64;

/// Startup ordinal. Global orders count every registration from 1; group
/// orders count per component type from 1.
pub type ComponentOrder = i32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentType {
    Unknown = 0,
    Dbmgr = 1,
    Loginapp = 2,
    Baseappmgr = 3,
    Cellappmgr = 4,
    Cellapp = 5,
    Baseapp = 6,
    Client = 7,
    Machine = 8,
    Console = 9,
    Logger = 10,
    Bots = 11,
    Watcher = 12,
    Interfaces = 13,
    Centermgr = 14,
}

impl ComponentType {
    pub const ALL: [ComponentType; 15] = [
        ComponentType::Unknown,
        ComponentType::Dbmgr,
        ComponentType::Loginapp,
        ComponentType::Baseappmgr,
        ComponentType::Cellappmgr,
        ComponentType::Cellapp,
        ComponentType::Baseapp,
        ComponentType::Client,
        ComponentType::Machine,
        ComponentType::Console,
        ComponentType::Logger,
        ComponentType::Bots,
        ComponentType::Watcher,
        ComponentType::Interfaces,
        ComponentType::Centermgr,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Unknown => "unknown",
            ComponentType::Dbmgr => "dbmgr",
            ComponentType::Loginapp => "loginapp",
            ComponentType::Baseappmgr => "baseappmgr",
            ComponentType::Cellappmgr => "cellappmgr",
            ComponentType::Cellapp => "cellapp",
            ComponentType::Baseapp => "baseapp",
            ComponentType::Client => "client",
            ComponentType::Machine => "machine",
            ComponentType::Console => "console",
            ComponentType::Logger => "logger",
            ComponentType::Bots => "bots",
            ComponentType::Watcher => "watcher",
            ComponentType::Interfaces => "interfaces",
            ComponentType::Centermgr => "centermgr",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a peer announces when it registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub component_type: ComponentType,
    pub component_id: ComponentId,
    pub internal_addr: SocketAddr,
    pub external_addr: Option<SocketAddr>,
    pub external_alias: String,
}

#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub component_type: ComponentType,
    pub component_id: ComponentId,
    pub internal_addr: SocketAddr,
    pub external_addr: Option<SocketAddr>,
    pub external_alias: String,
    pub channel: Option<ChannelHandle>,
    pub global_order: ComponentOrder,
    pub group_order: ComponentOrder,
    pub registered_at: Instant,
    pub last_active: Instant,
}

impl ComponentInfo {
    pub fn key(&self) -> (ComponentType, ComponentId) {
        (self.component_type, self.component_id)
    }
}

#[derive(Debug, Default)]
pub struct ComponentRegistry {
    components: HashMap<(ComponentType, ComponentId), ComponentInfo>,
    by_channel: HashMap<ChannelHandle, Vec<(ComponentType, ComponentId)>>,
    next_global: ComponentOrder,
    next_group: HashMap<ComponentType, ComponentOrder>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn unlink(&mut self, channel: ChannelHandle, key: (ComponentType, ComponentId)) {
        if let Some(keys) = self.by_channel.get_mut(&channel) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_channel.remove(&channel);
            }
        }
    }

    /// Adds or refreshes a component. Re-registering an existing
    /// `(type, id)` rebinds it to the new channel and keeps its ordinals.
    pub fn register(
        &mut self,
        registration: Registration,
        channel: Option<ChannelHandle>,
        now: Instant,
    ) -> &ComponentInfo {
        let key = (registration.component_type, registration.component_id);

        let previous = self
            .components
            .get(&key)
            .map(|info| (info.channel, info.global_order, info.group_order));

        let (global_order, group_order) = match previous {
            Some((old_channel, global, group)) => {
                if let Some(old) = old_channel {
                    self.unlink(old, key);
                }
                log::info!(
                    "{} {} re-registered from {}",
                    registration.component_type,
                    registration.component_id,
                    registration.internal_addr
                );
                (global, group)
            }
            None => {
                self.next_global += 1;
                let group = self
                    .next_group
                    .entry(registration.component_type)
                    .or_insert(0);
                *group += 1;
                log::info!(
                    "{} {} registered from {} (global order {}, group order {})",
                    registration.component_type,
                    registration.component_id,
                    registration.internal_addr,
                    self.next_global,
                    *group
                );
                (self.next_global, *group)
            }
        };

        if let Some(handle) = channel {
            self.by_channel.entry(handle).or_default().push(key);
        }

        let info = ComponentInfo {
            component_type: registration.component_type,
            component_id: registration.component_id,
            internal_addr: registration.internal_addr,
            external_addr: registration.external_addr,
            external_alias: registration.external_alias,
            channel,
            global_order,
            group_order,
            registered_at: now,
            last_active: now,
        };
        self.components.insert(key, info);
        &self.components[&key]
    }

    pub fn find(&self, component_type: ComponentType, component_id: ComponentId) -> Option<&ComponentInfo> {
        self.components.get(&(component_type, component_id))
    }

    /// Component ids are unique across types in practice; the lowest type
    /// wins if they are not.
    pub fn find_by_id(&self, component_id: ComponentId) -> Option<&ComponentInfo> {
        self.components
            .values()
            .filter(|info| info.component_id == component_id)
            .min_by_key(|info| info.component_type)
    }

    pub fn find_by_channel(&self, channel: ChannelHandle) -> Vec<&ComponentInfo> {
        self.by_channel
            .get(&channel)
            .map(|keys| keys.iter().filter_map(|k| self.components.get(k)).collect())
            .unwrap_or_default()
    }

    pub fn find_by_global_order(&self, order: ComponentOrder) -> Option<&ComponentInfo> {
        self.components.values().find(|info| info.global_order == order)
    }

    pub fn components(&self, component_type: ComponentType) -> impl Iterator<Item = &ComponentInfo> {
        self.components
            .values()
            .filter(move |info| info.component_type == component_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.components.values()
    }

    /// Removes every descriptor bound to `channel`.
    pub fn deregister(&mut self, channel: ChannelHandle) -> Vec<ComponentInfo> {
        let Some(keys) = self.by_channel.remove(&channel) else {
            return Vec::new();
        };
        let removed: Vec<ComponentInfo> = keys
            .into_iter()
            .filter_map(|key| self.components.remove(&key))
            .collect();
        for info in &removed {
            log::info!(
                "{} {} deregistered (channel {} dropped)",
                info.component_type,
                info.component_id,
                channel
            );
        }
        removed
    }

    pub fn remove(&mut self, component_type: ComponentType, component_id: ComponentId) -> Option<ComponentInfo> {
        let key = (component_type, component_id);
        let info = self.components.remove(&key)?;
        if let Some(channel) = info.channel {
            self.unlink(channel, key);
        }
        Some(info)
    }

    /// Heartbeat receipt. Returns false for an unknown component.
    pub fn on_active_tick(
        &mut self,
        component_type: ComponentType,
        component_id: ComponentId,
        now: Instant,
    ) -> bool {
        match self.components.get_mut(&(component_type, component_id)) {
            Some(info) => {
                info.last_active = now;
                true
            }
            None => false,
        }
    }

    /// Components silent for longer than `timeout`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<(ComponentType, ComponentId)> {
        self.components
            .values()
            .filter(|info| now.duration_since(info.last_active) > timeout)
            .map(ComponentInfo::key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
