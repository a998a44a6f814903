//! Resolves entity calls to a destination at call time.
//!
//! Resolution order: an entity hosted in this process, then a channel to
//! the hosting component, then the hub when the component lives in another
//! cluster. Anything else is "no route": logged and dropped, never raised.
//!
//! Which components live elsewhere is learned from the hub's directory
//! updates; the local cluster id comes from the hub's registration ack.

use std::collections::HashMap;

use crate::bundle::Bundle;
use crate::channel::ChannelHandle;
use crate::control::{CodecError, ComponentAnnounce, EntityCallMessage, RegisterAck};
use crate::entity_call::{ClusterId, CrossServerEntityCall, EntityCall};
use crate::error::RouteError;
use crate::hub::write_cross_server_call;
use crate::network::NetworkInterface;
use crate::registry::{ComponentId, ComponentRegistry};

/// Is the entity hosted in this process?
pub type LocalLookup = Box<dyn Fn(&EntityCall) -> bool>;

/// Which channel serves the call's component?
pub type ChannelLookup = Box<dyn Fn(&ComponentRegistry, &EntityCall) -> Option<ChannelHandle>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Direct(ChannelHandle),
    ViaHub {
        hub: ChannelHandle,
        call: CrossServerEntityCall,
    },
    NoRoute,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Local => "local",
            Route::Direct(_) => "direct",
            Route::ViaHub { .. } => "via-hub",
            Route::NoRoute => "no-route",
        }
    }
}

pub struct Router {
    local_cluster: ClusterId,
    local: LocalLookup,
    channels: ChannelLookup,
    hub: Option<ChannelHandle>,
    remote_components: HashMap<ComponentId, ClusterId>,
}

impl Router {
    pub fn new(local_cluster: ClusterId) -> Self {
        Self {
            local_cluster,
            local: Box::new(|_| false),
            channels: Box::new(|registry, call| {
                registry
                    .find_by_id(call.component_id)
                    .and_then(|info| info.channel)
            }),
            hub: None,
            remote_components: HashMap::new(),
        }
    }

    pub fn with_local_lookup(mut self, lookup: impl Fn(&EntityCall) -> bool + 'static) -> Self {
        self.local = Box::new(lookup);
        self
    }

    pub fn with_channel_lookup(
        mut self,
        lookup: impl Fn(&ComponentRegistry, &EntityCall) -> Option<ChannelHandle> + 'static,
    ) -> Self {
        self.channels = Box::new(lookup);
        self
    }

    pub fn local_cluster(&self) -> ClusterId {
        self.local_cluster
    }

    /// Adopts the cluster id the hub assigned.
    pub fn set_local_cluster(&mut self, cluster: ClusterId) {
        self.local_cluster = cluster;
    }

    pub fn set_hub(&mut self, hub: Option<ChannelHandle>) {
        self.hub = hub;
    }

    pub fn hub(&self) -> Option<ChannelHandle> {
        self.hub
    }

    /// Records that `component_id` lives in another cluster.
    pub fn add_remote_component(&mut self, component_id: ComponentId, cluster: ClusterId) {
        self.remote_components.insert(component_id, cluster);
    }

    pub fn remove_remote_component(&mut self, component_id: ComponentId) -> Option<ClusterId> {
        self.remote_components.remove(&component_id)
    }

    pub fn remote_cluster(&self, component_id: ComponentId) -> Option<ClusterId> {
        self.remote_components.get(&component_id).copied()
    }

    /// Adopts the cluster id from an accepted registration ack.
    pub fn on_register_ack(&mut self, ack: &RegisterAck) -> bool {
        if !ack.accepted {
            return false;
        }
        if ack.cluster != self.local_cluster {
            log::info!("cluster id {} assigned by the hub", ack.cluster);
        }
        self.set_local_cluster(ack.cluster);
        true
    }

    /// Applies a directory update from the hub. Entries for this cluster
    /// are ignored; a removal only drops a matching entry.
    pub fn on_component_announce(&mut self, announce: &ComponentAnnounce) {
        if announce.cluster == self.local_cluster {
            return;
        }
        if announce.removed {
            if self.remote_cluster(announce.component_id) == Some(announce.cluster) {
                self.remote_components.remove(&announce.component_id);
            }
        } else {
            self.remote_components
                .insert(announce.component_id, announce.cluster);
        }
    }

    /// Forgets a channel that went away, hub included.
    pub fn on_channel_closed(&mut self, channel: ChannelHandle) {
        if self.hub == Some(channel) {
            log::warn!("hub channel {} lost", channel);
            self.hub = None;
        }
    }

    fn try_resolve(&self, registry: &ComponentRegistry, call: &EntityCall) -> Result<Route, RouteError> {
        if (self.local)(call) {
            return Ok(Route::Local);
        }

        let remote = self.remote_components.get(&call.component_id).copied();
        if remote.is_none_or(|cluster| cluster == self.local_cluster) {
            if let Some(channel) = (self.channels)(registry, call) {
                return Ok(Route::Direct(channel));
            }
        }

        let Some(dest) = remote.filter(|cluster| *cluster != self.local_cluster) else {
            if registry.find_by_id(call.component_id).is_none() {
                return Err(RouteError::UnknownComponent(call.component_id));
            }
            return Err(RouteError::NoChannel(call.component_id));
        };
        let hub = self.hub.ok_or(RouteError::NoHub)?;
        Ok(Route::ViaHub {
            hub,
            call: CrossServerEntityCall::wrap(*call, self.local_cluster, dest),
        })
    }

    pub fn resolve(&self, registry: &ComponentRegistry, call: &EntityCall) -> Route {
        match self.try_resolve(registry, call) {
            Ok(route) => route,
            Err(err) => {
                log::warn!("no route for {}: {}", call, err);
                Route::NoRoute
            }
        }
    }

    /// Resolves `call` and queues the invocation. `Local` is returned for
    /// the caller to dispatch in-process; nothing is sent in that case.
    pub fn call(
        &self,
        net: &mut NetworkInterface,
        registry: &ComponentRegistry,
        call: &EntityCall,
        method: u16,
        args: &[u8],
    ) -> Route {
        let route = self.resolve(registry, call);
        let message = EntityCallMessage {
            entity_id: call.entity_id,
            method,
            args: args.to_vec(),
        };

        let sent = match &route {
            Route::Local | Route::NoRoute => return route,
            Route::Direct(channel) => Self::send(net, *channel, |bundle| message.write(bundle)),
            Route::ViaHub { hub, call: wrapped } => {
                let inner = message.to_wire();
                Self::send(net, *hub, |bundle| {
                    Ok(write_cross_server_call(bundle, wrapped, &inner)?)
                })
            }
        };

        match sent {
            Ok(()) => route,
            Err(err) => {
                log::warn!("dropping call to {} ({}): {}", call, route.as_str(), err);
                Route::NoRoute
            }
        }
    }

    fn send<F>(net: &mut NetworkInterface, channel: ChannelHandle, fill: F) -> Result<(), RouteError>
    where
        F: FnOnce(&mut Bundle) -> Result<(), CodecError>,
    {
        let mut bundle = net.new_bundle_for(channel).ok_or(RouteError::ChannelGone)?;
        if let Err(err) = fill(&mut bundle) {
            net.release_bundle(bundle);
            return Err(RouteError::Encode(err.to_string()));
        }
        net.send(channel, bundle).map_err(|_| RouteError::ChannelGone)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::entity_call::EntityCallKind;
    use crate::registry::{ComponentType, Registration};

    fn registry_with(component_id: ComponentId, channel: ChannelHandle) -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register(
            Registration {
                component_type: ComponentType::Cellapp,
                component_id,
                internal_addr: "10.0.0.2:20000".parse().unwrap(),
                external_addr: None,
                external_alias: String::new(),
            },
            Some(channel),
            Instant::now(),
        );
        registry
    }

    #[test]
    fn test_resolution_order() {
        let channel = ChannelHandle::from_raw(3, 0);
        let registry = registry_with(10, channel);

        let router = Router::new(1).with_local_lookup(|call| call.entity_id == 1);
        let local = EntityCall::new(10, 1, EntityCallKind::Cell);
        assert_eq!(router.resolve(&registry, &local), Route::Local);

        let remote = EntityCall::new(10, 2, EntityCallKind::Cell);
        assert_eq!(router.resolve(&registry, &remote), Route::Direct(channel));

        let unknown = EntityCall::new(11, 2, EntityCallKind::Cell);
        assert_eq!(router.resolve(&registry, &unknown), Route::NoRoute);
    }

    #[test]
    fn test_other_cluster_goes_through_hub() {
        let hub = ChannelHandle::from_raw(0, 0);
        let registry = ComponentRegistry::new();
        let mut router = Router::new(1);
        router.add_remote_component(20, 2);

        let call = EntityCall::new(20, 5, EntityCallKind::ClientViaBase);
        assert_eq!(router.resolve(&registry, &call), Route::NoRoute);

        router.set_hub(Some(hub));
        match router.resolve(&registry, &call) {
            Route::ViaHub { hub: via, call } => {
                assert_eq!(via, hub);
                assert_eq!(call.origin_cluster(), 1);
                assert_eq!(call.dest_cluster(), 2);
                assert_eq!(call.kind(), EntityCallKind::CrossServerClient);
            }
            other => panic!("unexpected route {:?}", other),
        }

        router.on_channel_closed(hub);
        assert_eq!(router.hub(), None);
    }

    #[test]
    fn test_unknown_and_unreachable_components() {
        let router = Router::new(1);
        let call = EntityCall::new(10, 2, EntityCallKind::Cell);
        assert_eq!(
            router.try_resolve(&ComponentRegistry::new(), &call),
            Err(RouteError::UnknownComponent(10))
        );

        let mut registry = ComponentRegistry::new();
        registry.register(
            Registration {
                component_type: ComponentType::Cellapp,
                component_id: 10,
                internal_addr: "10.0.0.2:20000".parse().unwrap(),
                external_addr: None,
                external_alias: String::new(),
            },
            None,
            Instant::now(),
        );
        assert_eq!(router.try_resolve(&registry, &call), Err(RouteError::NoChannel(10)));
    }

    #[test]
    fn test_directory_updates_from_hub() {
        let hub = ChannelHandle::from_raw(0, 0);
        let registry = ComponentRegistry::new();
        let mut router = Router::new(0);
        router.set_hub(Some(hub));

        assert!(!router.on_register_ack(&RegisterAck::rejected("full")));
        assert!(router.on_register_ack(&RegisterAck::accepted(4, 1, 3)));
        assert_eq!(router.local_cluster(), 3);

        let announce = |cluster, removed| ComponentAnnounce {
            cluster,
            component_type: ComponentType::Cellapp,
            component_id: 20,
            removed,
        };

        // Our own components are reached directly, never through the hub.
        router.on_component_announce(&announce(3, false));
        assert_eq!(router.remote_cluster(20), None);

        router.on_component_announce(&announce(5, false));
        let call = EntityCall::new(20, 1, EntityCallKind::Base);
        assert!(matches!(
            router.resolve(&registry, &call),
            Route::ViaHub { call, .. } if call.dest_cluster() == 5 && call.origin_cluster() == 3
        ));

        // A stale removal from another cluster leaves the entry alone.
        router.on_component_announce(&announce(6, true));
        assert_eq!(router.remote_cluster(20), Some(5));
        router.on_component_announce(&announce(5, true));
        assert_eq!(router.resolve(&registry, &call), Route::NoRoute);
    }

    #[test]
    fn test_custom_channel_lookup() {
        let channel = ChannelHandle::from_raw(7, 2);
        let router = Router::new(1).with_channel_lookup(move |_, call| call.addr.map(|_| channel));
        let registry = ComponentRegistry::new();

        let call = EntityCall::new(1, 1, EntityCallKind::Base);
        assert_eq!(router.resolve(&registry, &call), Route::NoRoute);
        let call = call.with_addr("10.0.0.9:30000".parse().unwrap());
        assert_eq!(router.resolve(&registry, &call), Route::Direct(channel));
    }
}
