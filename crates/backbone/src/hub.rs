//! Cross-cluster forwarding.
//!
//! A cross-server call travels as `[envelope][framed inner message]`. The
//! hub reads the envelope to pick the destination cluster, rewrites the
//! origin to the cluster id it assigned the sender, and passes the inner
//! message through byte for byte.
//!
//! Cluster ids are the global startup orders the hub's registry handed out
//! when each cluster's control component registered. The hub also keeps
//! every peer's directory current: which cluster hosts each component
//! registered with it.

use std::collections::HashSet;

use crate::bundle::Bundle;
use crate::channel::ChannelHandle;
use crate::control::{CROSS_SERVER_CALL, ComponentAnnounce};
use crate::entity_call::{ClusterId, CrossServerEntityCall, EntityCallKind, EntityId};
use crate::error::{NetError, RouteError};
use crate::message::{FrameError, Message, MessageReader, MessageTable};
use crate::network::NetworkInterface;
use crate::registry::{ComponentId, ComponentInfo, ComponentRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossServerEnvelope {
    pub origin_cluster: ClusterId,
    pub dest_cluster: ClusterId,
    pub component_id: ComponentId,
    pub entity_id: EntityId,
    pub kind: EntityCallKind,
    pub prototype: EntityCallKind,
}

impl CrossServerEnvelope {
    pub const LEN: usize = 22;

    pub fn from_call(call: &CrossServerEntityCall) -> Self {
        Self {
            origin_cluster: call.origin_cluster(),
            dest_cluster: call.dest_cluster(),
            component_id: call.component_id(),
            entity_id: call.entity_id(),
            kind: call.kind(),
            prototype: call.prototype(),
        }
    }

    pub fn to_call(&self) -> CrossServerEntityCall {
        CrossServerEntityCall::from_parts(
            self.component_id,
            self.entity_id,
            self.prototype,
            self.origin_cluster,
            self.dest_cluster,
        )
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.origin_cluster.to_le_bytes());
        out.extend_from_slice(&self.dest_cluster.to_le_bytes());
        out.extend_from_slice(&self.component_id.to_le_bytes());
        out.extend_from_slice(&self.entity_id.to_le_bytes());
        out.push(self.kind.as_u8());
        out.push(self.prototype.as_u8());
    }

    /// Splits a cross-server payload into its envelope and the inner bytes.
    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8]), FrameError> {
        let mut reader = crate::field::FieldReader::new(payload);
        let origin_cluster = reader.read()?;
        let dest_cluster = reader.read()?;
        let component_id = reader.read()?;
        let entity_id = reader.read()?;
        let kind = EntityCallKind::from_u8(reader.read()?)
            .ok_or(FrameError::Malformed("unknown entity call kind"))?;
        let prototype = EntityCallKind::from_u8(reader.read()?)
            .ok_or(FrameError::Malformed("unknown entity call prototype"))?;
        if !kind.is_cross_server() {
            return Err(FrameError::Malformed("envelope kind is not cross-server"));
        }
        Ok((
            Self {
                origin_cluster,
                dest_cluster,
                component_id,
                entity_id,
                kind,
                prototype,
            },
            reader.rest(),
        ))
    }

    /// Overwrites the origin in an encoded payload, leaving everything else
    /// untouched.
    pub fn rewrite_origin(payload: &mut [u8], origin: ClusterId) -> Result<(), FrameError> {
        if payload.len() < Self::LEN {
            return Err(FrameError::Truncated);
        }
        payload[..4].copy_from_slice(&origin.to_le_bytes());
        Ok(())
    }
}

/// Wraps an already framed message for the hub.
pub fn write_cross_server_call(
    bundle: &mut Bundle,
    call: &CrossServerEntityCall,
    inner: &[u8],
) -> Result<(), NetError> {
    let mut envelope = Vec::with_capacity(CrossServerEnvelope::LEN);
    CrossServerEnvelope::from_call(call).encode(&mut envelope);
    bundle.new_message(CROSS_SERVER_CALL)?;
    bundle.write_bytes(&envelope);
    bundle.write_bytes(inner);
    Ok(())
}

/// Unwraps a delivered cross-server call into its envelope and the single
/// message it carries.
pub fn open_cross_server_call(
    payload: &[u8],
    table: &MessageTable,
) -> Result<(CrossServerEnvelope, Message), FrameError> {
    let (envelope, inner) = CrossServerEnvelope::decode(payload)?;
    let mut reader = MessageReader::new(inner.len().max(1));
    reader.feed(inner);
    let message = reader.next_message(table)?.ok_or(FrameError::Truncated)?;
    if reader.buffered() > 0 {
        return Err(FrameError::Malformed("trailing bytes after the inner message"));
    }
    Ok((envelope, message))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub to: ChannelHandle,
    pub envelope: CrossServerEnvelope,
    /// The payload as it leaves the hub, origin rewritten.
    pub payload: Vec<u8>,
}

/// The cluster id this hub assigned to whatever registered over `channel`.
pub fn cluster_of(registry: &ComponentRegistry, channel: ChannelHandle) -> Option<ClusterId> {
    registry
        .find_by_channel(channel)
        .into_iter()
        .map(|info| info.global_order)
        .min()
}

/// Picks the destination channel for a cross-server payload received on
/// `from` and rewrites its origin.
pub fn route_cross_server(
    registry: &ComponentRegistry,
    from: ChannelHandle,
    payload: &[u8],
) -> Result<Forward, RouteError> {
    let (mut envelope, _) = CrossServerEnvelope::decode(payload)?;
    let origin =
        cluster_of(registry, from).ok_or(RouteError::UnknownCluster(envelope.origin_cluster))?;

    let dest = registry
        .find_by_global_order(envelope.dest_cluster)
        .ok_or(RouteError::UnknownCluster(envelope.dest_cluster))?;
    let to = dest.channel.ok_or(RouteError::NoChannel(dest.component_id))?;

    let mut forwarded = payload.to_vec();
    CrossServerEnvelope::rewrite_origin(&mut forwarded, origin)?;
    if envelope.origin_cluster != origin {
        log::debug!(
            "cross-server call claimed origin {}, rewritten to {}",
            envelope.origin_cluster,
            origin
        );
    }
    envelope.origin_cluster = origin;

    Ok(Forward {
        to,
        envelope,
        payload: forwarded,
    })
}

/// Routes and queues a cross-server payload. Failures are logged by the
/// caller and the call is dropped.
pub fn relay(
    net: &mut NetworkInterface,
    registry: &ComponentRegistry,
    from: ChannelHandle,
    payload: &[u8],
) -> Result<Forward, RouteError> {
    let forward = route_cross_server(registry, from, payload)?;
    let mut bundle = net.new_bundle_for(forward.to).ok_or(RouteError::ChannelGone)?;
    bundle
        .new_message(CROSS_SERVER_CALL)
        .map_err(|_| RouteError::ChannelGone)?;
    bundle.write_bytes(&forward.payload);
    net.send(forward.to, bundle)
        .map_err(|_| RouteError::ChannelGone)?;
    log::debug!(
        "relayed entity {} of component {} from cluster {} to cluster {}",
        forward.envelope.entity_id,
        forward.envelope.component_id,
        forward.envelope.origin_cluster,
        forward.envelope.dest_cluster
    );
    Ok(forward)
}

impl ComponentAnnounce {
    pub fn of(info: &ComponentInfo, cluster: ClusterId, removed: bool) -> Self {
        Self {
            cluster,
            component_type: info.component_type,
            component_id: info.component_id,
            removed,
        }
    }
}

fn send_announces(
    net: &mut NetworkInterface,
    channel: ChannelHandle,
    announces: &[ComponentAnnounce],
) -> bool {
    let Some(mut bundle) = net.new_bundle_for(channel) else {
        return false;
    };
    for announce in announces {
        if let Err(err) = announce.write(&mut bundle) {
            log::warn!("directory update not sent to {}: {}", channel, err);
            net.release_bundle(bundle);
            return false;
        }
    }
    match net.send(channel, bundle) {
        Ok(()) => true,
        Err(err) => {
            log::debug!("directory update not sent to {}: {}", channel, err);
            false
        }
    }
}

/// Sends `announce` to every registered channel except `skip`. Returns how
/// many peers it reached.
pub fn announce_component(
    net: &mut NetworkInterface,
    registry: &ComponentRegistry,
    announce: &ComponentAnnounce,
    skip: Option<ChannelHandle>,
) -> usize {
    let targets: HashSet<ChannelHandle> = registry
        .iter()
        .filter_map(|info| info.channel)
        .filter(|channel| Some(*channel) != skip)
        .collect();

    let mut sent = 0;
    for channel in targets {
        if send_announces(net, channel, std::slice::from_ref(announce)) {
            sent += 1;
        }
    }
    sent
}

/// Tells a newly registered peer where every component registered over
/// other channels lives.
pub fn replay_components(
    net: &mut NetworkInterface,
    registry: &ComponentRegistry,
    channel: ChannelHandle,
) -> usize {
    let announces: Vec<ComponentAnnounce> = registry
        .iter()
        .filter_map(|info| {
            let owner = info.channel.filter(|owner| *owner != channel)?;
            let cluster = cluster_of(registry, owner)?;
            Some(ComponentAnnounce::of(info, cluster, false))
        })
        .collect();
    if announces.is_empty() || !send_announces(net, channel, &announces) {
        return 0;
    }
    log::debug!("replayed {} directory entries to {}", announces.len(), channel);
    announces.len()
}
