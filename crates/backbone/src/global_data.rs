//! Cluster-wide key/value data owned by the hub.
//!
//! Keys and values are opaque bytes. Every accepted write is broadcast to
//! all registered peers except the writer, and a peer that registers late
//! gets the current contents replayed.

use std::collections::{BTreeMap, HashSet};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::channel::ChannelHandle;
use crate::control::{CodecError, GLOBAL_DATA_CHANGED, GLOBAL_DATA_WRITE};
use crate::message::Message;
use crate::network::NetworkInterface;
use crate::registry::{ComponentRegistry, ComponentType};

/// A peer's request to set or delete a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataWrite {
    pub key: Vec<u8>,
    /// `None` deletes.
    pub value: Option<Vec<u8>>,
}

impl DataWrite {
    pub fn write(&self, bundle: &mut Bundle) -> Result<(), CodecError> {
        bundle.new_message(GLOBAL_DATA_WRITE)?;
        bundle.write(&self.value.is_none());
        bundle.write(&self.key);
        if let Some(value) = &self.value {
            bundle.write(value);
        }
        Ok(())
    }

    pub fn parse(message: &Message) -> Result<Self, CodecError> {
        let mut reader = message.reader();
        let is_delete: bool = reader.read()?;
        let key = reader.read()?;
        let value = if is_delete { None } else { Some(reader.read()?) };
        Ok(Self { key, value })
    }
}

/// Broadcast of an applied write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChange {
    pub is_delete: bool,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub writer: ComponentType,
}

impl DataChange {
    pub fn write(&self, bundle: &mut Bundle) -> Result<(), CodecError> {
        bundle.new_message(GLOBAL_DATA_CHANGED)?;
        bundle.write(&self.is_delete);
        bundle.write(&self.key);
        if let Some(value) = self.value.as_ref().filter(|_| !self.is_delete) {
            bundle.write(value);
        }
        bundle.write(&self.writer.as_u8());
        Ok(())
    }

    pub fn parse(message: &Message) -> Result<Self, CodecError> {
        let mut reader = message.reader();
        let is_delete: bool = reader.read()?;
        let key = reader.read()?;
        let value = if is_delete { None } else { Some(reader.read()?) };
        let raw: u8 = reader.read()?;
        let writer = ComponentType::from_u8(raw).ok_or(CodecError::UnknownComponentType(raw))?;
        Ok(Self {
            is_delete,
            key,
            value,
            writer,
        })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    writer: ComponentType,
}

#[derive(Debug, Default)]
pub struct GlobalData {
    entries: BTreeMap<Vec<u8>, Entry>,
    writes: u64,
}

impl GlobalData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a write. Deleting a missing key changes nothing and returns
    /// `None`.
    pub fn apply(&mut self, write: DataWrite, writer: ComponentType) -> Option<DataChange> {
        match write.value {
            Some(value) => {
                self.entries.insert(
                    write.key.clone(),
                    Entry {
                        value: value.clone(),
                        writer,
                    },
                );
                self.writes += 1;
                Some(DataChange {
                    is_delete: false,
                    key: write.key,
                    value: Some(value),
                    writer,
                })
            }
            None => {
                self.entries.remove(&write.key)?;
                self.writes += 1;
                Some(DataChange {
                    is_delete: true,
                    key: write.key,
                    value: None,
                    writer,
                })
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|entry| entry.value.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Current contents as a sequence of changes, in key order.
    pub fn changes(&self) -> Vec<DataChange> {
        self.entries
            .iter()
            .map(|(key, entry)| DataChange {
                is_delete: false,
                key: key.clone(),
                value: Some(entry.value.clone()),
                writer: entry.writer,
            })
            .collect()
    }

    /// Sends `change` to every registered peer except `writer`. Returns the
    /// number of channels it was queued on.
    pub fn broadcast(
        &self,
        net: &mut NetworkInterface,
        registry: &ComponentRegistry,
        change: &DataChange,
        writer: Option<ChannelHandle>,
    ) -> usize {
        let mut targets = HashSet::new();
        for info in registry.iter() {
            if let Some(channel) = info.channel {
                if Some(channel) != writer {
                    targets.insert(channel);
                }
            }
        }

        let mut sent = 0;
        for channel in targets {
            if send_changes(net, channel, std::slice::from_ref(change)) {
                sent += 1;
            }
        }
        sent
    }

    /// Replays the current contents to a newly registered peer.
    pub fn replay(&self, net: &mut NetworkInterface, channel: ChannelHandle) -> usize {
        let changes = self.changes();
        if changes.is_empty() || !send_changes(net, channel, &changes) {
            return 0;
        }
        log::debug!("replayed {} global data entries to {}", changes.len(), channel);
        changes.len()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| SnapshotEntry {
                    key: BASE64.encode(key),
                    value: BASE64.encode(&entry.value),
                    writer: entry.writer,
                })
                .collect(),
        }
    }

    /// Rebuilds the store from a snapshot. The write counter starts over.
    pub fn restore(snapshot: &Snapshot) -> Result<Self, CodecError> {
        let mut entries = BTreeMap::new();
        for entry in &snapshot.entries {
            entries.insert(
                BASE64.decode(&entry.key)?,
                Entry {
                    value: BASE64.decode(&entry.value)?,
                    writer: entry.writer,
                },
            );
        }
        Ok(Self { entries, writes: 0 })
    }
}

fn send_changes(net: &mut NetworkInterface, channel: ChannelHandle, changes: &[DataChange]) -> bool {
    let Some(mut bundle) = net.new_bundle_for(channel) else {
        return false;
    };
    for change in changes {
        if let Err(err) = change.write(&mut bundle) {
            log::warn!("global data change not sent to {}: {}", channel, err);
            net.release_bundle(bundle);
            return false;
        }
    }
    match net.send(channel, bundle) {
        Ok(()) => true,
        Err(err) => {
            log::debug!("global data change not sent to {}: {}", channel, err);
            false
        }
    }
}

/// Serializable view of the store, bytes base64-encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: String,
    pub writer: ComponentType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::control::control_table;
    use crate::message::MessageReader;

    fn roundtrip(fill: impl FnOnce(&mut Bundle)) -> Message {
        let mut bundle = Bundle::new(BufferPool::default());
        fill(&mut bundle);
        bundle.finish_message().unwrap();
        let mut reader = MessageReader::default();
        reader.feed(&bundle.to_vec());
        reader.next_message(&control_table()).unwrap().unwrap()
    }

    #[test]
    fn test_apply_and_delete() {
        let mut data = GlobalData::new();
        let change = data
            .apply(
                DataWrite {
                    key: b"spawn".to_vec(),
                    value: Some(b"zone-4".to_vec()),
                },
                ComponentType::Baseapp,
            )
            .unwrap();
        assert!(!change.is_delete);
        assert_eq!(data.get(b"spawn"), Some(&b"zone-4"[..]));

        let delete = DataWrite {
            key: b"spawn".to_vec(),
            value: None,
        };
        assert!(data.apply(delete.clone(), ComponentType::Cellapp).unwrap().is_delete);
        assert!(data.apply(delete, ComponentType::Cellapp).is_none());
        assert!(data.is_empty());
        assert_eq!(data.writes(), 2);
    }

    #[test]
    fn test_change_message() {
        let change = DataChange {
            is_delete: false,
            key: vec![1, 2],
            value: Some(vec![3, 4, 5]),
            writer: ComponentType::Dbmgr,
        };
        let message = roundtrip(|bundle| change.write(bundle).unwrap());
        assert_eq!(DataChange::parse(&message).unwrap(), change);

        let delete = DataChange {
            is_delete: true,
            key: vec![1, 2],
            value: None,
            writer: ComponentType::Dbmgr,
        };
        let message = roundtrip(|bundle| delete.write(bundle).unwrap());
        assert_eq!(DataChange::parse(&message).unwrap(), delete);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut data = GlobalData::new();
        data.apply(
            DataWrite {
                key: b"a".to_vec(),
                value: Some(vec![0xFF]),
            },
            ComponentType::Loginapp,
        );
        let json = serde_json::to_string(&data.snapshot()).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries[0].key, "YQ==");
        assert_eq!(back.entries[0].writer, ComponentType::Loginapp);

        let restored = GlobalData::restore(&back).unwrap();
        assert_eq!(restored.get(b"a"), Some(&[0xFF][..]));
        assert_eq!(restored.writes(), 0);
    }

    #[test]
    fn test_restore_rejects_bad_base64() {
        let snapshot = Snapshot {
            entries: vec![SnapshotEntry {
                key: "not base64!".to_string(),
                value: String::new(),
                writer: ComponentType::Dbmgr,
            }],
        };
        assert!(matches!(
            GlobalData::restore(&snapshot),
            Err(CodecError::Base64(_))
        ));
    }
}
