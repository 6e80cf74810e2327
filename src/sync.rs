//! The replication surface: state bytes in, state bytes out.
//!
//! The transport underneath is assumed unreliable, unordered, and
//! at-most-once; convergence comes entirely from `combine` being safe under
//! loss, duplication, and reordering. This module owns everything up to the
//! wire: serializing a replica, slicing it into fragments that fit a UDP
//! packet, reassembling received fragments, answering pull requests, and
//! gating broadcasts on each replica's dirty flag. Sending the messages
//! somewhere is the surrounding system's job.

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::set::OrSet;
use crate::set::Replicated;
use crate::tree::Item;
use crate::tree::Node;
use crate::tree::NodeId;
use crate::tree::Store;

/// Largest fragment payload; keeps a full message under a 64k UDP packet.
pub const FRAGMENT_MAX_SIZE: usize = 63 * 1024;

/// Wire name of a replica. The empty string names the root replica; every
/// other replica is named by its node id in decimal.
pub type ReplicaName = String;

/// One fragment of a serialized replica state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateMessage {
    pub message_id: u32,
    pub index: u32,
    pub total: u32,
    pub replica: ReplicaName,
    pub blob: Vec<u8>,
}

/// "Send me your current state for this replica."
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateRequest {
    pub replica: ReplicaName,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("replica state codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("fragment {index} out of range for a message of {total}")]
    BadFragment { index: u32, total: u32 },
    #[error("replica name is not a node id: {0:?}")]
    BadReplicaName(String),
    #[error("no replica named {0:?}")]
    UnknownReplica(String),
}

/// Slice a serialized replica into wire fragments.
pub fn fragment(replica: &str, buffer: &[u8]) -> Vec<StateMessage> {
    let message_id: u32 = rand::random();
    let total = buffer.len().div_ceil(FRAGMENT_MAX_SIZE).max(1) as u32;
    return (0..total)
        .map(|index| {
            let offset = index as usize * FRAGMENT_MAX_SIZE;
            let end = (offset + FRAGMENT_MAX_SIZE).min(buffer.len());
            StateMessage {
                message_id,
                index,
                total,
                replica: replica.to_string(),
                blob: buffer[offset..end].to_vec(),
            }
        })
        .collect();
}

/// Buffers fragments by message id until a full state arrives.
///
/// Duplicate fragments are dropped; arrival order does not matter. Partial
/// messages whose peers gave up are simply never completed.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: FxHashMap<u32, Vec<StateMessage>>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        return Reassembler::default();
    }

    /// Accept one fragment; yields the replica name and the whole buffer
    /// once every fragment of its message has arrived.
    pub fn accept(
        &mut self,
        message: StateMessage,
    ) -> Result<Option<(ReplicaName, Vec<u8>)>, SyncError> {
        if message.index >= message.total {
            return Err(SyncError::BadFragment { index: message.index, total: message.total });
        }
        if message.total <= 1 {
            return Ok(Some((message.replica, message.blob)));
        }

        let parts = self.partial.entry(message.message_id).or_default();
        if parts.iter().any(|part| part.index == message.index) {
            return Ok(None);
        }
        parts.push(message);

        let message_id = parts[0].message_id;
        if parts.len() as u32 == parts[0].total {
            let mut parts = self
                .partial
                .remove(&message_id)
                .expect("entry was just populated");
            parts.sort_unstable_by_key(|part| part.index);
            let replica = parts[0].replica.clone();
            let mut buffer = Vec::new();
            for part in parts {
                buffer.extend_from_slice(&part.blob);
            }
            return Ok(Some((replica, buffer)));
        }
        return Ok(None);
    }
}

fn parse_replica_name(name: &str) -> Result<NodeId, SyncError> {
    return name
        .parse::<u64>()
        .map(NodeId)
        .map_err(|_| SyncError::BadReplicaName(name.to_string()));
}

impl<S> Store<S>
where
    S: OrSet<Item> + Default + Serialize + DeserializeOwned,
{
    /// Serialize one replica's current state.
    pub fn encode_replica(&self, name: &str) -> Result<Vec<u8>, SyncError> {
        if name.is_empty() {
            return Ok(bincode::serialize(&self.root_replica)?);
        }
        let id = parse_replica_name(name)?;
        let node = self
            .node(id)
            .ok_or_else(|| SyncError::UnknownReplica(name.to_string()))?;
        return Ok(bincode::serialize(&node.state)?);
    }

    /// Broadcast a replica if it is dirty: returns the fragmented state and
    /// clears the flag, or nothing when there is nothing new to say.
    pub fn broadcast_state(&mut self, name: &str) -> Result<Option<Vec<StateMessage>>, SyncError> {
        let dirty = if name.is_empty() {
            self.root_replica.is_dirty()
        } else {
            let id = parse_replica_name(name)?;
            self.node(id)
                .ok_or_else(|| SyncError::UnknownReplica(name.to_string()))?
                .state
                .is_dirty()
        };
        if !dirty {
            return Ok(None);
        }

        let buffer = self.encode_replica(name)?;
        if name.is_empty() {
            self.root_replica.mark_clean();
        } else if let Some(node) = self.node_mut(parse_replica_name(name)?) {
            node.state.mark_clean();
        }
        return Ok(Some(fragment(name, &buffer)));
    }

    /// Answer a pull request: broadcast that replica's state if dirty.
    pub fn handle_request(
        &mut self,
        request: &StateRequest,
    ) -> Result<Option<Vec<StateMessage>>, SyncError> {
        return self.broadcast_state(&request.replica);
    }

    /// Merge a reassembled state buffer into the named replica. A replica
    /// never seen before is materialized as a fresh node wrapper first.
    pub fn apply_state(&mut self, name: &str, buffer: &[u8]) -> Result<(), SyncError> {
        if name.is_empty() {
            let remote = bincode::deserialize(buffer)?;
            self.root_replica.combine(&remote);
            return Ok(());
        }
        let id = parse_replica_name(name)?;
        let remote: S = bincode::deserialize(buffer)?;
        if self.node(id).is_none() {
            tracing::debug!(node = %id, "materializing replica received from peer");
            self.register(Node::from_state(id, S::default()));
        }
        if let Some(node) = self.node_mut(id) {
            node.state.combine(&remote);
        }
        return Ok(());
    }

    /// Names of every replica with unbroadcast changes.
    pub fn dirty_replicas(&self) -> Vec<ReplicaName> {
        let mut result = Vec::new();
        if self.root_replica.is_dirty() {
            result.push(String::new());
        }
        for (id, node) in &self.nodes {
            if node.state.is_dirty() {
                result.push(id.to_string());
            }
        }
        return result;
    }

    /// Broadcast every dirty replica, clearing flags as it goes.
    pub fn broadcast_all(&mut self) -> Result<Vec<StateMessage>, SyncError> {
        let mut messages = Vec::new();
        for name in self.dirty_replicas() {
            if let Some(mut batch) = self.broadcast_state(&name)? {
                messages.append(&mut batch);
            }
        }
        return Ok(messages);
    }
}
