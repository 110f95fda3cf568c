//! Chain node encoding.
//!
//! ```text
//! Offset  Size  Field
//! 0       4     serial
//! 4       4     next node (arena handle, 0 ends the chain)
//! 8       2     newsgroup id
//! 10      n+1   message-ID, NUL terminated
//! ```
//!
//! `next` is the only field that changes after a node is published, and it
//! is always read and written as an atomic word.

use crate::arena::ChunkHandle;
use crate::config::{CHAIN_NODE_HEADER_SIZE, MAX_MESSAGE_ID_LEN};
use crate::newsgroup::GroupId;

pub const NEXT_OFFSET: usize = 4;
const GROUP_OFFSET: usize = 8;

pub fn node_size(message_id_len: usize) -> usize {
    CHAIN_NODE_HEADER_SIZE + message_id_len + 1
}

/// A message-ID can be indexed if it fits in the largest chunk and has no
/// embedded NUL.
pub fn is_indexable(message_id: &[u8]) -> bool {
    !message_id.is_empty() && message_id.len() <= MAX_MESSAGE_ID_LEN && !message_id.contains(&0)
}

pub fn encode(serial: u32, next: ChunkHandle, group: GroupId, message_id: &[u8]) -> Vec<u8> {
    let mut node = Vec::with_capacity(node_size(message_id.len()));
    node.extend_from_slice(&serial.to_le_bytes());
    node.extend_from_slice(&next.get().to_le_bytes());
    node.extend_from_slice(&group.get().to_le_bytes());
    node.extend_from_slice(message_id);
    node.push(0);
    node
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef<'a> {
    pub serial: u32,
    pub group: GroupId,
    /// Empty for a tombstoned node.
    pub message_id: &'a [u8],
}

/// Parses the immutable part of a node from a prefix of its chunk. `None`
/// means the bytes cannot be a node.
pub fn parse(bytes: &[u8]) -> Option<NodeRef<'_>> {
    if bytes.len() <= CHAIN_NODE_HEADER_SIZE {
        return None;
    }
    let serial = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let group = u16::from_le_bytes(bytes[GROUP_OFFSET..GROUP_OFFSET + 2].try_into().ok()?);
    let rest = &bytes[CHAIN_NODE_HEADER_SIZE..];
    let nul = rest.iter().position(|&b| b == 0)?;

    Some(NodeRef {
        serial,
        group: GroupId::new(group),
        message_id: &rest[..nul],
    })
}
