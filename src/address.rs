use anyhow::{ensure, Result};

use crate::utils::is_power_of;

/// Position of a node inside a serialized tree. Layer 0 holds the leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId {
    pub layer: u32,
    pub node: u64,
}

impl NodeId {
    pub fn new(layer: u32, node: u64) -> Self {
        NodeId { layer, node }
    }
}

/// Byte offset arithmetic for a serialized Merkle tree: the layers are
/// concatenated starting from the leaves, every node is `node_size` bytes.
#[derive(Clone, Debug)]
pub struct TreeAddress {
    leaf_count: u64,
    arity: u64,
    node_size: u64,
    layer_offsets: Vec<u64>,
}

impl TreeAddress {
    pub fn new(leaf_count: u64, arity: usize, node_size: usize) -> Result<Self> {
        ensure!(
            is_power_of(leaf_count, arity as u64),
            "leaf count {} is not a power of the arity {}",
            leaf_count,
            arity
        );

        let mut layer_offsets = Vec::new();
        let mut offset = 0u64;
        let mut nodes = leaf_count;
        loop {
            layer_offsets.push(offset);
            if nodes == 1 {
                break;
            }
            offset += nodes * node_size as u64;
            nodes /= arity as u64;
        }

        Ok(TreeAddress {
            leaf_count,
            arity: arity as u64,
            node_size: node_size as u64,
            layer_offsets,
        })
    }

    /// Address a tree whose bottom `skipped_rows` layers are not serialized
    /// (tree-r discards `discard_rows + 1` rows). The resulting tree is
    /// addressed over the reduced leaf count.
    pub fn with_skipped_rows(
        leaf_count: u64,
        arity: usize,
        node_size: usize,
        skipped_rows: usize,
    ) -> Result<Self> {
        let skipped = (arity as u64).pow(skipped_rows as u32);
        ensure!(
            skipped <= leaf_count,
            "cannot skip {} rows of a tree over {} leaves",
            skipped_rows,
            leaf_count
        );
        Self::new(leaf_count / skipped, arity, node_size)
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    pub fn num_layers(&self) -> usize {
        self.layer_offsets.len()
    }

    pub fn nodes_at(&self, layer: u32) -> u64 {
        debug_assert!((layer as usize) < self.layer_offsets.len());
        self.leaf_count / self.arity.pow(layer)
    }

    pub fn address(&self, id: NodeId) -> u64 {
        debug_assert!(
            (id.layer as usize) < self.layer_offsets.len(),
            "layer {} out of range",
            id.layer
        );
        debug_assert!(
            id.node < self.nodes_at(id.layer),
            "node {} out of range at layer {}",
            id.node,
            id.layer
        );
        self.layer_offsets[id.layer as usize] + id.node * self.node_size
    }

    /// Total size in bytes of the serialized tree.
    pub fn data_size(&self) -> u64 {
        self.layer_offsets[self.layer_offsets.len() - 1] + self.node_size
    }
}
