use std::cell::UnsafeCell;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

use anyhow::{ensure, Context, Result};
use log::debug;
use mapr::{Mmap, MmapOptions};

use crate::utils::NODE_SIZE;

/// Supplier of layer pages for the streaming tree builder.
///
/// A slot is a staging buffer owned by exactly one stream resource. The
/// slot data layout is `((layer_rel * sectors + sector) * batch + node) *
/// NODE_SIZE` bytes, with `layer_rel` relative to `start_layer`.
///
/// `load_layers` may populate the slot asynchronously; the caller observes
/// completion by polling `valid` until it reaches the returned count.
pub trait LayerReader: Sync {
    fn load_layers(
        &self,
        slot: usize,
        start_layer: usize,
        start_node: u64,
        batch: usize,
        num_layers: usize,
        valid: &AtomicU64,
    ) -> Result<u64>;

    fn slot(&self, slot: usize) -> &[u8];

    /// Whether layer and data-file bytes are serialized big-endian.
    fn data_is_big_endian(&self) -> bool {
        false
    }
}

struct SlotBuf {
    data: UnsafeCell<Vec<u8>>,
}

// One slot is only ever touched by the resource that owns it; the engine
// upholds that protocol.
unsafe impl Sync for SlotBuf {}

/// Memory-mapped `LayerReader` over one file per (layer, sector). This is
/// the production path for page-cache backed layer storage and the test
/// fixture path; NVMe/SPDK readers implement the same trait elsewhere.
pub struct MmapLayerReader {
    /// `[layer][sector]`.
    maps: Vec<Vec<Mmap>>,
    sectors: usize,
    num_nodes: u64,
    slots: Vec<SlotBuf>,
    big_endian: bool,
}

impl MmapLayerReader {
    pub fn open(
        layer_paths: &[Vec<PathBuf>],
        slot_count: usize,
        batch_size: usize,
        big_endian: bool,
    ) -> Result<Self> {
        ensure!(!layer_paths.is_empty(), "at least one layer required");
        let sectors = layer_paths[0].len();
        ensure!(sectors > 0, "at least one sector required");

        let mut num_nodes = 0u64;
        let mut maps = Vec::with_capacity(layer_paths.len());
        for (layer, paths) in layer_paths.iter().enumerate() {
            ensure!(
                paths.len() == sectors,
                "layer {} has {} sectors, expected {}",
                layer,
                paths.len(),
                sectors
            );
            let mut row = Vec::with_capacity(sectors);
            for path in paths.iter() {
                let file = File::open(path)
                    .with_context(|| format!("open layer file {:?}", path))?;
                let map = unsafe { MmapOptions::new().map(&file) }
                    .with_context(|| format!("mmap layer file {:?}", path))?;
                let nodes = map.len() as u64 / NODE_SIZE as u64;
                if num_nodes == 0 {
                    num_nodes = nodes;
                }
                ensure!(
                    nodes == num_nodes,
                    "layer file {:?} holds {} nodes, expected {}",
                    path,
                    nodes,
                    num_nodes
                );
                row.push(map);
            }
            maps.push(row);
        }

        let slot_bytes = layer_paths.len() * sectors * batch_size * NODE_SIZE;
        let slots = (0..slot_count)
            .map(|_| SlotBuf {
                data: UnsafeCell::new(vec![0u8; slot_bytes]),
            })
            .collect();

        debug!(
            "mmap layer reader: {} layers x {} sectors, {} nodes, {} slots of {} bytes",
            layer_paths.len(),
            sectors,
            num_nodes,
            slot_count,
            slot_bytes
        );

        Ok(MmapLayerReader {
            maps,
            sectors,
            num_nodes,
            slots,
            big_endian,
        })
    }

    pub fn num_nodes(&self) -> u64 {
        self.num_nodes
    }
}

impl LayerReader for MmapLayerReader {
    fn load_layers(
        &self,
        slot: usize,
        start_layer: usize,
        start_node: u64,
        batch: usize,
        num_layers: usize,
        valid: &AtomicU64,
    ) -> Result<u64> {
        ensure!(slot < self.slots.len(), "slot {} out of range", slot);
        ensure!(
            start_layer + num_layers <= self.maps.len(),
            "layer range out of bounds"
        );
        ensure!(
            start_node + batch as u64 <= self.num_nodes,
            "node range {}..{} out of bounds",
            start_node,
            start_node + batch as u64
        );

        // The engine guarantees exclusive use of this slot.
        let buf = unsafe { &mut *self.slots[slot].data.get() };
        let row_bytes = batch * NODE_SIZE;
        let src_start = start_node as usize * NODE_SIZE;

        for layer_rel in 0..num_layers {
            for sector in 0..self.sectors {
                let src = &self.maps[start_layer + layer_rel][sector]
                    [src_start..src_start + row_bytes];
                let dst_start = (layer_rel * self.sectors + sector) * row_bytes;
                buf[dst_start..dst_start + row_bytes].copy_from_slice(src);
                valid.fetch_add(1, SeqCst);
            }
        }

        Ok((num_layers * self.sectors) as u64)
    }

    fn slot(&self, slot: usize) -> &[u8] {
        unsafe { &*self.slots[slot].data.get() }
    }

    fn data_is_big_endian(&self) -> bool {
        self.big_endian
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_slot_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layers = 2;
        let sectors = 2;
        let nodes = 8u64;

        // layer files where node n of (layer l, sector s) has first byte
        // l * 100 + s * 10 + n
        let mut paths = Vec::new();
        for l in 0..layers {
            let mut row = Vec::new();
            for s in 0..sectors {
                let path = dir.path().join(format!("layer-{}-{}", l, s));
                let mut file = File::create(&path).unwrap();
                for n in 0..nodes {
                    let mut node = [0u8; NODE_SIZE];
                    node[0] = (l * 100 + s * 10 + n as usize) as u8;
                    file.write_all(&node).unwrap();
                }
                row.push(path);
            }
            paths.push(row);
        }

        let reader = MmapLayerReader::open(&paths, 1, 4, false).unwrap();
        assert_eq!(reader.num_nodes(), nodes);

        let valid = AtomicU64::new(0);
        let count = reader.load_layers(0, 0, 4, 4, layers, &valid).unwrap();
        assert_eq!(count, (layers * sectors) as u64);
        assert_eq!(valid.load(SeqCst), count);

        let slot = reader.slot(0);
        // (layer 0, sector 1, node 5) lives at ((0*2 + 1)*4 + 1) * 32
        assert_eq!(slot[((0 * sectors + 1) * 4 + 1) * NODE_SIZE], 15);
        // (layer 1, sector 0, node 6) at ((1*2 + 0)*4 + 2) * 32
        assert_eq!(slot[((1 * sectors + 0) * 4 + 2) * NODE_SIZE], 106);
    }
}
