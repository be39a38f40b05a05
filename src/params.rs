use std::path::PathBuf;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::utils::{is_power_of, log_base, NODE_SIZE};

pub const MAX_PARALLEL_SECTORS: usize = 128;

/// Shape of the sectors being sealed. Fixed at engine instantiation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SectorParams {
    /// Number of encoding layers (the column arity).
    pub num_layers: usize,
    /// Merkle tree arity for tree-c and tree-r.
    pub arity: usize,
    /// Number of tree files (partitions) per sector.
    pub num_partitions: usize,
    /// Number of bottom tree-r rows omitted from disk.
    pub discard_rows: usize,
    /// Leaf nodes per sector.
    pub num_nodes: u64,
    /// Sectors hashed in parallel.
    pub parallel_sectors: usize,
}

impl SectorParams {
    pub fn nodes_per_partition(&self) -> u64 {
        self.num_nodes / self.num_partitions as u64
    }

    pub fn sector_size(&self) -> u64 {
        self.num_nodes * NODE_SIZE as u64
    }
}

/// Core assignments for the auxiliary threads. `None` leaves placement to
/// the OS scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreTopology {
    /// Core for the CPU top-tree hasher.
    pub hasher_core: Option<usize>,
    /// First core of the disk writer pool; writer `i` binds to
    /// `writer_core + i`.
    pub writer_core: Option<usize>,
    /// Number of disk writer threads.
    pub writer_threads: usize,
}

impl Default for CoreTopology {
    fn default() -> Self {
        CoreTopology {
            hasher_core: None,
            writer_core: None,
            writer_threads: std::cmp::min(4, num_cpus::get()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Pc2Config {
    pub sector: SectorParams,
    /// Leaf nodes processed per work item (`B`).
    pub batch_size: usize,
    /// GPU streams, balanced across the available devices.
    pub stream_count: usize,
    /// BufToDisk entries per disk write batch (`K`).
    pub disk_io_batch_size: usize,
    /// Pre-populated host batches in the pool.
    pub host_batches: usize,
    /// Empty batch shells in the pool.
    pub host_empty_batches: usize,
    /// Skip tree-c entirely; only tree-r and `p_aux` are produced.
    pub tree_r_only: bool,
    /// Test hook: when false, leaf items consume the reader slot as-is
    /// instead of issuing `load_layers`.
    pub reads_enabled: bool,
    pub output_dir: PathBuf,
    /// Optional per-sector data file. Present = non-CC sector: the last
    /// layer is encoded with the file's field elements.
    pub data_files: Vec<Option<PathBuf>>,
    pub topology: CoreTopology,
}

impl Pc2Config {
    pub fn new(sector: SectorParams, output_dir: PathBuf) -> Self {
        let sectors = sector.parallel_sectors;
        Pc2Config {
            sector,
            batch_size: 64,
            stream_count: 1,
            disk_io_batch_size: 8,
            host_batches: 8,
            host_empty_batches: 4,
            tree_r_only: false,
            reads_enabled: true,
            output_dir,
            data_files: vec![None; sectors],
            topology: CoreTopology::default(),
        }
    }

    /// Leaf nodes handled by one stream within a partition.
    pub fn nodes_per_stream(&self) -> u64 {
        self.sector.nodes_per_partition() / self.stream_count as u64
    }

    /// Nodes per sector in one work item output (`B / A`).
    pub fn leaf_chunk(&self) -> usize {
        self.batch_size / self.sector.arity
    }

    /// Per-sector leaves handed to the CPU top hasher.
    pub fn cpu_leaf_count(&self) -> u64 {
        (self.stream_count * self.leaf_chunk()) as u64
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.sector;
        let arity = s.arity as u64;

        ensure!(
            s.parallel_sectors >= 1
                && s.parallel_sectors <= MAX_PARALLEL_SECTORS
                && s.parallel_sectors.is_power_of_two(),
            "parallel_sectors must be a power of two in 1..={}",
            MAX_PARALLEL_SECTORS
        );
        ensure!(s.num_layers >= 1, "at least one layer is required");
        ensure!(
            s.arity >= 2 && s.arity.is_power_of_two(),
            "tree arity must be a power of two >= 2"
        );
        ensure!(s.num_partitions >= 1, "at least one partition");
        ensure!(
            s.num_nodes % s.num_partitions as u64 == 0,
            "node count must divide evenly into partitions"
        );

        let nodes_to_read = s.nodes_per_partition();
        ensure!(
            is_power_of(nodes_to_read, arity),
            "partition node count must be a power of the arity"
        );
        ensure!(self.stream_count >= 1, "at least one stream");
        ensure!(
            nodes_to_read % self.stream_count as u64 == 0,
            "partition node count must divide evenly across streams"
        );

        let per_stream = self.nodes_per_stream();
        ensure!(
            self.batch_size % s.arity == 0,
            "batch size must be a multiple of the arity"
        );
        ensure!(
            per_stream % self.batch_size as u64 == 0 && per_stream >= self.batch_size as u64,
            "per-stream nodes must be a multiple of the batch size"
        );
        ensure!(
            is_power_of(per_stream / self.batch_size as u64, arity),
            "per-stream leaf groups must be a power of the arity"
        );

        // The CPU hashes the final `stream_count * B / A` leaves per sector;
        // that count must itself reduce cleanly to a single root.
        let cpu_leaves = self.cpu_leaf_count();
        ensure!(
            cpu_leaves >= arity && is_power_of(cpu_leaves, arity),
            "stream_count * batch_size / arity must be a power of the arity"
        );

        // Discarded tree-r rows must sit strictly below the CPU region.
        let gpu_top_layer = log_base(nodes_to_read / cpu_leaves, arity);
        ensure!(
            (s.discard_rows as u32) < gpu_top_layer + 1,
            "discard_rows reaches into the CPU hashed top of the tree"
        );

        ensure!(
            self.data_files.len() == s.parallel_sectors,
            "one data file slot per sector required"
        );
        ensure!(self.disk_io_batch_size >= 1, "empty disk batches");
        ensure!(
            self.host_batches >= 2 && self.host_empty_batches >= 2,
            "at least two host batches per pool side"
        );

        Ok(())
    }
}
