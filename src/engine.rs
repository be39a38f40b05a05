use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use bellperson::bls::Fr;
use crossbeam::channel::{Receiver, Sender};
use ff::Field;
use log::{debug, trace};
use mapr::Mmap;
use rayon::prelude::*;

use crate::address::{NodeId, TreeAddress};
use crate::params::Pc2Config;
use crate::pool::{DiskBatcher, FileDest, FileKind};
use crate::reader::LayerReader;
use crate::scheduler::{Scheduler, WorkItem};
use crate::stream::{FinalChunk, StreamJob};
use crate::utils::{fr_read_bytes, NODE_SIZE};

/// Assembled final leaf outputs of all streams for one partition, laid out
/// `[stream][sector][node]`.
pub struct PartitionResults {
    pub tree_c: Vec<Fr>,
    pub tree_r: Vec<Fr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResourceState {
    Idle,
    DataRead,
    DataWait { valid_count: u64 },
    HashColumn,
    HashColumnLeaves,
    HashLeaf,
    HashWait,
    Done,
}

/// One logical GPU stream: a pair of lock-step schedulers, the current work
/// items, and the completion flag its service thread reports through.
struct GpuResource {
    id: usize,
    state: ResourceState,
    scheduler_c: Scheduler,
    scheduler_r: Scheduler,
    work_c: WorkItem,
    work_r: WorkItem,
    last: bool,
    jobs: Sender<StreamJob>,
    done: Arc<AtomicBool>,
    valid: AtomicU64,
    /// Encoded last-layer staging, sector-major.
    replica: Vec<Fr>,
    /// Global node index (within the sector) of the current leaf batch.
    start_node: u64,
}

/// The multi-stream orchestrator. `hash_gpu` advances every resource's
/// state machine round-robin on the calling thread; it never blocks on I/O
/// and only ever sleeps when a full pass makes no progress.
pub struct StreamEngine<'a, R: LayerReader> {
    cfg: &'a Pc2Config,
    reader: &'a R,
    batcher: &'a DiskBatcher<'a>,
    data_maps: &'a [Option<Mmap>],
    addr_c: TreeAddress,
    addr_r: TreeAddress,
    resources: Vec<GpuResource>,
    results_rx: Receiver<FinalChunk>,
    nodes_to_read: u64,
    nodes_per_stream: u64,
}

impl<'a, R: LayerReader> StreamEngine<'a, R> {
    pub fn new(
        cfg: &'a Pc2Config,
        reader: &'a R,
        batcher: &'a DiskBatcher<'a>,
        data_maps: &'a [Option<Mmap>],
        addr_c: TreeAddress,
        addr_r: TreeAddress,
        streams: Vec<(Sender<StreamJob>, Arc<AtomicBool>)>,
        results_rx: Receiver<FinalChunk>,
    ) -> Result<Self> {
        ensure!(streams.len() == cfg.stream_count, "one channel per stream");
        ensure!(
            data_maps.len() == cfg.sector.parallel_sectors,
            "one data map slot per sector"
        );

        let nodes_per_stream = cfg.nodes_per_stream();
        let resources = streams
            .into_iter()
            .enumerate()
            .map(|(id, (jobs, done))| {
                done.store(true, SeqCst);
                Ok(GpuResource {
                    id,
                    state: ResourceState::Idle,
                    scheduler_c: Scheduler::new(
                        nodes_per_stream,
                        cfg.batch_size as u64,
                        cfg.sector.arity,
                    )?,
                    scheduler_r: Scheduler::new(
                        nodes_per_stream,
                        cfg.batch_size as u64,
                        cfg.sector.arity,
                    )?,
                    work_c: WorkItem::default(),
                    work_r: WorkItem::default(),
                    last: false,
                    jobs,
                    done,
                    valid: AtomicU64::new(0),
                    replica: Vec::new(),
                    start_node: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StreamEngine {
            cfg,
            reader,
            batcher,
            data_maps,
            addr_c,
            addr_r,
            resources,
            results_rx,
            nodes_to_read: cfg.sector.nodes_per_partition(),
            nodes_per_stream,
        })
    }

    fn reset(&mut self) {
        for r in self.resources.iter_mut() {
            r.scheduler_c.reset();
            r.scheduler_r.reset();
            r.state = ResourceState::Idle;
            r.last = false;
            r.done.store(true, SeqCst);
            r.valid.store(0, SeqCst);
            r.replica.clear();
            r.start_node = 0;
        }
    }

    /// Build every GPU-hashed row of one partition and return the final
    /// leaf outputs for the CPU top hasher.
    pub fn hash_gpu(&mut self, partition: usize) -> Result<PartitionResults> {
        debug!("hash_gpu partition {}", partition);
        self.reset();

        loop {
            let mut progressed = false;
            let mut all_done = true;
            for index in 0..self.resources.len() {
                progressed |= self.advance_at(index, partition)?;
                all_done &= self.resources[index].state == ResourceState::Done;
            }
            if all_done {
                break;
            }
            if !progressed {
                std::thread::sleep(Duration::from_micros(10));
            }
        }

        // Every stream has sent its final chunk before flipping its done
        // flag, so this drains without waiting.
        let sectors = self.cfg.sector.parallel_sectors;
        let per_stream = sectors * self.cfg.leaf_chunk();
        let total = self.cfg.stream_count * per_stream;
        let mut tree_c = vec![Fr::zero(); if self.cfg.tree_r_only { 0 } else { total }];
        let mut tree_r = vec![Fr::zero(); total];
        for _ in 0..self.cfg.stream_count {
            let chunk = self
                .results_rx
                .recv()
                .expect("stream results disconnected");
            let base = chunk.resource * per_stream;
            if !self.cfg.tree_r_only {
                tree_c[base..base + per_stream].copy_from_slice(&chunk.tree_c);
            }
            tree_r[base..base + per_stream].copy_from_slice(&chunk.tree_r);
        }

        debug!("hash_gpu partition {} complete", partition);
        Ok(PartitionResults { tree_c, tree_r })
    }

    /// Advance one resource by at most one transition. Returns whether any
    /// progress was made.
    fn advance_at(&mut self, index: usize, partition: usize) -> Result<bool> {
        let cfg = self.cfg;
        let reader = self.reader;
        let batcher = self.batcher;
        let data_maps = self.data_maps;
        let addr_c = &self.addr_c;
        let addr_r = &self.addr_r;
        let nodes_to_read = self.nodes_to_read;
        let nodes_per_stream = self.nodes_per_stream;
        let r = &mut self.resources[index];

        let sectors = cfg.sector.parallel_sectors;
        let batch = cfg.batch_size;
        let arity = cfg.sector.arity as u64;
        let chunk = cfg.leaf_chunk();
        let num_layers = cfg.sector.num_layers;
        let tree_r_only = cfg.tree_r_only;
        let discard = cfg.sector.discard_rows as u32;

        match r.state {
            ResourceState::Idle => {
                let more_c = r.scheduler_c.next(&mut r.work_c);
                let more_r = r.scheduler_r.next(&mut r.work_r);
                debug_assert_eq!(r.work_c.idx, r.work_r.idx);
                debug_assert_eq!(more_c, more_r);
                r.last = !more_c;

                if r.work_c.is_leaf {
                    r.start_node = r.work_c.idx.node * batch as u64
                        + nodes_per_stream * r.id as u64
                        + partition as u64 * nodes_to_read;
                    r.state = if cfg.reads_enabled {
                        ResourceState::DataRead
                    } else {
                        // test mode: the slot already holds the layer data
                        ResourceState::DataWait { valid_count: 0 }
                    };
                } else {
                    r.state = ResourceState::HashLeaf;
                }
                Ok(true)
            }

            ResourceState::DataRead => {
                let (start_layer, load_layers) = if tree_r_only {
                    (num_layers - 1, 1)
                } else {
                    (0, num_layers)
                };
                r.valid.store(0, SeqCst);
                let valid_count = reader.load_layers(
                    r.id,
                    start_layer,
                    r.start_node,
                    batch,
                    load_layers,
                    &r.valid,
                )?;
                r.state = ResourceState::DataWait { valid_count };
                Ok(true)
            }

            ResourceState::DataWait { valid_count } => {
                if r.valid.load(SeqCst) < valid_count {
                    return Ok(false);
                }
                // The sealed buffer is claimed on the same pass that builds
                // the replica, so stall before doing the work.
                if !tree_r_only && batcher.size() < 1 {
                    return Ok(false);
                }

                let slot = reader.slot(r.id);
                let loaded_layers = if tree_r_only { 1 } else { num_layers };
                let last_rel = loaded_layers - 1;
                let big_endian = reader.data_is_big_endian();
                let start_node = r.start_node;

                // last layer, field-added with the data file where present
                let encoded: Vec<Vec<Fr>> = (0..sectors)
                    .into_par_iter()
                    .map(|sector| {
                        let mut row = Vec::with_capacity(batch);
                        for node in 0..batch {
                            let off = ((last_rel * sectors + sector) * batch + node) * NODE_SIZE;
                            let mut fr = fr_read_bytes(&slot[off..off + NODE_SIZE], big_endian)
                                .expect("layer bytes are not a field element");
                            if let Some(map) = &data_maps[sector] {
                                let doff = (start_node as usize + node) * NODE_SIZE;
                                let data = fr_read_bytes(&map[doff..doff + NODE_SIZE], big_endian)
                                    .expect("data bytes are not a field element");
                                fr.add_assign(&data);
                            }
                            row.push(fr);
                        }
                        row
                    })
                    .collect();
                r.replica.clear();
                for row in encoded.iter() {
                    r.replica.extend_from_slice(row);
                }

                if tree_r_only {
                    r.state = ResourceState::HashColumnLeaves;
                    return Ok(true);
                }

                // sealed bytes: node-major interleave, big-endian on disk
                let mut buf = batcher.dequeue();
                for node in 0..batch {
                    for row in encoded.iter() {
                        buf.data.push(row[node]);
                    }
                }
                buf.per_sector = batch;
                buf.stride = sectors;
                buf.reverse = true;
                buf.offset = start_node * NODE_SIZE as u64;
                buf.dest = Some(FileDest {
                    kind: FileKind::Sealed,
                    partition,
                });
                batcher.enqueue(buf);

                r.state = ResourceState::HashColumn;
                Ok(true)
            }

            ResourceState::HashColumn => {
                if batcher.size() < 1 {
                    return Ok(false);
                }
                let mut buf = batcher.dequeue();
                buf.per_sector = batch;
                buf.stride = 1;
                buf.offset = addr_c.address(NodeId::new(
                    0,
                    r.work_c.idx.node * batch as u64 + r.id as u64 * nodes_per_stream,
                ));
                buf.dest = Some(FileDest {
                    kind: FileKind::TreeC,
                    partition,
                });

                let slot = reader.slot(r.id);
                let column_bytes = slot[..num_layers * sectors * batch * NODE_SIZE].to_vec();

                trace!("stream {} column hash at {:?}", r.id, r.work_c.idx);
                r.done.store(false, SeqCst);
                r.jobs
                    .send(StreamJob::Columns {
                        column_bytes,
                        big_endian: reader.data_is_big_endian(),
                        buf,
                    })
                    .expect("stream worker disconnected");
                r.state = ResourceState::HashColumnLeaves;
                Ok(true)
            }

            ResourceState::HashColumnLeaves => {
                if !r.done.load(SeqCst) {
                    return Ok(false);
                }
                // leaf items produce tree row 1 for both trees
                let write_r = 1 > discard;
                let needed = (!tree_r_only) as usize + write_r as usize;
                if needed > 0 && batcher.size() < needed {
                    return Ok(false);
                }

                let node_base =
                    r.work_c.idx.node * chunk as u64 + r.id as u64 * (nodes_per_stream / arity);
                let buf_c = if tree_r_only {
                    None
                } else {
                    let mut buf = batcher.dequeue();
                    buf.per_sector = chunk;
                    buf.stride = 1;
                    buf.offset = addr_c.address(NodeId::new(1, node_base));
                    buf.dest = Some(FileDest {
                        kind: FileKind::TreeC,
                        partition,
                    });
                    Some(buf)
                };
                let buf_r = if write_r {
                    let mut buf = batcher.dequeue();
                    buf.per_sector = chunk;
                    buf.stride = 1;
                    buf.offset = addr_r.address(NodeId::new(1 - (discard + 1), node_base));
                    buf.dest = Some(FileDest {
                        kind: FileKind::TreeRLast,
                        partition,
                    });
                    Some(buf)
                } else {
                    None
                };

                let replica = std::mem::take(&mut r.replica);
                trace!("stream {} leaf hash at {:?}", r.id, r.work_c.idx);
                r.done.store(false, SeqCst);
                r.jobs
                    .send(StreamJob::ColumnLeaves {
                        out_c: if tree_r_only { None } else { Some(r.work_c.buf) },
                        out_r: r.work_r.buf,
                        replica,
                        buf_c,
                        buf_r,
                        stash: r.last,
                    })
                    .expect("stream worker disconnected");
                r.state = ResourceState::HashWait;
                Ok(true)
            }

            ResourceState::HashLeaf => {
                let tree_layer = r.work_c.idx.layer + 1;
                let write_r = tree_layer > discard;
                let needed = (!tree_r_only) as usize + write_r as usize;
                if needed > 0 && batcher.size() < needed {
                    return Ok(false);
                }

                let node_base = r.work_c.idx.node * chunk as u64
                    + r.id as u64 * (nodes_per_stream / arity.pow(tree_layer));
                let buf_c = if tree_r_only {
                    None
                } else {
                    let mut buf = batcher.dequeue();
                    buf.per_sector = chunk;
                    buf.stride = 1;
                    buf.offset = addr_c.address(NodeId::new(tree_layer, node_base));
                    buf.dest = Some(FileDest {
                        kind: FileKind::TreeC,
                        partition,
                    });
                    Some(buf)
                };
                let buf_r = if write_r {
                    let mut buf = batcher.dequeue();
                    buf.per_sector = chunk;
                    buf.stride = 1;
                    buf.offset = addr_r.address(NodeId::new(tree_layer - (discard + 1), node_base));
                    buf.dest = Some(FileDest {
                        kind: FileKind::TreeRLast,
                        partition,
                    });
                    Some(buf)
                } else {
                    None
                };

                trace!("stream {} internal hash at {:?}", r.id, r.work_c.idx);
                r.done.store(false, SeqCst);
                r.jobs
                    .send(StreamJob::Internal {
                        inputs_c: r.work_c.inputs.clone(),
                        inputs_r: r.work_r.inputs.clone(),
                        out_c: if tree_r_only { None } else { Some(r.work_c.buf) },
                        out_r: r.work_r.buf,
                        buf_c,
                        buf_r,
                        stash: r.last,
                    })
                    .expect("stream worker disconnected");
                r.state = ResourceState::HashWait;
                Ok(true)
            }

            ResourceState::HashWait => {
                if !r.done.load(SeqCst) {
                    return Ok(false);
                }
                r.state = if r.last {
                    ResourceState::Done
                } else {
                    ResourceState::Idle
                };
                Ok(true)
            }

            ResourceState::Done => Ok(false),
        }
    }
}
