use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

use bellperson::bls::Fr;
use crossbeam::channel::{Receiver, Sender};
use ff::Field;
use generic_array::sequence::GenericSequence;
use generic_array::GenericArray;
use log::{debug, trace};
use neptune::batch_hasher::{Batcher, BatcherType};
use neptune::{Arity, BatchHasher};

use crate::pool::{BufToDisk, DiskBatcher};
use crate::scheduler::BufHandle;
use crate::utils::{fr_read_bytes, NODE_SIZE};

#[cfg(feature = "gpu")]
mod devices {
    use neptune::batch_hasher::BatcherType;
    use rust_gpu_tools::opencl::Device;

    pub fn num_gpus() -> usize {
        std::cmp::max(1, Device::all().len())
    }

    pub fn batcher_type(stream: usize) -> BatcherType {
        let all = Device::all();
        if all.is_empty() {
            return BatcherType::CPU;
        }
        BatcherType::FromDevice(all[stream % all.len()])
    }
}

#[cfg(not(feature = "gpu"))]
mod devices {
    use neptune::batch_hasher::BatcherType;

    pub fn num_gpus() -> usize {
        1
    }

    pub fn batcher_type(_stream: usize) -> BatcherType {
        BatcherType::CPU
    }
}

pub use devices::{batcher_type, num_gpus};

/// The final leaf output of one stream for one partition, handed to the
/// CPU top hasher as owned data. Sector-major: `[sector][node]`.
pub struct FinalChunk {
    pub resource: usize,
    pub tree_c: Vec<Fr>,
    pub tree_r: Vec<Fr>,
}

/// One operation submitted to a stream. Jobs execute strictly in order;
/// that ordering is what makes arena slot reuse by the scheduler sound.
pub enum StreamJob {
    /// Column-hash a batch of leaf positions across all layers. The raw
    /// slot bytes ride along (the host-to-device copy); digests are staged
    /// for the following `ColumnLeaves` job and written into `buf`.
    Columns {
        column_bytes: Vec<u8>,
        big_endian: bool,
        buf: BufToDisk,
    },
    /// Hash the staged column digests (tree-c) and the encoded last layer
    /// (tree-r) into their first tree row.
    ColumnLeaves {
        out_c: Option<BufHandle>,
        out_r: BufHandle,
        replica: Vec<Fr>,
        buf_c: Option<BufToDisk>,
        buf_r: Option<BufToDisk>,
        stash: bool,
    },
    /// Hash an internal row from previously produced buffers.
    Internal {
        inputs_c: Vec<BufHandle>,
        inputs_r: Vec<BufHandle>,
        out_c: Option<BufHandle>,
        out_r: BufHandle,
        buf_c: Option<BufToDisk>,
        buf_r: Option<BufToDisk>,
        stash: bool,
    },
}

#[derive(Clone, Copy)]
pub struct StreamConfig {
    pub sectors: usize,
    pub batch_size: usize,
}

/// Service loop for one GPU stream: owns the device batchers and the
/// buffer arena, executes jobs in submission order, and completes each one
/// by enqueueing finished disk buffers and flipping the resource's
/// `async_done` flag. This is the only code the orchestrator's poll loop
/// waits on.
pub fn stream_worker<ColumnArity, TreeArity>(
    id: usize,
    jobs: Receiver<StreamJob>,
    cfg: StreamConfig,
    disk: &DiskBatcher<'_>,
    results: Sender<FinalChunk>,
    done: Arc<AtomicBool>,
) where
    ColumnArity: Arity<Fr>,
    TreeArity: Arity<Fr>,
{
    let max_batch = cfg.sectors * cfg.batch_size;
    let batcher_type = batcher_type(id);
    let mut column_batcher =
        Batcher::<ColumnArity>::new(&batcher_type, max_batch).expect("column batcher");
    let mut tree_batcher =
        Batcher::<TreeArity>::new(&batcher_type, max_batch).expect("tree batcher");

    let chunk = cfg.batch_size / TreeArity::to_usize();
    let mut slots_c: Vec<Vec<Fr>> = Vec::new();
    let mut slots_r: Vec<Vec<Fr>> = Vec::new();
    let mut column_digests: Vec<Fr> = vec![Fr::zero(); max_batch];

    debug!("stream {} worker started", id);

    for job in jobs.iter() {
        match job {
            StreamJob::Columns {
                column_bytes,
                big_endian,
                mut buf,
            } => {
                hash_columns::<ColumnArity>(
                    &mut column_batcher,
                    &column_bytes,
                    big_endian,
                    cfg,
                    &mut column_digests,
                );
                buf.data.clear();
                buf.data.extend_from_slice(&column_digests);
                disk.enqueue(buf);
            }
            StreamJob::ColumnLeaves {
                out_c,
                out_r,
                replica,
                buf_c,
                buf_r,
                stash,
            } => {
                if let Some(out_c) = out_c {
                    let leaves = hash_groups(&mut tree_batcher, &column_digests);
                    store(&mut slots_c, out_c, leaves);
                    if let Some(mut buf) = buf_c {
                        buf.data.extend_from_slice(&slots_c[out_c]);
                        disk.enqueue(buf);
                    }
                }

                let leaves = hash_groups(&mut tree_batcher, &replica);
                store(&mut slots_r, out_r, leaves);
                if let Some(mut buf) = buf_r {
                    buf.data.extend_from_slice(&slots_r[out_r]);
                    disk.enqueue(buf);
                }

                if stash
                    && stash_results(id, out_c.map(|h| &slots_c[h]), &slots_r[out_r], &results)
                        .is_err()
                {
                    break;
                }
            }
            StreamJob::Internal {
                inputs_c,
                inputs_r,
                out_c,
                out_r,
                buf_c,
                buf_r,
                stash,
            } => {
                if let Some(out_c) = out_c {
                    let gathered = gather(&slots_c, &inputs_c, cfg.sectors, chunk);
                    let row = hash_groups(&mut tree_batcher, &gathered);
                    store(&mut slots_c, out_c, row);
                    if let Some(mut buf) = buf_c {
                        buf.data.extend_from_slice(&slots_c[out_c]);
                        disk.enqueue(buf);
                    }
                }

                let gathered = gather(&slots_r, &inputs_r, cfg.sectors, chunk);
                let row = hash_groups(&mut tree_batcher, &gathered);
                store(&mut slots_r, out_r, row);
                if let Some(mut buf) = buf_r {
                    buf.data.extend_from_slice(&slots_r[out_r]);
                    disk.enqueue(buf);
                }

                if stash
                    && stash_results(id, out_c.map(|h| &slots_c[h]), &slots_r[out_r], &results)
                        .is_err()
                {
                    break;
                }
            }
        }
        done.store(true, SeqCst);
    }

    debug!("stream {} worker done", id);
}

fn stash_results(
    id: usize,
    tree_c: Option<&Vec<Fr>>,
    tree_r: &[Fr],
    results: &Sender<FinalChunk>,
) -> Result<(), ()> {
    trace!("stream {} stashing final leaves", id);
    results
        .send(FinalChunk {
            resource: id,
            tree_c: tree_c.cloned().unwrap_or_default(),
            tree_r: tree_r.to_vec(),
        })
        .map_err(|_| ())
}

fn store(slots: &mut Vec<Vec<Fr>>, handle: BufHandle, row: Vec<Fr>) {
    if handle >= slots.len() {
        slots.resize(handle + 1, Vec::new());
    }
    slots[handle] = row;
}

/// Concatenate the `arity` input buffers per sector: input `m` holds the
/// m-th contiguous chunk of child nodes for every sector.
fn gather(slots: &[Vec<Fr>], inputs: &[BufHandle], sectors: usize, chunk: usize) -> Vec<Fr> {
    let mut out = Vec::with_capacity(sectors * inputs.len() * chunk);
    for sector in 0..sectors {
        for &handle in inputs.iter() {
            out.extend_from_slice(&slots[handle][sector * chunk..(sector + 1) * chunk]);
        }
    }
    out
}

fn hash_columns<ColumnArity: Arity<Fr>>(
    batcher: &mut Batcher<ColumnArity>,
    column_bytes: &[u8],
    big_endian: bool,
    cfg: StreamConfig,
    digests: &mut [Fr],
) {
    let layers = ColumnArity::to_usize();
    let sectors = cfg.sectors;
    let batch = cfg.batch_size;
    debug_assert_eq!(column_bytes.len(), layers * sectors * batch * NODE_SIZE);

    // sector-major preimages so the digest layout matches the contiguous
    // per-sector disk chunks
    let mut preimages = Vec::with_capacity(sectors * batch);
    for sector in 0..sectors {
        for node in 0..batch {
            let mut column = GenericArray::<Fr, ColumnArity>::generate(|_| Fr::zero());
            for layer in 0..layers {
                let start = ((layer * sectors + sector) * batch + node) * NODE_SIZE;
                column[layer] = fr_read_bytes(&column_bytes[start..start + NODE_SIZE], big_endian)
                    .expect("layer bytes are not a field element");
            }
            preimages.push(column);
        }
    }

    hash_into(batcher, &preimages, digests);
}

/// Hash a row of nodes in arity-sized groups, sector alignment preserved
/// (`batch_size` is a multiple of the arity).
fn hash_groups<TreeArity: Arity<Fr>>(batcher: &mut Batcher<TreeArity>, nodes: &[Fr]) -> Vec<Fr> {
    let arity = TreeArity::to_usize();
    debug_assert_eq!(nodes.len() % arity, 0);
    let preimages: Vec<GenericArray<Fr, TreeArity>> = nodes
        .chunks(arity)
        .map(GenericArray::clone_from_slice)
        .collect();
    let mut out = vec![Fr::zero(); preimages.len()];
    hash_into(batcher, &preimages, &mut out);
    out
}

fn hash_into<A: Arity<Fr>>(
    batcher: &mut Batcher<A>,
    preimages: &[GenericArray<Fr, A>],
    out: &mut [Fr],
) {
    debug_assert_eq!(preimages.len(), out.len());
    let step = batcher.max_batch_size();
    let mut filled = 0;
    for chunk in preimages.chunks(step) {
        batcher
            .hash_into_slice(&mut out[filled..filled + chunk.len()], chunk)
            .expect("batch hash failed");
        filled += chunk.len();
    }
}
