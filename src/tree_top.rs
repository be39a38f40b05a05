use bellperson::bls::{Bls12, Fr};
use crossbeam::channel::{Receiver, Sender};
use log::{debug, trace};
use neptune::poseidon::PoseidonConstants;
use neptune::Arity;

use crate::address::{NodeId, TreeAddress};
use crate::cores::bind_core;
use crate::engine::PartitionResults;
use crate::hashing;
use crate::pool::{FileDest, FileKind};
use crate::utils::{fr_write_bytes, NODE_SIZE};
use crate::writer::FileSet;

pub struct TopHashJob {
    pub partition: usize,
    pub results: PartitionResults,
}

pub struct PartitionRoots {
    pub partition: usize,
    /// Per-sector tree-c root; empty when only tree-r is built.
    pub root_c: Vec<Fr>,
    /// Per-sector tree-r root.
    pub root_r: Vec<Fr>,
}

pub struct TopContext<'a> {
    pub files: &'a FileSet,
    pub addr_c: TreeAddress,
    pub addr_r: TreeAddress,
    pub sectors: usize,
    /// Nodes per sector in one stream's final output (`B / A`).
    pub chunk: usize,
    pub stream_count: usize,
    pub tree_r_only: bool,
    pub hasher_core: Option<usize>,
}

/// Service loop for the CPU top hasher: one partition at a time, overlapped
/// by the caller with the next partition's GPU work.
pub fn top_hash_worker<TreeArity: Arity<Fr>>(
    jobs: Receiver<TopHashJob>,
    roots: Sender<PartitionRoots>,
    ctx: &TopContext<'_>,
) {
    if let Some(core) = ctx.hasher_core {
        bind_core(core);
    }
    let constants = PoseidonConstants::<Bls12, TreeArity>::new();

    for job in jobs.iter() {
        debug!("top hash partition {}", job.partition);
        let root_c = if ctx.tree_r_only {
            Vec::new()
        } else {
            hash_top(
                ctx,
                &constants,
                &job.results.tree_c,
                &ctx.addr_c,
                FileKind::TreeC,
                job.partition,
            )
        };
        let root_r = hash_top(
            ctx,
            &constants,
            &job.results.tree_r,
            &ctx.addr_r,
            FileKind::TreeRLast,
            job.partition,
        );
        if roots
            .send(PartitionRoots {
                partition: job.partition,
                root_c,
                root_r,
            })
            .is_err()
        {
            break;
        }
    }
}

/// Hash the top of one tree from the streams' final leaf outputs and write
/// every produced node into the per-sector partition files. Input layout is
/// `[stream][sector][node]`; a node `i` of sector `s` therefore lives at
/// `input[(i / chunk) * sectors * chunk + s * chunk + i % chunk]`.
fn hash_top<TreeArity: Arity<Fr>>(
    ctx: &TopContext<'_>,
    constants: &PoseidonConstants<Bls12, TreeArity>,
    input: &[Fr],
    addr: &TreeAddress,
    kind: FileKind,
    partition: usize,
) -> Vec<Fr> {
    let arity = TreeArity::to_usize();
    let leaves_per_sector = ctx.stream_count * ctx.chunk;

    // The supplied leaves are already on disk; writes start one row up.
    let final_tree = TreeAddress::new((leaves_per_sector / arity) as u64, arity, NODE_SIZE)
        .expect("final tree shape");
    let file_offset = addr.data_size() - final_tree.data_size();

    let mut bytes = vec![0u8; leaves_per_sector / arity * NODE_SIZE];
    let mut roots = Vec::with_capacity(ctx.sectors);
    for sector in 0..ctx.sectors {
        let mut level: Vec<Fr> = (0..leaves_per_sector)
            .map(|i| {
                let group = i / ctx.chunk;
                let node = i % ctx.chunk;
                input[(group * ctx.sectors + sector) * ctx.chunk + node]
            })
            .collect();

        let file = ctx.files.resolve(FileDest { kind, partition }, sector);
        let mut next = Vec::new();
        let mut layer = 0u32;
        while level.len() > 1 {
            hashing::hash_level(constants, &level, &mut next);
            let out = &mut bytes[..next.len() * NODE_SIZE];
            for (i, fr) in next.iter().enumerate() {
                fr_write_bytes(fr, &mut out[i * NODE_SIZE..(i + 1) * NODE_SIZE], false);
            }
            let offset = file_offset + final_tree.address(NodeId::new(layer, 0));
            trace!(
                "top {:?} sector {} layer {} at {}",
                kind,
                sector,
                layer,
                offset
            );
            file.write_data(offset, out).expect("top tree write failed");

            std::mem::swap(&mut level, &mut next);
            layer += 1;
        }
        roots.push(level[0]);
    }
    roots
}
