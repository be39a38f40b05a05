use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use bellperson::bls::{Bls12, Fr};
use crossbeam::channel::bounded;
use crossbeam::thread;
use ff::Field;
use log::{debug, info};
use mapr::{Mmap, MmapOptions};
use neptune::poseidon::PoseidonConstants;
use neptune::Arity;

use crate::address::TreeAddress;
use crate::engine::StreamEngine;
use crate::hashing;
use crate::layout::FileLayout;
use crate::params::Pc2Config;
use crate::pool::{BufferPool, DiskBatcher};
use crate::reader::LayerReader;
use crate::settings;
use crate::stream::{self, StreamConfig, StreamJob};
use crate::tree_top::{self, PartitionRoots, TopContext, TopHashJob};
use crate::utils::{fr_write_bytes, NODE_SIZE};
use crate::writer;

/// Final per-sector roots, as written into `p_aux`.
#[derive(Clone, Debug)]
pub struct Pc2Output {
    pub comm_c: Vec<Fr>,
    pub comm_r_last: Vec<Fr>,
}

/// Build tree-c and tree-r for every sector and partition, write the
/// sealed replica bytes, and emit the per-sector `p_aux` root files.
///
/// `ColumnArity` is the layer count, `TreeArity` the tree branching
/// factor; `PartitionArity` is only consulted when more than one partition
/// is configured (the partition roots are folded with a Poseidon of that
/// arity).
///
/// GPU work on partition `i` overlaps with the CPU top-hash of partition
/// `i - 1`. The reader must provide at least `stream_count` slots.
pub fn pc2<ColumnArity, TreeArity, PartitionArity, R>(
    config: &Pc2Config,
    reader: &R,
) -> Result<Pc2Output>
where
    ColumnArity: Arity<Fr>,
    TreeArity: Arity<Fr>,
    PartitionArity: Arity<Fr>,
    R: LayerReader,
{
    config.validate()?;
    ensure!(
        ColumnArity::to_usize() == config.sector.num_layers,
        "column arity must equal the layer count"
    );
    ensure!(
        TreeArity::to_usize() == config.sector.arity,
        "tree arity mismatch"
    );
    ensure!(
        config.sector.num_partitions == 1
            || PartitionArity::to_usize() == config.sector.num_partitions,
        "partition arity must equal the partition count"
    );
    ensure!(
        config.stream_count % stream::num_gpus() == 0,
        "stream count must balance across {} device(s)",
        stream::num_gpus()
    );

    let sectors = config.sector.parallel_sectors;
    let partitions = config.sector.num_partitions;
    info!(
        "pc2: {} sectors x {} partitions, {} streams, tree_r_only: {}",
        sectors, partitions, config.stream_count, config.tree_r_only
    );

    // up to 128 sectors x several files each
    if let Some(limit) = fdlimit::raise_fd_limit() {
        debug!("raised fd limit to {}", limit);
    }

    let nodes_to_read = config.sector.nodes_per_partition();
    let addr_c = TreeAddress::new(nodes_to_read, config.sector.arity, NODE_SIZE)?;
    let addr_r = TreeAddress::with_skipped_rows(
        nodes_to_read,
        config.sector.arity,
        NODE_SIZE,
        config.sector.discard_rows + 1,
    )?;

    let layout = FileLayout::new(&config.output_dir, sectors, partitions);
    let files = layout.open_files(
        if config.tree_r_only {
            None
        } else {
            Some(&addr_c)
        },
        &addr_r,
        config.sector.sector_size(),
    )?;

    let data_maps = open_data_maps(config)?;

    let pool = BufferPool::new(
        config.disk_io_batch_size,
        config.host_batches,
        config.host_empty_batches,
        sectors * config.batch_size,
    );
    let batcher = DiskBatcher::new(&pool);

    let terminate = AtomicBool::new(false);
    let writers_done = AtomicUsize::new(config.topology.writer_threads);

    let (results_tx, results_rx) = bounded(config.stream_count);
    let (top_tx, top_rx) = bounded::<TopHashJob>(1);
    let (roots_tx, roots_rx) = bounded::<PartitionRoots>(1);

    let mut streams = Vec::with_capacity(config.stream_count);
    let mut workers = Vec::with_capacity(config.stream_count);
    for _ in 0..config.stream_count {
        let (job_tx, job_rx) = bounded::<StreamJob>(2);
        let done = Arc::new(AtomicBool::new(true));
        streams.push((job_tx, done.clone()));
        workers.push((job_rx, done));
    }

    let stream_cfg = StreamConfig {
        sectors,
        batch_size: config.batch_size,
    };
    let top_ctx = TopContext {
        files: &files,
        addr_c: addr_c.clone(),
        addr_r: addr_r.clone(),
        sectors,
        chunk: config.leaf_chunk(),
        stream_count: config.stream_count,
        tree_r_only: config.tree_r_only,
        hasher_core: config.topology.hasher_core,
    };

    let (roots_c, roots_r) = thread::scope(|s| {
        writer::spawn_writers(
            s,
            &pool,
            &files,
            config.batch_size,
            &config.topology,
            &terminate,
            &writers_done,
        );

        let batcher_ref = &batcher;
        for (id, (job_rx, done)) in workers.into_iter().enumerate() {
            let results_tx = results_tx.clone();
            s.spawn(move |_| {
                stream::stream_worker::<ColumnArity, TreeArity>(
                    id, job_rx, stream_cfg, batcher_ref, results_tx, done,
                );
            });
        }
        drop(results_tx);

        let top_ctx = &top_ctx;
        s.spawn(move |_| tree_top::top_hash_worker::<TreeArity>(top_rx, roots_tx, top_ctx));

        // Sequence the partitions, overlapping GPU work on partition i with
        // the CPU top-hash of partition i - 1 through the single-slot
        // channels. Teardown below runs on every exit path so the writer
        // pool can always drain and stop.
        let engine_batcher = &batcher;
        let engine_maps = &data_maps[..];
        let run = move || -> Result<(Vec<Vec<Fr>>, Vec<Vec<Fr>>)> {
            let mut engine = StreamEngine::new(
                config,
                reader,
                engine_batcher,
                engine_maps,
                addr_c,
                addr_r,
                streams,
                results_rx,
            )?;

            let mut roots_c = vec![Vec::new(); partitions];
            let mut roots_r = vec![Vec::new(); partitions];
            let mut pending = 0usize;
            for partition in 0..partitions {
                let results = engine.hash_gpu(partition)?;
                top_tx
                    .send(TopHashJob { partition, results })
                    .map_err(|_| anyhow!("top hasher exited early"))?;
                pending += 1;

                if pending > 1 {
                    let roots = roots_rx.recv().context("top hasher disconnected")?;
                    roots_c[roots.partition] = roots.root_c;
                    roots_r[roots.partition] = roots.root_r;
                    pending -= 1;
                }
            }
            while pending > 0 {
                let roots = roots_rx.recv().context("top hasher disconnected")?;
                roots_c[roots.partition] = roots.root_c;
                roots_r[roots.partition] = roots.root_r;
                pending -= 1;
            }
            Ok((roots_c, roots_r))
        };
        let result = run();

        batcher.flush();
        terminate.store(true, SeqCst);
        while writers_done.load(SeqCst) > 0 {
            std::thread::sleep(Duration::from_micros(100));
        }

        result
    })
    .expect("pc2 worker thread panicked")?;

    write_roots::<PartitionArity>(&layout, config, roots_c, roots_r)
}

/// Remove every output file `pc2` produces for this configuration.
pub fn cleanup(config: &Pc2Config) -> Result<()> {
    FileLayout::new(
        &config.output_dir,
        config.sector.parallel_sectors,
        config.sector.num_partitions,
    )
    .cleanup()
}

fn open_data_maps(config: &Pc2Config) -> Result<Vec<Option<Mmap>>> {
    config
        .data_files
        .iter()
        .map(|path| match path {
            Some(path) => {
                let file =
                    File::open(path).with_context(|| format!("open data file {:?}", path))?;
                let map = unsafe { MmapOptions::new().map(&file) }
                    .with_context(|| format!("mmap data file {:?}", path))?;
                ensure!(
                    map.len() as u64 >= config.sector.sector_size(),
                    "data file {:?} is smaller than the sector",
                    path
                );
                Ok(Some(map))
            }
            None => Ok(None),
        })
        .collect()
}

/// Fold the per-partition roots into `p_aux`: `[root_c | root_r]`, with a
/// zero `root_c` for tree-r-only runs.
fn write_roots<PartitionArity: Arity<Fr>>(
    layout: &FileLayout,
    config: &Pc2Config,
    roots_c: Vec<Vec<Fr>>,
    roots_r: Vec<Vec<Fr>>,
) -> Result<Pc2Output> {
    let partitions = config.sector.num_partitions;
    let constants = if partitions > 1 {
        Some(PoseidonConstants::<Bls12, PartitionArity>::new())
    } else {
        None
    };

    let aggregate = |roots: &[Vec<Fr>], sector: usize| -> Fr {
        match &constants {
            Some(constants) => {
                let preimage: Vec<Fr> = roots.iter().map(|p| p[sector]).collect();
                hashing::hash_group(constants, &preimage)
            }
            None => roots[0][sector],
        }
    };

    let mut comm_c = Vec::with_capacity(config.sector.parallel_sectors);
    let mut comm_r_last = Vec::with_capacity(config.sector.parallel_sectors);
    for sector in 0..config.sector.parallel_sectors {
        let root_c = if config.tree_r_only {
            Fr::zero()
        } else {
            aggregate(&roots_c, sector)
        };
        let root_r = aggregate(&roots_r, sector);

        let mut bytes = [0u8; 2 * NODE_SIZE];
        fr_write_bytes(&root_c, &mut bytes[..NODE_SIZE], false);
        fr_write_bytes(&root_r, &mut bytes[NODE_SIZE..], false);
        if settings::file_writes_enabled() {
            std::fs::write(layout.p_aux_path(sector), &bytes[..])
                .with_context(|| format!("writing p_aux for sector {}", sector))?;
        }
        info!(
            "sector {}: comm_c {} comm_r_last {}",
            sector,
            hex::encode(&bytes[..NODE_SIZE]),
            hex::encode(&bytes[NODE_SIZE..])
        );

        comm_c.push(root_c);
        comm_r_last.push(root_r);
    }

    Ok(Pc2Output {
        comm_c,
        comm_r_last,
    })
}
