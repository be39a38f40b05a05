use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use crossbeam::thread::Scope;
use log::{debug, trace};

use crate::cores::bind_core;
use crate::params::CoreTopology;
use crate::pool::{BufToDisk, BufferPool, FileDest, FileKind};
use crate::settings;
use crate::utils::{fr_write_bytes, NODE_SIZE};

/// A pre-sized output file supporting concurrent disjoint positional
/// writes. With `pc2_disable_file_writes` set, writes are no-ops while
/// everything else (offsets, queue flow) behaves identically.
#[derive(Debug)]
pub struct SectorFile {
    file: File,
    writes_enabled: bool,
}

impl SectorFile {
    pub fn new(file: File) -> Self {
        SectorFile {
            file,
            writes_enabled: settings::file_writes_enabled(),
        }
    }

    pub fn write_data(&self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        if !self.writes_enabled {
            return Ok(());
        }
        self.file.write_all_at(bytes, offset)
    }
}

/// All open output files for one engine run, indexed by destination kind,
/// partition and sector.
pub struct FileSet {
    pub sectors: usize,
    /// `[partition][sector]`; empty when only tree-r is built.
    pub tree_c: Vec<Vec<SectorFile>>,
    /// `[partition][sector]`.
    pub tree_r: Vec<Vec<SectorFile>>,
    /// `[sector]`; empty when only tree-r is built.
    pub sealed: Vec<SectorFile>,
}

impl FileSet {
    pub fn resolve(&self, dest: FileDest, sector: usize) -> &SectorFile {
        match dest.kind {
            FileKind::TreeC => &self.tree_c[dest.partition][sector],
            FileKind::TreeRLast => &self.tree_r[dest.partition][sector],
            FileKind::Sealed => &self.sealed[sector],
        }
    }
}

/// Spawn the disk writer pool. Writers drain `to_disk` until `terminate` is
/// set and the queue is empty, then decrement `done`; the orchestrator
/// spins on that counter before declaring the run finished.
pub fn spawn_writers<'env>(
    scope: &Scope<'env>,
    pool: &'env BufferPool,
    files: &'env FileSet,
    max_per_sector: usize,
    topology: &CoreTopology,
    terminate: &'env AtomicBool,
    done: &'env AtomicUsize,
) {
    for id in 0..topology.writer_threads {
        let core = topology.writer_core.map(|base| base + id);
        scope.spawn(move |_| {
            if let Some(core) = core {
                bind_core(core);
            }
            writer_loop(id, pool, files, max_per_sector, terminate, done);
        });
    }
}

fn writer_loop(
    id: usize,
    pool: &BufferPool,
    files: &FileSet,
    max_per_sector: usize,
    terminate: &AtomicBool,
    done: &AtomicUsize,
) {
    debug!("disk writer {} started", id);
    let mut scratch = vec![0u8; max_per_sector * NODE_SIZE];
    let to_disk = pool.to_disk();

    loop {
        match to_disk.recv_timeout(Duration::from_millis(10)) {
            Ok(batch) => {
                for slot in batch.bufs.iter() {
                    if let Some(buf) = slot {
                        write_buf(buf, files, &mut scratch);
                    }
                }
                pool.return_written(batch);
            }
            Err(RecvTimeoutError::Timeout) => {
                if terminate.load(SeqCst) && to_disk.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("disk writer {} done", id);
    done.fetch_sub(1, SeqCst);
}

/// Write one buffer to its per-sector destinations. Write failures are
/// fatal: a partial tree on disk is useless.
pub fn write_buf(buf: &BufToDisk, files: &FileSet, scratch: &mut [u8]) {
    let dest = match buf.dest {
        Some(dest) => dest,
        None => return, // padding slot
    };
    trace!(
        "write {:?} partition {} offset {} x{}",
        dest.kind,
        dest.partition,
        buf.offset,
        buf.per_sector
    );

    let bytes = &mut scratch[..buf.per_sector * NODE_SIZE];
    for sector in 0..files.sectors {
        if buf.stride == 1 {
            let chunk = &buf.data[sector * buf.per_sector..(sector + 1) * buf.per_sector];
            for (i, fr) in chunk.iter().enumerate() {
                fr_write_bytes(fr, &mut bytes[i * NODE_SIZE..(i + 1) * NODE_SIZE], buf.reverse);
            }
        } else {
            // gather every stride-th element into the staging scratch
            for i in 0..buf.per_sector {
                let fr = &buf.data[i * buf.stride + sector];
                fr_write_bytes(fr, &mut bytes[i * NODE_SIZE..(i + 1) * NODE_SIZE], buf.reverse);
            }
        }
        files
            .resolve(dest, sector)
            .write_data(buf.offset, bytes)
            .expect("tree file write failed");
    }
}
