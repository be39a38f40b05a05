use std::sync::Mutex;

use bellperson::bls::Fr;
use crossbeam::channel::{bounded, Receiver, Sender};

/// Which output file a buffer is destined for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    TreeC,
    TreeRLast,
    Sealed,
}

#[derive(Clone, Copy, Debug)]
pub struct FileDest {
    pub kind: FileKind,
    pub partition: usize,
}

/// A host result buffer headed for disk.
///
/// `data` holds the field elements for all sectors. With `stride == 1` the
/// per-sector chunks are contiguous (`data[s * per_sector..]`); with
/// `stride == parallel_sectors` the elements are node-major interleaved and
/// the writer gathers `data[node * stride + sector]`, byte-reversing each
/// element to big-endian when `reverse` is set.
#[derive(Debug)]
pub struct BufToDisk {
    pub data: Vec<Fr>,
    pub per_sector: usize,
    /// Byte offset within each destination file.
    pub offset: u64,
    pub stride: usize,
    pub reverse: bool,
    /// `None` marks a padding slot from `flush`.
    pub dest: Option<FileDest>,
}

impl BufToDisk {
    fn with_capacity(capacity: usize) -> Self {
        BufToDisk {
            data: Vec::with_capacity(capacity),
            per_sector: 0,
            offset: 0,
            stride: 1,
            reverse: false,
            dest: None,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.per_sector = 0;
        self.offset = 0;
        self.stride = 1;
        self.reverse = false;
        self.dest = None;
    }
}

/// Fixed-size bundle of buffers travelling between the pools, the batcher
/// and the disk writers.
#[derive(Debug)]
pub struct BufToDiskBatch {
    pub bufs: Vec<Option<BufToDisk>>,
}

impl BufToDiskBatch {
    fn populated(len: usize, buf_capacity: usize) -> Self {
        BufToDiskBatch {
            bufs: (0..len)
                .map(|_| Some(BufToDisk::with_capacity(buf_capacity)))
                .collect(),
        }
    }

    fn shell(len: usize) -> Self {
        BufToDiskBatch {
            bufs: (0..len).map(|_| None).collect(),
        }
    }
}

/// Three bounded MPMC queues of batches. Every batch is at all times in
/// exactly one queue or held by exactly one thread:
/// `full -> (dequeue) -> empty -> (enqueue) -> to_disk -> (writer) -> full`.
pub struct BufferPool {
    batch_len: usize,
    total_batches: usize,
    full_tx: Sender<BufToDiskBatch>,
    full_rx: Receiver<BufToDiskBatch>,
    empty_tx: Sender<BufToDiskBatch>,
    empty_rx: Receiver<BufToDiskBatch>,
    to_disk_tx: Sender<BufToDiskBatch>,
    to_disk_rx: Receiver<BufToDiskBatch>,
}

impl BufferPool {
    pub fn new(
        batch_len: usize,
        host_batches: usize,
        host_empty_batches: usize,
        buf_capacity: usize,
    ) -> Self {
        let total = host_batches + host_empty_batches;
        let (full_tx, full_rx) = bounded(total);
        let (empty_tx, empty_rx) = bounded(total);
        let (to_disk_tx, to_disk_rx) = bounded(total);

        for _ in 0..host_batches {
            full_tx
                .send(BufToDiskBatch::populated(batch_len, buf_capacity))
                .expect("populating pool_full");
        }
        for _ in 0..host_empty_batches {
            empty_tx
                .send(BufToDiskBatch::shell(batch_len))
                .expect("populating pool_empty");
        }

        BufferPool {
            batch_len,
            total_batches: total,
            full_tx,
            full_rx,
            empty_tx,
            empty_rx,
            to_disk_tx,
            to_disk_rx,
        }
    }

    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    /// Consumer side for the disk writers.
    pub fn to_disk(&self) -> &Receiver<BufToDiskBatch> {
        &self.to_disk_rx
    }

    /// Writers return drained batches here; their buffers are ready to be
    /// filled again.
    pub fn return_written(&self, batch: BufToDiskBatch) {
        self.full_tx.send(batch).expect("pool_full disconnected");
    }

    pub fn queued_batches(&self) -> (usize, usize, usize) {
        (
            self.full_rx.len(),
            self.empty_rx.len(),
            self.to_disk_rx.len(),
        )
    }
}

struct DequeueHalf {
    current: Option<BufToDiskBatch>,
    next: usize,
}

struct EnqueueHalf {
    current: Option<BufToDiskBatch>,
    filled: usize,
}

/// Adapter between single-buffer producers and the batch-granular pool.
/// `dequeue` runs on the orchestrator thread only; `enqueue` is also called
/// from stream completion threads, so both halves sit behind short-held
/// mutexes.
pub struct DiskBatcher<'a> {
    pool: &'a BufferPool,
    out: Mutex<DequeueHalf>,
    inb: Mutex<EnqueueHalf>,
}

impl<'a> DiskBatcher<'a> {
    pub fn new(pool: &'a BufferPool) -> Self {
        DiskBatcher {
            pool,
            out: Mutex::new(DequeueHalf {
                current: None,
                next: 0,
            }),
            inb: Mutex::new(EnqueueHalf {
                current: None,
                filled: 0,
            }),
        }
    }

    /// Conservative lower bound on both "buffers available to dequeue" and
    /// "slots available to receive enqueued buffers". The orchestrator uses
    /// `size() < needed` as its backpressure predicate, which covers both
    /// directions at once.
    pub fn size(&self) -> usize {
        let k = self.pool.batch_len;

        let out = self.out.lock().expect("batcher dequeue lock");
        let available = self.pool.full_rx.len() * k
            + out
                .current
                .as_ref()
                .map(|batch| batch.bufs[out.next..].iter().filter(|b| b.is_some()).count())
                .unwrap_or(0);
        drop(out);

        let inb = self.inb.lock().expect("batcher enqueue lock");
        let receivable = self.pool.empty_rx.len() * k
            + inb.current.as_ref().map(|_| k - inb.filled).unwrap_or(0);
        drop(inb);

        std::cmp::min(available, receivable)
    }

    /// Pop one buffer from the current `pool_full` batch; once a batch is
    /// exhausted its shell moves to `pool_empty`.
    pub fn dequeue(&self) -> BufToDisk {
        let k = self.pool.batch_len;
        let mut guard = self.out.lock().expect("batcher dequeue lock");
        let out = &mut *guard;
        loop {
            if out.current.is_none() {
                out.current = Some(self.pool.full_rx.recv().expect("pool_full disconnected"));
                out.next = 0;
            }

            let mut taken = None;
            {
                let batch = out.current.as_mut().expect("current batch");
                while out.next < k {
                    let slot = batch.bufs[out.next].take();
                    out.next += 1;
                    if slot.is_some() {
                        taken = slot;
                        break;
                    }
                }
            }
            if out.next >= k {
                let shell = out.current.take().expect("current batch");
                self.pool
                    .empty_tx
                    .send(shell)
                    .expect("pool_empty disconnected");
            }
            if let Some(mut buf) = taken {
                buf.clear();
                return buf;
            }
        }
    }

    /// Append a filled buffer into the current shell; a completed bundle is
    /// handed to the writers.
    pub fn enqueue(&self, buf: BufToDisk) {
        let k = self.pool.batch_len;
        let mut guard = self.inb.lock().expect("batcher enqueue lock");
        let inb = &mut *guard;
        if inb.current.is_none() {
            inb.current = Some(self.pool.empty_rx.recv().expect("pool_empty disconnected"));
            inb.filled = 0;
        }

        let batch = inb.current.as_mut().expect("current shell");
        debug_assert!(batch.bufs[inb.filled].is_none());
        batch.bufs[inb.filled] = Some(buf);
        inb.filled += 1;

        if inb.filled == k {
            let full = inb.current.take().expect("current shell");
            self.pool.to_disk_tx.send(full).expect("to_disk disconnected");
        }
    }

    /// Push out a partially filled bundle (padding slots stay `None`) and
    /// hand untouched batches back to their original pools. Idempotent.
    pub fn flush(&self) {
        let mut inb = self.inb.lock().expect("batcher enqueue lock");
        if let Some(batch) = inb.current.take() {
            if inb.filled == 0 {
                self.pool
                    .empty_tx
                    .send(batch)
                    .expect("pool_empty disconnected");
            } else {
                self.pool.to_disk_tx.send(batch).expect("to_disk disconnected");
            }
        }
        drop(inb);

        let mut out = self.out.lock().expect("batcher dequeue lock");
        if let Some(batch) = out.current.take() {
            // untouched or partially consumed, the remaining buffers ride
            // back on pool_full either way
            self.pool.full_tx.send(batch).expect("pool_full disconnected");
        }
    }
}
