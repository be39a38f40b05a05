use anyhow::{ensure, Result};

use crate::address::NodeId;
use crate::utils::{is_power_of, log_base};

/// Arena index of a reusable result buffer. The scheduler hands these out
/// and recycles them; actual storage lives with the stream that executes
/// the items.
pub type BufHandle = usize;

/// One unit of hashing work. Leaf items cover `batch_size` contiguous input
/// positions; internal items consume the output buffers of the `arity`
/// immediately preceding items at the child layer.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub idx: NodeId,
    pub is_leaf: bool,
    pub buf: BufHandle,
    pub inputs: Vec<BufHandle>,
}

impl Default for WorkItem {
    fn default() -> Self {
        WorkItem {
            idx: NodeId::new(0, 0),
            is_leaf: true,
            buf: 0,
            inputs: Vec::new(),
        }
    }
}

/// Produces the bottom-up streaming order for one subtree: leaf groups are
/// interleaved with the internal items they feed, so that an internal item
/// always fires right after its `arity` children and their buffers are
/// still live. Single threaded; owned by exactly one stream resource.
pub struct Scheduler {
    leaf_items: u64,
    arity: usize,
    /// Item layers, including the final single-item top layer.
    levels: usize,
    total: u64,
    emitted: u64,
    /// Items emitted so far per layer.
    counts: Vec<u64>,
    /// Output handles awaiting consumption, per producing layer.
    pending: Vec<Vec<BufHandle>>,
    free: Vec<BufHandle>,
    next_handle: BufHandle,
}

impl Scheduler {
    pub fn new(leaves: u64, batch_size: u64, arity: usize) -> Result<Self> {
        ensure!(
            batch_size > 0 && leaves % batch_size == 0,
            "leaves must divide into batches"
        );
        let leaf_items = leaves / batch_size;
        ensure!(
            is_power_of(leaf_items, arity as u64),
            "leaf group count {} must be a power of the arity {}",
            leaf_items,
            arity
        );

        let levels = log_base(leaf_items, arity as u64) as usize + 1;
        let mut total = 0;
        let mut items = leaf_items;
        for _ in 0..levels {
            total += items;
            items /= arity as u64;
        }

        Ok(Scheduler {
            leaf_items,
            arity,
            levels,
            total,
            emitted: 0,
            counts: vec![0; levels],
            pending: vec![Vec::new(); levels],
            free: Vec::new(),
            next_handle: 0,
        })
    }

    pub fn total_items(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.emitted = 0;
        for c in self.counts.iter_mut() {
            *c = 0;
        }
        for p in self.pending.iter_mut() {
            p.clear();
        }
        self.free.clear();
        self.next_handle = 0;
    }

    fn alloc(&mut self) -> BufHandle {
        self.free.pop().unwrap_or_else(|| {
            let handle = self.next_handle;
            self.next_handle += 1;
            handle
        })
    }

    /// Fill `work` with the next item. Returns `false` on the final item of
    /// the sequence.
    pub fn next(&mut self, work: &mut WorkItem) -> bool {
        assert!(self.emitted < self.total, "scheduler exhausted");

        // The lowest layer with a full set of pending outputs fires its
        // parent before any further leaves are read.
        let ready = self
            .pending
            .iter()
            .position(|handles| handles.len() == self.arity);

        match ready {
            Some(level) => {
                let inputs: Vec<BufHandle> = self.pending[level].drain(..).collect();
                // allocate before recycling so the output never aliases an
                // input of the same item
                let out = self.alloc();
                self.free.extend_from_slice(&inputs);

                let layer = level + 1;
                work.idx = NodeId::new(layer as u32, self.counts[layer]);
                work.is_leaf = false;
                work.buf = out;
                work.inputs.clear();
                work.inputs.extend_from_slice(&inputs);

                self.counts[layer] += 1;
                if layer + 1 < self.levels {
                    self.pending[layer].push(out);
                }
            }
            None => {
                debug_assert!(self.counts[0] < self.leaf_items);
                let out = self.alloc();
                work.idx = NodeId::new(0, self.counts[0]);
                work.is_leaf = true;
                work.buf = out;
                work.inputs.clear();

                self.counts[0] += 1;
                if self.levels > 1 {
                    self.pending[0].push(out);
                }
            }
        }

        self.emitted += 1;
        self.emitted < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(leaves: u64, batch: u64, arity: usize) -> Vec<WorkItem> {
        let mut scheduler = Scheduler::new(leaves, batch, arity).unwrap();
        let mut items = Vec::new();
        let mut work = WorkItem::default();
        loop {
            let more = scheduler.next(&mut work);
            items.push(work.clone());
            if !more {
                break;
            }
        }
        items
    }

    #[test]
    fn test_sequence_length() {
        // leaves/B + leaves/(B*A) + ... + 1
        assert_eq!(collect(512, 64, 8).len(), 8 + 1);
        assert_eq!(collect(4096, 64, 8).len(), 64 + 8 + 1);
        assert_eq!(collect(64, 64, 8).len(), 1);
        assert_eq!(collect(256, 64, 2).len(), 4 + 2 + 1);
    }

    #[test]
    fn test_internal_inputs_are_immediately_prior_children() {
        for &(leaves, batch, arity) in &[(4096u64, 64u64, 8usize), (256, 64, 2), (512, 64, 8)] {
            let items = collect(leaves, batch, arity);
            for (i, item) in items.iter().enumerate() {
                if item.is_leaf {
                    assert!(item.inputs.is_empty());
                    continue;
                }
                assert_eq!(item.inputs.len(), arity);
                // the last `arity` prior items at the child layer supplied
                // the inputs, in order
                let child_layer = item.idx.layer - 1;
                let children: Vec<&WorkItem> = items[..i]
                    .iter()
                    .filter(|w| w.idx.layer == child_layer)
                    .collect();
                let tail = &children[children.len() - arity..];
                for (input, child) in item.inputs.iter().zip(tail.iter()) {
                    assert_eq!(*input, child.buf);
                }
                // output buffer never aliases an input
                assert!(!item.inputs.contains(&item.buf));
            }
        }
    }

    #[test]
    fn test_item_indices_are_dense_per_layer() {
        let items = collect(4096, 64, 8);
        let mut counts = vec![0u64; 3];
        for item in &items {
            let layer = item.idx.layer as usize;
            assert_eq!(item.idx.node, counts[layer]);
            counts[layer] += 1;
        }
        assert_eq!(counts, vec![64, 8, 1]);
    }

    #[test]
    fn test_buffer_reuse_is_bounded() {
        let mut scheduler = Scheduler::new(4096, 64, 8).unwrap();
        let mut work = WorkItem::default();
        while scheduler.next(&mut work) {}
        // live handles at any time: at most arity pending per level plus the
        // one in flight
        assert!(scheduler.next_handle <= 8 * 3 + 2);
    }

    #[test]
    fn test_reset_reproduces_sequence() {
        let mut scheduler = Scheduler::new(512, 64, 8).unwrap();
        let mut first = Vec::new();
        let mut work = WorkItem::default();
        loop {
            let more = scheduler.next(&mut work);
            first.push(work.clone());
            if !more {
                break;
            }
        }
        scheduler.reset();
        for expected in &first {
            scheduler.next(&mut work);
            assert_eq!(work.idx, expected.idx);
            assert_eq!(work.buf, expected.buf);
            assert_eq!(work.inputs, expected.inputs);
        }
    }
}
