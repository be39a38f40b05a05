//! Streaming GPU/CPU Merkle tree construction for the second phase of
//! proof-of-replication sealing ("PC2").
//!
//! Given `num_layers` pre-computed encoding layers on fast storage, the
//! engine builds, for every parallel sector and partition, the Poseidon
//! tree over per-node columns (tree-c) and the Poseidon tree over the
//! optionally data-encoded last layer (tree-r), writes both trees and the
//! sealed replica bytes in a bit-exact layout, and folds the partition
//! roots into a per-sector `p_aux` file.
//!
//! The core is a cooperative state machine over a pool of stream
//! resources: layer pages flow from a [`reader::LayerReader`] through
//! per-stream hashing services into a bounded pool of disk buffers drained
//! by a writer thread pool, while the CPU hashes each partition's tree top
//! overlapped with the next partition's stream work.

pub mod address;
pub mod cores;
pub mod engine;
pub mod hashing;
pub mod layout;
pub mod params;
pub mod pc2;
pub mod pool;
pub mod reader;
pub mod scheduler;
pub mod settings;
pub mod stream;
pub mod tree_top;
pub mod utils;
pub mod writer;

pub use crate::params::{CoreTopology, Pc2Config, SectorParams};
pub use crate::pc2::{cleanup, pc2, Pc2Output};
pub use crate::reader::{LayerReader, MmapLayerReader};
