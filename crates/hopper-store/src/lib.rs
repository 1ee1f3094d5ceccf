//! Content-addressed artifact storage for Hopper.
//!
//! - [`FsArtifactStore`]: on-disk store with reference counting and LRU
//!   eviction, used both by the broker and as each worker's local cache
//! - [`layer`]: the layer archive format that job root filesystems are
//!   assembled from

pub mod error;
pub mod fs;
pub mod index;
pub mod layer;

pub use error::{StoreError, StoreResult};
pub use fs::{FsArtifactStore, PendingArtifact};
pub use index::StoreIndex;
pub use layer::{LayerBuilder, LayerEntry, LayerEntryKind, LayerReader};
