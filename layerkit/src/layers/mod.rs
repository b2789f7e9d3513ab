//! Layer primitives: digests, deterministic archives, snapshots and the blob store.

mod archive;
mod digest;
mod snapshot;
mod store;

pub use archive::{
    EntryKind, LayerDescriptor, LayerWriter, OPAQUE_WHITEOUT, PendingLayer, WHITEOUT_PREFIX,
    extract_layer, extract_layers, list_entries, normalize_mode, safe_join,
};
pub use digest::{Digest, HashingWriter};
pub use snapshot::{Change, Node, NodeKind, Snapshot};
pub use store::BlobStore;
