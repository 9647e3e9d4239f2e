//! SDX Delta - delta delivery machinery
//!
//! This crate holds the pieces of delta delivery that do not depend on a
//! transport:
//! - Retry buffers parking pushes for unreachable peers
//! - Timestamp-diff anti-entropy over a simulated, faulty network
//!
//! ## Anti-entropy by timestamp diffing
//!
//! ```text
//! On local mutation m:
//!   ds = apply(m, X)        // deltas minted under the replica's actor
//!   push ds to peers        // best effort
//!
//! On sync with peer j:
//!   send ts(X) to j
//!   recv ts(Xj) from j
//!   send deltas_since(X, ts(Xj)) in bounded batches
//!
//! On receive delta d:
//!   X = merge(X, d)         // idempotent, order independent
//! ```
//!
//! # Example
//!
//! ```rust
//! use sdx_core::orset::OrSet;
//! use sdx_delta::anti_entropy::{AntiEntropyCluster, NetworkConfig};
//!
//! let mut cluster: AntiEntropyCluster<OrSet<i32>> =
//!     AntiEntropyCluster::new(3, NetworkConfig::default());
//! cluster.mutate(0, |set, actor| vec![set.add(actor, 42)]);
//! cluster.ring_sync_round();
//! cluster.ring_sync_round();
//!
//! assert!(cluster.is_converged());
//! assert!(cluster.replica(2).state().contains(&42));
//! ```

pub mod anti_entropy;
pub mod buffer;

pub use anti_entropy::{
    AntiEntropyCluster,
    NetworkConfig,
    NetworkSimulator,
    SyncMessage,
    SyncStats,
};

pub use buffer::{RetryBuffer, SeqNo, TaggedPush};
