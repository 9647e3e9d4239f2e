// File: `crates/sdx-core/src/lib.rs`
pub mod causal;
pub mod delta;
pub mod lattice;
pub mod lwwreg;
pub mod ormap;
pub mod orset;
mod serde_pairs;

pub use causal::{ActorId, CausalContext, Dot};
pub use delta::{next_batch, CausalTimestamp, DeltaCrdt, Element, MergeResult, Operable};
pub use lwwreg::{LwwConflict, LwwDelta, LwwOperation, LwwOutcome, LwwRegistry, LwwStamp, LwwTimestamp};
pub use ormap::{MapTimestamp, OrMap, OrMapDelta, OrMapOperation, OrMapOutput};
pub use orset::{OrSet, OrSetDelta, OrSetOperation};
