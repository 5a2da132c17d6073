//! Replicated state for the Spiron cluster.
//!
//! Every node keeps one [`ReplicatedRecord`] per candidate id and reconciles
//! it with its peers by gossip. There is no leader and no quorum round: the
//! merge is a join on a semilattice, so any two replicas that have seen the
//! same set of updates hold the same record, whatever order they saw them in.
//!
//! # Merge Rules
//!
//! - **State**: last-writer-wins register ([`ReplicatedVector`]). Higher
//!   timestamp wins; equal timestamps go to the lexicographically greater
//!   (or equal) replica id.
//! - **Approvals**: grow-only counter ([`ApprovalCounter`]). Per-replica max,
//!   summed for the cumulative total.
//!
//! # Finality
//!
//! Because the approval total never decreases under merge, every replica
//! eventually crosses the same threshold on its own. [`FinalityDetector`]
//! latches the record the first time that happens and never lets it move.

mod counter;
mod finality;
mod lww;
mod record;

pub use counter::ApprovalCounter;
pub use finality::FinalityDetector;
pub use lww::{merge_lww, ReplicatedVector};
pub use record::{merge, merge_optional, ReplicatedRecord};
