//! MVCC locking: candidates, per-entry queues and the node-wide lock registry.
//!
//! ```text
//!   lock request ──► CandidateQueue (per entry, FIFO) ──► OWNER at head
//!        │                                                   │ release
//!        └──────► MvccManager.add_lock            MvccManager.remove_lock
//!                        │                                   │
//!                        └──── finish_locks / finish_keys ◄──┘
//! ```

pub mod candidate;
pub mod manager;
pub mod queue;

pub use candidate::{CandidateFlags, MvccCandidate};
pub use manager::MvccManager;
pub use queue::{CandidateQueue, LockOutcome, Released};
