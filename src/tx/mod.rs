//! Transactions.
//!
//! ```text
//!   PESSIMISTIC:  get/put ──► NearLock (once per key) ──► ... ──► commit ──► store ──► TxFinish
//!   OPTIMISTIC:   get/put (local) ──────────────────────────► commit ──► NearLock (key order)
//!                                                               └─ validate read versions
//!                                                                  ──► store ──► TxFinish
//! ```
//!
//! The primary of each key stamps the commit version and replicates the
//! writes to its backups; the originating node writes through to the store
//! before any primary applies.

pub mod completed;
pub mod manager;
pub mod transaction;

pub use completed::CompletedVersions;
pub use manager::{TxInfo, TxManager};
pub use transaction::{group_lock_key, Transaction};
