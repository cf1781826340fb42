//! Per-entry FIFO queue of lock candidates.

use super::candidate::MvccCandidate;
use crate::types::NodeId;
use crate::version::CacheVersion;
use std::collections::VecDeque;

/// Result of adding a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The candidate owns the lock.
    Acquired,
    /// The owner already held the lock; the acquisition was stacked.
    Reentered,
    /// The candidate waits behind others.
    Queued,
}

/// Result of releasing a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// The released candidate.
    pub candidate: MvccCandidate,
    /// Whether the candidate left the queue (false if a reentry was popped).
    pub removed: bool,
    /// Candidate promoted to owner by this release.
    pub new_owner: Option<CacheVersion>,
}

/// Ordered lock candidates of one entry. Only the head may own the lock.
#[derive(Debug, Clone, Default)]
pub struct CandidateQueue {
    candidates: VecDeque<MvccCandidate>,
}

impl CandidateQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a candidate, stacking it on an existing one from the same owner.
    pub fn add(&mut self, mut candidate: MvccCandidate) -> LockOutcome {
        if let Some(existing) = self
            .candidates
            .iter_mut()
            .find(|c| c.is_reentry_of(&candidate))
        {
            existing.add_reentry();
            return if existing.owner() {
                LockOutcome::Reentered
            } else {
                LockOutcome::Queued
            };
        }

        candidate.set_owner(false);
        candidate.set_used(false);
        candidate.set_removed(false);
        let version = candidate.version();
        self.candidates.push_back(candidate);
        self.reassign();

        if self.is_owned_by(version) {
            LockOutcome::Acquired
        } else {
            LockOutcome::Queued
        }
    }

    /// Mark a candidate ready; returns the new owner if that unblocked it.
    pub fn set_ready(&mut self, version: CacheVersion) -> Option<CacheVersion> {
        let candidate = self.candidates.iter_mut().find(|c| c.version() == version)?;
        candidate.set_ready(true);
        self.reassign()
    }

    /// Release one acquisition of the candidate with `version`.
    pub fn release(&mut self, version: CacheVersion) -> Option<Released> {
        let idx = self.candidates.iter().position(|c| c.version() == version)?;
        self.release_at(idx)
    }

    /// Release one acquisition of an explicit lock held by `owner_id` on `node_id`.
    pub fn release_owner(&mut self, node_id: NodeId, owner_id: u64) -> Option<Released> {
        let idx = self
            .candidates
            .iter()
            .position(|c| !c.tx() && c.node_id() == node_id && c.owner_id() == owner_id)?;
        self.release_at(idx)
    }

    /// Remove the candidate with `version` regardless of stacked reentries.
    pub fn remove(&mut self, version: CacheVersion) -> Option<Released> {
        let idx = self.candidates.iter().position(|c| c.version() == version)?;
        self.remove_at(idx)
    }

    fn release_at(&mut self, idx: usize) -> Option<Released> {
        let candidate = self.candidates.get_mut(idx)?;
        if candidate.pop_reentry() {
            return Some(Released {
                candidate: candidate.clone(),
                removed: false,
                new_owner: None,
            });
        }
        self.remove_at(idx)
    }

    fn remove_at(&mut self, idx: usize) -> Option<Released> {
        let mut candidate = self.candidates.remove(idx)?;
        candidate.set_owner(false);
        candidate.set_removed(true);
        let new_owner = self.reassign();
        Some(Released {
            candidate,
            removed: true,
            new_owner,
        })
    }

    /// Grant ownership to the head if it is ready and not yet owner.
    fn reassign(&mut self) -> Option<CacheVersion> {
        let head = self.candidates.front_mut()?;
        if head.owner() || !head.ready() {
            return None;
        }
        head.set_owner(true);
        head.set_used(true);
        Some(head.version())
    }

    /// Current owner.
    pub fn owner(&self) -> Option<&MvccCandidate> {
        self.candidates.front().filter(|c| c.owner())
    }

    /// Whether the candidate with `version` owns the lock.
    pub fn is_owned_by(&self, version: CacheVersion) -> bool {
        self.owner().is_some_and(|c| c.version() == version)
    }

    /// Whether an explicit lock of `owner_id` on `node_id` owns the lock.
    pub fn is_owned_by_owner(&self, node_id: NodeId, owner_id: u64) -> bool {
        self.owner()
            .is_some_and(|c| !c.tx() && c.node_id() == node_id && c.owner_id() == owner_id)
    }

    /// Whether someone owns the lock.
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Whether an owner other than `version` holds the lock.
    pub fn is_locked_by_other(&self, version: CacheVersion) -> bool {
        self.owner().is_some_and(|c| c.version() != version)
    }

    /// Look up a candidate.
    pub fn candidate(&self, version: CacheVersion) -> Option<&MvccCandidate> {
        self.candidates.iter().find(|c| c.version() == version)
    }

    /// Candidates in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &MvccCandidate> {
        self.candidates.iter()
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::super::candidate::CandidateFlags;
    use super::*;

    fn v(order: u64) -> CacheVersion {
        CacheVersion::new(1, order, 1, 0)
    }

    fn tx(order: u64) -> MvccCandidate {
        MvccCandidate::new(v(order), 1, order, 1, CandidateFlags::TX | CandidateFlags::READY)
    }

    #[test]
    fn test_first_candidate_owns() {
        let mut q = CandidateQueue::new();
        assert_eq!(q.add(tx(1)), LockOutcome::Acquired);
        let owner = q.owner().unwrap();
        assert!(owner.owner() && owner.used());
    }

    #[test]
    fn test_fifo_promotion() {
        let mut q = CandidateQueue::new();
        q.add(tx(1));
        assert_eq!(q.add(tx(2)), LockOutcome::Queued);
        assert_eq!(q.add(tx(3)), LockOutcome::Queued);

        let released = q.release(v(1)).unwrap();
        assert!(released.removed);
        assert!(released.candidate.removed());
        assert_eq!(released.new_owner, Some(v(2)));
        assert!(q.is_owned_by(v(2)));

        // Releasing a waiter does not change the owner.
        let released = q.release(v(3)).unwrap();
        assert_eq!(released.new_owner, None);
        assert!(q.is_owned_by(v(2)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_at_most_one_owner() {
        let mut q = CandidateQueue::new();
        for i in 1..=10 {
            q.add(tx(i));
        }
        for i in 1..=10 {
            assert_eq!(q.iter().filter(|c| c.owner()).count(), 1);
            q.release(v(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_reentry_stacks_without_reordering() {
        let mut q = CandidateQueue::new();
        q.add(tx(1));
        q.add(tx(2));
        assert_eq!(q.add(tx(1)), LockOutcome::Reentered);
        assert_eq!(q.len(), 2);

        // First release pops the reentry only.
        let released = q.release(v(1)).unwrap();
        assert!(!released.removed);
        assert!(q.is_owned_by(v(1)));

        let released = q.release(v(1)).unwrap();
        assert!(released.removed);
        assert!(q.is_owned_by(v(2)));
    }

    #[test]
    fn test_reentry_of_waiting_candidate_keeps_waiting() {
        let mut q = CandidateQueue::new();
        q.add(tx(1));
        q.add(tx(2));
        assert_eq!(q.add(tx(2)), LockOutcome::Queued);
        assert_eq!(q.candidate(v(2)).unwrap().reentry_count(), 1);
    }

    #[test]
    fn test_explicit_lock_reentry_by_owner() {
        let mut q = CandidateQueue::new();
        let first = MvccCandidate::new(v(1), 1, 42, 1, CandidateFlags::READY);
        let again = MvccCandidate::new(v(2), 1, 42, 1, CandidateFlags::READY);
        assert_eq!(q.add(first), LockOutcome::Acquired);
        assert_eq!(q.add(again), LockOutcome::Reentered);
        assert!(q.is_owned_by_owner(1, 42));

        assert!(!q.release_owner(1, 42).unwrap().removed);
        assert!(q.release_owner(1, 42).unwrap().removed);
        assert!(q.release_owner(1, 42).is_none());
        assert!(!q.is_locked());
    }

    #[test]
    fn test_head_not_ready_blocks_queue() {
        let mut q = CandidateQueue::new();
        let waiting = MvccCandidate::new(v(1), 1, 1, 1, CandidateFlags::TX);
        assert_eq!(q.add(waiting), LockOutcome::Queued);
        assert_eq!(q.add(tx(2)), LockOutcome::Queued);
        assert!(!q.is_locked());

        assert_eq!(q.set_ready(v(1)), Some(v(1)));
        assert!(q.is_owned_by(v(1)));
        assert!(q.is_locked_by_other(v(2)));
    }

    #[test]
    fn test_remove_ignores_reentries() {
        let mut q = CandidateQueue::new();
        q.add(tx(1));
        q.add(tx(1));
        q.add(tx(1));
        let released = q.remove(v(1)).unwrap();
        assert!(released.removed);
        assert!(q.is_empty());
    }
}
