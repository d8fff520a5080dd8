//! First-winner race tracking and per-rank retry accounting.
//!
//! One repetition is one race: the seeder publishes a common start tick and
//! releases every contender; the first rank to reach its success point claims
//! the repetition with a single compare-and-set. Latencies measured against
//! the published start share a common zero across ranks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use serde::Serialize;

use crate::arch;

/// Sentinel for a repetition nobody has claimed.
pub const UNCLAIMED: u32 = u32::MAX;

/// Shared tracker arrays, written with atomics during the run and read by the
/// reporter strictly after join.
pub struct RaceTracker {
    reps: usize,
    /// Start tick per repetition, published by the seeder before release.
    round_start: Box<[AtomicU64]>,
    /// Claiming rank per repetition, or `UNCLAIMED`.
    first_winner: Box<[AtomicU32]>,
    /// Cycles from release to success, indexed `rank * reps + rep`; zero
    /// means not recorded.
    common_latency: Box<[AtomicU64]>,
    /// Claims per rank. Foreign ranks never write another rank's cell, but
    /// the claim path makes the increment cross-thread visible.
    wins: Box<[CachePadded<AtomicU32>]>,
}

impl RaceTracker {
    pub fn new(ranks: usize, reps: usize) -> RaceTracker {
        RaceTracker {
            reps,
            round_start: (0..reps).map(|_| AtomicU64::new(0)).collect(),
            first_winner: (0..reps).map(|_| AtomicU32::new(UNCLAIMED)).collect(),
            common_latency: (0..ranks * reps).map(|_| AtomicU64::new(0)).collect(),
            wins: (0..ranks).map(|_| CachePadded::new(AtomicU32::new(0))).collect(),
        }
    }

    pub fn reps(&self) -> usize {
        self.reps
    }

    /// Seeder duty: mark the repetition unclaimed again before release.
    #[inline]
    pub fn reset_winner(&self, rep: usize) {
        if let Some(w) = self.first_winner.get(rep) {
            w.store(UNCLAIMED, Ordering::SeqCst);
        }
    }

    /// Seeder duty: publish the repetition's common start tick.
    #[inline]
    pub fn publish_round_start(&self, rep: usize) {
        if let Some(s) = self.round_start.get(rep) {
            s.store(arch::now(), Ordering::SeqCst);
        }
    }

    /// Claims the repetition for `rank` if nobody has. At most one rank per
    /// repetition succeeds; the winner's tally is bumped.
    #[inline]
    pub fn try_claim(&self, rank: usize, rep: usize) -> bool {
        let Some(w) = self.first_winner.get(rep) else {
            return false;
        };
        let won = w
            .compare_exchange(UNCLAIMED, rank as u32, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        if won {
            self.wins[rank].fetch_add(1, Ordering::Relaxed);
        }
        won
    }

    /// Records `rank`'s release-to-success latency for `rep`, once. A no-op
    /// before the seeder has published the round start (classic mode).
    #[inline]
    pub fn record_success(&self, rank: usize, rep: usize) {
        if rep >= self.reps {
            return;
        }
        let start = self.round_start[rep].load(Ordering::SeqCst);
        if start == 0 {
            return;
        }
        let cell = &self.common_latency[rank * self.reps + rep];
        if cell.load(Ordering::Relaxed) == 0 {
            let lat = arch::now().wrapping_sub(start).max(1);
            cell.store(lat, Ordering::Relaxed);
        }
    }

    pub fn winner(&self, rep: usize) -> Option<u32> {
        let w = self.first_winner[rep].load(Ordering::Relaxed);
        (w != UNCLAIMED).then_some(w)
    }

    pub fn wins(&self, rank: usize) -> u32 {
        self.wins[rank].load(Ordering::Relaxed)
    }

    pub fn latency(&self, rank: usize, rep: usize) -> Option<u64> {
        let v = self.common_latency[rank * self.reps + rep].load(Ordering::Relaxed);
        (v != 0).then_some(v)
    }

    /// Repetitions whose race closed.
    pub fn claimed_reps(&self) -> usize {
        (0..self.reps).filter(|&r| self.winner(r).is_some()).count()
    }
}

/// Attempt/success/failure counters for the retry-until-success kernel.
/// Owned and updated by a single rank, read by the reporter after join.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

impl RetryStats {
    pub fn is_empty(&self) -> bool {
        self.attempts == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_one_claim_per_rep() {
        let tracker = Arc::new(RaceTracker::new(4, 32));
        std::thread::scope(|s| {
            for rank in 0..4 {
                let tracker = Arc::clone(&tracker);
                s.spawn(move || {
                    for rep in 0..32 {
                        tracker.try_claim(rank, rep);
                    }
                });
            }
        });
        let total: u32 = (0..4).map(|r| tracker.wins(r)).sum();
        assert_eq!(total, 32);
        for rep in 0..32 {
            assert!(tracker.winner(rep).is_some());
        }
    }

    #[test]
    fn wins_match_claimed_reps() {
        let tracker = RaceTracker::new(2, 10);
        for rep in 0..7 {
            assert!(tracker.try_claim(rep % 2, rep));
            assert!(!tracker.try_claim((rep + 1) % 2, rep));
        }
        assert_eq!(tracker.claimed_reps(), 7);
        assert_eq!(tracker.wins(0) + tracker.wins(1), 7);
    }

    #[test]
    fn reset_reopens_a_rep() {
        let tracker = RaceTracker::new(2, 1);
        assert!(tracker.try_claim(0, 0));
        tracker.reset_winner(0);
        assert!(tracker.winner(0).is_none());
        assert!(tracker.try_claim(1, 0));
        assert_eq!(tracker.winner(0), Some(1));
    }

    #[test]
    fn latency_needs_a_published_start() {
        let tracker = RaceTracker::new(1, 2);
        tracker.record_success(0, 0);
        assert_eq!(tracker.latency(0, 0), None);

        tracker.publish_round_start(1);
        tracker.record_success(0, 1);
        let first = tracker.latency(0, 1).expect("recorded");
        assert!(first >= 1);
        // Idempotent: a second success does not overwrite.
        tracker.record_success(0, 1);
        assert_eq!(tracker.latency(0, 1), Some(first));
    }

    #[test]
    fn out_of_range_reps_are_ignored() {
        let tracker = RaceTracker::new(1, 1);
        assert!(!tracker.try_claim(0, 5));
        tracker.record_success(0, 5);
        tracker.reset_winner(5);
        tracker.publish_round_start(5);
        assert_eq!(tracker.wins(0), 0);
    }

    #[test]
    fn retry_stats_accounting() {
        let mut stats = RetryStats::default();
        assert!(stats.is_empty());
        stats.attempts += 3;
        stats.successes += 1;
        stats.failures += 2;
        assert_eq!(stats.successes + stats.failures, stats.attempts);
    }
}
