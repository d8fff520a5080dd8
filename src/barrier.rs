//! The barrier bank: a fixed set of independently reconfigurable
//! synchronization points.
//!
//! Operator-chosen groupings mean no single barrier participant count fits
//! every call site, so each slot carries its own count and can be retargeted
//! before the run starts. Slots are sense-reversing spin barriers padded to
//! their own cache lines; the round protocol never leaves a thread parked in
//! a slot across repetitions, so spinning is the right trade.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::utils::CachePadded;

use crate::arch;
use crate::error::{BenchError, Result};

/// Number of slots in the bank.
pub const NUM_BARRIERS: usize = 32;

/// Round entry, shared by every rank.
pub const B0: usize = 0;
pub const B1: usize = 1;
pub const B2: usize = 2;
/// Round exit, shared by every rank.
pub const B3: usize = 3;
/// The seeder's release point. Widened to `T + 1` when an auxiliary seeder
/// participates.
pub const B4: usize = 4;
/// Post-run rendezvous.
pub const B10: usize = 10;

/// First slot of the per-group block.
pub const PER_GROUP_BASE: usize = 16;
/// Slots reserved per group (its B1 and B2).
pub const PER_GROUP_SLOTS: usize = 2;

/// Slot used by group `group` for its `k`-th intra-group barrier.
pub fn group_slot(group: usize, k: usize) -> usize {
    PER_GROUP_BASE + group * PER_GROUP_SLOTS + k
}

/// Largest group count the per-group block can address.
pub fn max_groups() -> usize {
    (NUM_BARRIERS - PER_GROUP_BASE) / PER_GROUP_SLOTS
}

struct Slot {
    participants: AtomicU32,
    arrived: AtomicU32,
    generation: AtomicU32,
}

/// A bank of `NUM_BARRIERS` reconfigurable barriers.
pub struct BarrierBank {
    slots: Box<[CachePadded<Slot>]>,
}

impl BarrierBank {
    /// Creates the bank with every slot expecting `num_procs` participants.
    pub fn new(num_procs: u32) -> BarrierBank {
        let n = num_procs.max(1);
        let slots = (0..NUM_BARRIERS)
            .map(|_| {
                CachePadded::new(Slot {
                    participants: AtomicU32::new(n),
                    arrived: AtomicU32::new(0),
                    generation: AtomicU32::new(0),
                })
            })
            .collect();
        BarrierBank { slots }
    }

    /// Retargets `slot` to expect `n` callers. Counts of zero clamp to one.
    ///
    /// Fails if the slot is out of range or a thread is currently waiting on
    /// it; reconfiguring a live barrier would strand the waiters.
    pub fn set_participants(&self, slot: usize, n: u32) -> Result<()> {
        let s = self
            .slots
            .get(slot)
            .ok_or_else(|| BenchError::config(format!("barrier slot {slot} out of range")))?;
        if s.arrived.load(Ordering::Acquire) != 0 {
            return Err(BenchError::config(format!(
                "barrier slot {slot} reconfigured while threads wait on it"
            )));
        }
        s.participants.store(n.max(1), Ordering::Release);
        Ok(())
    }

    pub fn participants(&self, slot: usize) -> u32 {
        self.slots[slot].participants.load(Ordering::Relaxed)
    }

    /// Blocks until every configured participant has arrived at `slot`.
    ///
    /// A full fence is issued on entry, so writes before the barrier are
    /// visible to every rank after it. Out-of-range slots are ignored.
    #[inline]
    pub fn wait(&self, slot: usize) {
        arch::full_fence();
        let Some(s) = self.slots.get(slot) else {
            debug_assert!(false, "barrier slot {slot} out of range");
            return;
        };
        let gen = s.generation.load(Ordering::Acquire);
        let arrived = s.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == s.participants.load(Ordering::Relaxed) {
            // Last arrival resets the count for the next generation before
            // releasing the waiters.
            s.arrived.store(0, Ordering::Relaxed);
            s.generation.fetch_add(1, Ordering::Release);
        } else {
            // Spin first for release latency, fall back to yielding when the
            // machine is oversubscribed.
            let mut spins = 0u32;
            while s.generation.load(Ordering::Acquire) == gen {
                spins = spins.wrapping_add(1);
                if spins < 1 << 14 {
                    arch::cpu_pause();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn group_slots_do_not_collide_with_named_slots() {
        for g in 0..max_groups() {
            for k in 0..PER_GROUP_SLOTS {
                let slot = group_slot(g, k);
                assert!(slot >= PER_GROUP_BASE && slot < NUM_BARRIERS);
                assert!(![B0, B1, B2, B3, B4, B10].contains(&slot));
            }
        }
        assert!(max_groups() >= 8);
    }

    #[test]
    fn n_participants_all_return() {
        let n = 4;
        let bank = Arc::new(BarrierBank::new(n));
        let released = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let bank = Arc::clone(&bank);
                let released = Arc::clone(&released);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        bank.wait(B0);
                    }
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), n as usize);
    }

    #[test]
    fn missing_participant_blocks_the_rest() {
        let bank = Arc::new(BarrierBank::new(3));
        let through = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let bank = Arc::clone(&bank);
                let through = Arc::clone(&through);
                std::thread::spawn(move || {
                    bank.wait(B3);
                    through.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(through.load(Ordering::SeqCst), 0);
        // Third arrival releases everyone.
        bank.wait(B3);
        for h in waiters {
            h.join().unwrap();
        }
        assert_eq!(through.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reconfiguration_applies_to_the_next_use() {
        let bank = BarrierBank::new(8);
        bank.set_participants(B4, 1).unwrap();
        assert_eq!(bank.participants(B4), 1);
        // A single participant passes straight through.
        bank.wait(B4);
        bank.wait(B4);
    }

    #[test]
    fn zero_participants_clamps_to_one() {
        let bank = BarrierBank::new(2);
        bank.set_participants(B10, 0).unwrap();
        assert_eq!(bank.participants(B10), 1);
    }

    #[test]
    fn reconfiguring_a_live_slot_fails() {
        let bank = Arc::new(BarrierBank::new(2));
        let waiter = {
            let bank = Arc::clone(&bank);
            std::thread::spawn(move || bank.wait(B2))
        };
        // Wait until the waiter has arrived.
        while bank.slots[B2].arrived.load(Ordering::Acquire) == 0 {
            std::hint::spin_loop();
        }
        assert!(bank.set_participants(B2, 5).is_err());
        bank.wait(B2);
        waiter.join().unwrap();
        // Idle again: reconfiguration succeeds.
        bank.set_participants(B2, 5).unwrap();
    }

    #[test]
    fn out_of_range_reconfiguration_fails() {
        let bank = BarrierBank::new(1);
        assert!(bank.set_participants(NUM_BARRIERS, 1).is_err());
    }
}
