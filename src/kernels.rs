//! The measured operation kernels.
//!
//! Every kernel follows the same contract: perform its operation against the
//! region with the run's fence policy, bracketing each access with a probe so
//! one cycle sample per repetition survives. Contended kernels hide their
//! access pattern behind a randomized stride walk: draw a line index in
//! `[0, stride)`, operate on it, and stop only when the draw lands on the
//! contended line. The surviving sample is that final access.

use std::sync::atomic::Ordering;

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg32;

use crate::arch;
use crate::config::{FencePolicy, LoadFence, StoreFence};
use crate::race::{RaceTracker, RetryStats};
use crate::region::Region;
use crate::samples::SampleStore;

/// Instruction timed by the fence kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    Load,
    Store,
    Full,
    Pause,
    Nop,
}

/// Per-worker kernel state: the shared structures plus everything the rank
/// owns privately (its probe, PRNG, counters and target window).
pub struct KernelCtx<'a> {
    pub region: &'a Region,
    pub race: &'a RaceTracker,
    pub probe: SampleStore,
    pub retry: RetryStats,
    /// Accumulated kernel return values; keeps loads observable.
    pub sum: u64,
    /// First line of the current target window.
    pub base: usize,
    rank: usize,
    stride_mask: u32,
    fence: FencePolicy,
    backoff: bool,
    backoff_cap: u32,
    rng: Pcg32,
}

impl<'a> KernelCtx<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        region: &'a Region,
        race: &'a RaceTracker,
        rank: usize,
        stride: u32,
        fence: FencePolicy,
        backoff: bool,
        backoff_cap: u32,
        reps: usize,
    ) -> KernelCtx<'a> {
        debug_assert!(stride.is_power_of_two());
        KernelCtx {
            region,
            race,
            probe: SampleStore::new(reps),
            retry: RetryStats::default(),
            sum: 0,
            base: 0,
            rank,
            stride_mask: stride - 1,
            fence,
            backoff,
            backoff_cap: backoff_cap.max(1),
            rng: Pcg32::seed_from_u64(0x9E37_79B9_7F4A_7C15 ^ rank as u64),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Consumes the context, releasing what the reporter needs.
    pub fn into_parts(self) -> (SampleStore, RetryStats, u64) {
        (self.probe, self.retry, self.sum)
    }

    /// One stride-hiding draw.
    #[inline(always)]
    fn draw(&mut self) -> usize {
        (self.rng.next_u32() & self.stride_mask) as usize
    }

    /// The stride-hiding walk shared by every contended kernel: feed `op`
    /// random draws until the contended draw (`cln == 0`) lands, claiming
    /// the repetition at that moment. The final `op` call is the one whose
    /// sample survives.
    #[inline(always)]
    fn stride_walk(&mut self, rep: usize, mut op: impl FnMut(&mut Self, usize)) {
        loop {
            let cln = self.draw();
            if cln == 0 {
                self.race.try_claim(self.rank, rep);
                op(self, 0);
                break;
            }
            op(self, cln);
        }
    }

    #[inline(always)]
    fn store_with_fence(&self, idx: usize, value: u32) {
        let region = self.region;
        region.line(idx).word[0].store(value, Ordering::Relaxed);
        match self.fence.store {
            StoreFence::None => {}
            StoreFence::Partial => arch::store_fence(),
            StoreFence::Full => arch::full_fence(),
            StoreFence::DoubleWrite => {
                let next = (idx + 1) % region.len();
                region.line(next).word[0].store(value, Ordering::Relaxed);
            }
        }
    }

    #[inline(always)]
    fn load_with_fence(&self, idx: usize) -> u32 {
        let v = self.region.line(idx).word[0].load(Ordering::Relaxed);
        match self.fence.load {
            LoadFence::None => {}
            LoadFence::Partial => arch::load_fence(),
            LoadFence::Full => arch::full_fence(),
        }
        v
    }

    /// Stride-hiding store; the surviving sample is the store that hit the
    /// contended line. `slot` selects the measurement point.
    pub fn store_contended(&mut self, rep: usize, slot: usize) {
        self.stride_walk(rep, |k, cln| {
            let t0 = k.probe.enter();
            k.store_with_fence(k.base + cln, cln as u32);
            k.probe.commit(slot, rep, t0);
        });
    }

    /// Single timed store to the contended line.
    pub fn store_once(&mut self, rep: usize) {
        self.race.try_claim(self.rank, rep);
        let t0 = self.probe.enter();
        self.store_with_fence(self.base, rep as u32);
        self.probe.commit(0, rep, t0);
    }

    /// Store without a probe, for roles that only generate traffic.
    pub fn store_once_quiet(&mut self, rep: usize) {
        self.race.try_claim(self.rank, rep);
        self.store_with_fence(self.base, rep as u32);
    }

    /// Stride-hiding load.
    pub fn load_contended(&mut self, rep: usize) -> u64 {
        let mut val = 0u32;
        self.stride_walk(rep, |k, cln| {
            let t0 = k.probe.enter();
            val = k.load_with_fence(k.base + cln);
            k.probe.commit(0, rep, t0);
        });
        arch::full_fence();
        val as u64
    }

    /// Single timed load from the contended line.
    pub fn load_once(&mut self, rep: usize) -> u64 {
        self.race.try_claim(self.rank, rep);
        let t0 = self.probe.enter();
        let val = self.load_with_fence(self.base);
        self.probe.commit(0, rep, t0);
        arch::full_fence();
        val as u64
    }

    /// Stride-hiding load without a probe, for Shared-state preconditioning.
    pub fn load_contended_quiet(&mut self, rep: usize) -> u64 {
        let mut val = 0u32;
        self.stride_walk(rep, |k, cln| {
            val = k.region.line(k.base + cln).word[0].load(Ordering::Relaxed);
        });
        arch::full_fence();
        val as u64
    }

    /// Timed cache-line eviction of the contended line.
    pub fn invalidate(&mut self, rep: usize) {
        self.race.try_claim(self.rank, rep);
        let t0 = self.probe.enter();
        self.region.flush_line(self.base);
        self.probe.commit(0, rep, t0);
        arch::full_fence();
    }

    /// Single-shot CAS: expected value alternates with the repetition parity.
    pub fn cas_once(&mut self, rep: usize) -> bool {
        let expected = (rep & 1) as u32;
        let w = &self.region.line(self.base).word[0];
        self.race.try_claim(self.rank, rep);
        let t0 = self.probe.enter();
        let ok = w
            .compare_exchange(expected, expected ^ 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.probe.commit(0, rep, t0);
        ok
    }

    /// Single-shot CAS without a probe.
    pub fn cas_once_quiet(&mut self, rep: usize) -> bool {
        let expected = (rep & 1) as u32;
        let w = &self.region.line(self.base).word[0];
        self.race.try_claim(self.rank, rep);
        w.compare_exchange(expected, expected ^ 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Stride-hiding CAS.
    pub fn cas_contended(&mut self, rep: usize) -> bool {
        let expected = (rep & 1) as u32;
        let mut ok = false;
        self.stride_walk(rep, |k, cln| {
            let w = &k.region.line(k.base + cln).word[0];
            let t0 = k.probe.enter();
            ok = w
                .compare_exchange(expected, expected ^ 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            k.probe.commit(0, rep, t0);
        });
        ok
    }

    /// Stride-hiding fetch-and-increment.
    pub fn fai(&mut self, rep: usize) -> u32 {
        let mut prev = 0;
        self.stride_walk(rep, |k, cln| {
            let w = &k.region.line(k.base + cln).word[0];
            let t0 = k.probe.enter();
            prev = w.fetch_add(1, Ordering::SeqCst);
            k.probe.commit(0, rep, t0);
            if cln == 0 {
                k.race.record_success(k.rank, rep);
            }
        });
        prev
    }

    /// Stride-hiding test-and-set on the 8-bit slot. Returns whether the slot
    /// was previously free. With `retry_until_free` the final draw repeats
    /// until it wins the slot, which the holder eventually resets.
    pub fn tas(&mut self, rep: usize, retry_until_free: bool) -> bool {
        let mut free = false;
        self.stride_walk(rep, |k, cln| {
            let b = k.region.line(k.base + cln).byte0();
            let t0 = k.probe.enter();
            let prev = b.swap(0xFF, Ordering::SeqCst);
            k.probe.commit(0, rep, t0);
            if cln == 0 {
                free = prev != 0xFF;
                while retry_until_free && !free {
                    arch::cpu_pause();
                    let t0 = k.probe.enter();
                    free = b.swap(0xFF, Ordering::SeqCst) != 0xFF;
                    k.probe.commit(0, rep, t0);
                }
                if free {
                    k.race.record_success(k.rank, rep);
                }
            }
        });
        free
    }

    /// Releases the TAS slot so the next repetition starts from a free line.
    pub fn tas_reset(&self) {
        arch::full_fence();
        self.region.line(self.base).word[0].store(0, Ordering::Relaxed);
    }

    /// Stride-hiding unconditional swap; stores the rank id.
    pub fn swap_word(&mut self, rep: usize) -> u32 {
        let mut prev = 0;
        self.stride_walk(rep, |k, cln| {
            let w = &k.region.line(k.base + cln).word[0];
            let t0 = k.probe.enter();
            prev = w.swap(k.rank as u32, Ordering::SeqCst);
            k.probe.commit(0, rep, t0);
            if cln == 0 {
                k.race.record_success(k.rank, rep);
            }
        });
        arch::full_fence();
        prev
    }

    /// Retry-until-success CAS: walk to the contended line, then flip its low
    /// bit until an attempt lands. Failures back off exponentially up to the
    /// rank's cap. The winner claim happens on the first successful attempt,
    /// not on first contact.
    pub fn cas_until_success(&mut self, rep: usize) {
        let expected = (rep & 1) as u32;
        loop {
            let cln = self.draw();
            if cln == 0 {
                break;
            }
            let w = &self.region.line(self.base + cln).word[0];
            let t0 = self.probe.enter();
            let _ = w.compare_exchange(expected, expected ^ 1, Ordering::SeqCst, Ordering::Relaxed);
            self.probe.commit(0, rep, t0);
        }

        let w = &self.region.line(self.base).word[0];
        let mut pause = 1u32;
        loop {
            let cur = w.load(Ordering::Relaxed);
            self.retry.attempts += 1;
            let t0 = self.probe.enter();
            let res = w.compare_exchange(cur, cur ^ 1, Ordering::SeqCst, Ordering::Relaxed);
            self.probe.commit(0, rep, t0);
            match res {
                Ok(_) => {
                    self.retry.successes += 1;
                    self.race.try_claim(self.rank, rep);
                    self.race.record_success(self.rank, rep);
                    return;
                }
                Err(_) => {
                    self.retry.failures += 1;
                    if self.backoff {
                        for _ in 0..pause {
                            arch::cpu_pause();
                        }
                        pause = (pause * 2).min(self.backoff_cap);
                    }
                }
            }
        }
    }

    /// Walks the whole permutation cycle; one sample covers every hop.
    pub fn pointer_chase(&mut self, rep: usize) -> u64 {
        let region = self.region;
        let hops = region.len();
        self.race.try_claim(self.rank, rep);
        let load = self.fence.load;
        let t0 = self.probe.enter();
        let mut cur = 0usize;
        for _ in 0..hops {
            cur = region.line(cur).word[0].load(Ordering::Relaxed) as usize;
            match load {
                LoadFence::None => {}
                LoadFence::Partial => arch::load_fence(),
                LoadFence::Full => arch::full_fence(),
            }
        }
        self.probe.commit(0, rep, t0);
        std::hint::black_box(cur as u64)
    }

    /// Times a single fence-class instruction.
    pub fn fence_op(&mut self, rep: usize, kind: FenceKind) {
        let t0 = self.probe.enter();
        match kind {
            FenceKind::Load => arch::load_fence(),
            FenceKind::Store => arch::store_fence(),
            FenceKind::Full => arch::full_fence(),
            FenceKind::Pause => arch::cpu_pause(),
            FenceKind::Nop => arch::nop(),
        }
        self.probe.commit(0, rep, t0);
    }

    /// Three back-to-back loads; the surviving sample is the L1 hit.
    pub fn load_l1(&mut self, rep: usize) -> u64 {
        let mut val = 0;
        for _ in 0..3 {
            val = self.load_once(rep);
        }
        val
    }

    /// Empty probe bracket, keeping sample counts aligned for unknown tests.
    pub fn noop_sample(&mut self, rep: usize) {
        let t0 = self.probe.enter();
        std::hint::black_box(());
        self.probe.commit(0, rep, t0);
    }

    /// Writes a preconditioning value into the contended word.
    pub fn preset_word(&self, value: u32) {
        self.region.line(self.base).word[0].store(value, Ordering::Relaxed);
        arch::full_fence();
    }
}
