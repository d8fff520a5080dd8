//! The shared cache-line region.
//!
//! A `Region` is a cache-line-aligned, zero-initialized run of `CacheLine`
//! records. Line 0 is the contended target; the remaining lines serve as the
//! stride-hiding and pointer-chase arena. All mutation during a run goes
//! through the per-word atomics, which compile to plain accesses at the
//! orderings the kernels use.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use rand::Rng;
use rand_pcg::Pcg64Mcg;
use tracing::warn;

use crate::arch;
use crate::config::{TouchPolicy, CACHE_LINE_BYTES, WORDS_PER_LINE};
use crate::error::{BenchError, Result};

/// One 64-byte line of 32-bit words.
#[repr(C, align(64))]
pub struct CacheLine {
    pub word: [AtomicU32; WORDS_PER_LINE],
}

impl CacheLine {
    /// The 8-bit slot used by TAS, aliasing the low byte of `word[0]`.
    #[inline(always)]
    pub fn byte0(&self) -> &AtomicU8 {
        unsafe { &*(self.word.as_ptr() as *const AtomicU8) }
    }
}

/// Allocation request for a region.
#[derive(Debug, Clone)]
pub struct RegionSpec {
    pub size_bytes: usize,
    /// Core whose NUMA node should own the pages; first-touch runs from a
    /// thread pinned there. `None` touches from the calling thread.
    pub touch_core: Option<usize>,
    pub lock_pages: bool,
    pub touch: TouchPolicy,
}

/// The allocated region. Dropping releases the page lock and the memory.
pub struct Region {
    ptr: NonNull<CacheLine>,
    lines: usize,
    layout: Layout,
    locked: bool,
}

// All access to line contents goes through atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn open(spec: &RegionSpec) -> Result<Region> {
        let lines = spec.size_bytes / CACHE_LINE_BYTES;
        if lines == 0 {
            return Err(BenchError::config("region smaller than one cache line"));
        }
        let layout = Layout::from_size_align(lines * CACHE_LINE_BYTES, CACHE_LINE_BYTES)
            .map_err(|e| BenchError::Alloc(e.to_string()))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut CacheLine)
            .ok_or_else(|| BenchError::Alloc(format!("{} bytes", layout.size())))?;

        let mut region = Region {
            ptr,
            lines,
            layout,
            locked: false,
        };
        region.lock_pages(spec.lock_pages);
        region.first_touch(spec);
        Ok(region)
    }

    /// Best-effort page lock; failure only costs determinism, not correctness.
    fn lock_pages(&mut self, requested: bool) {
        if !requested {
            return;
        }
        #[cfg(unix)]
        {
            let rc = unsafe { libc::mlock(self.ptr.as_ptr() as *const libc::c_void, self.layout.size()) };
            if rc == 0 {
                self.locked = true;
            } else {
                warn!(bytes = self.layout.size(), "mlock failed, continuing unlocked");
            }
        }
        #[cfg(not(unix))]
        warn!("page locking not supported on this platform");
    }

    /// Writes and flushes lines so the pages are owned by the desired node
    /// and absent from every cache before round 0.
    fn first_touch(&self, spec: &RegionSpec) {
        match spec.touch_core {
            Some(core) => std::thread::scope(|s| {
                s.spawn(|| {
                    crate::driver::pin_to_core(core);
                    self.touch_lines(spec.touch);
                });
            }),
            None => self.touch_lines(spec.touch),
        }
    }

    fn touch_lines(&self, policy: TouchPolicy) {
        let n = match policy {
            TouchPolicy::SingleLine => 1,
            TouchPolicy::FullRegion => self.lines,
        };
        for i in 0..n {
            let line = self.line(i);
            line.word[0].store(0, Ordering::Relaxed);
            arch::flush_cache_line(line as *const CacheLine);
        }
        arch::full_fence();
    }

    /// Number of cache lines.
    pub fn len(&self) -> usize {
        self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }

    /// The contended line.
    #[inline(always)]
    pub fn contended(&self) -> &CacheLine {
        self.line(0)
    }

    #[inline(always)]
    pub fn line(&self, idx: usize) -> &CacheLine {
        debug_assert!(idx < self.lines);
        unsafe { &*self.ptr.as_ptr().add(idx) }
    }

    /// Evicts one line from the cache hierarchy.
    #[inline(always)]
    pub fn flush_line(&self, idx: usize) {
        arch::flush_cache_line(self.line(idx) as *const CacheLine);
    }

    /// Links every line's `word[0]` into a single random permutation cycle
    /// starting (and ending) at line 0, for the pointer-chase test.
    pub fn build_chase_cycle(&self, seed: u64) {
        let n = self.lines;
        let mut order: Vec<u32> = (0..n as u32).collect();
        let mut rng = Pcg64Mcg::new(seed as u128);
        // Shuffle everything after the fixed entry point.
        for i in (2..n).rev() {
            let j = rng.gen_range(1..=i);
            order.swap(i, j);
        }
        for w in order.windows(2) {
            self.line(w[0] as usize).word[0].store(w[1], Ordering::Relaxed);
        }
        self.line(order[n - 1] as usize).word[0].store(order[0], Ordering::Relaxed);
        arch::full_fence();
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        #[cfg(unix)]
        if self.locked {
            unsafe {
                libc::munlock(self.ptr.as_ptr() as *const libc::c_void, self.layout.size());
            }
        }
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_lines(lines: usize) -> Region {
        Region::open(&RegionSpec {
            size_bytes: lines * CACHE_LINE_BYTES,
            touch_core: None,
            lock_pages: false,
            touch: TouchPolicy::FullRegion,
        })
        .unwrap()
    }

    #[test]
    fn lines_are_aligned_and_zeroed() {
        let region = open_lines(8);
        assert_eq!(region.len(), 8);
        for i in 0..8 {
            let line = region.line(i);
            assert_eq!(line as *const CacheLine as usize % CACHE_LINE_BYTES, 0);
            for w in &line.word {
                assert_eq!(w.load(Ordering::Relaxed), 0);
            }
        }
    }

    #[test]
    fn byte0_aliases_word0() {
        let region = open_lines(1);
        let line = region.contended();
        line.word[0].store(0x0000_00AB, Ordering::Relaxed);
        assert_eq!(line.byte0().load(Ordering::Relaxed), 0xAB);
        line.byte0().store(0xFF, Ordering::Relaxed);
        assert_eq!(line.word[0].load(Ordering::Relaxed) & 0xFF, 0xFF);
    }

    #[test]
    fn undersized_region_is_rejected() {
        let err = Region::open(&RegionSpec {
            size_bytes: CACHE_LINE_BYTES - 1,
            touch_core: None,
            lock_pages: false,
            touch: TouchPolicy::SingleLine,
        });
        assert!(err.is_err());
    }

    #[test]
    fn chase_cycle_visits_every_line_once() {
        let region = open_lines(64);
        region.build_chase_cycle(0x5eed);
        let mut seen = vec![false; 64];
        let mut cur = 0usize;
        for _ in 0..64 {
            assert!(!seen[cur], "line {cur} visited twice");
            seen[cur] = true;
            cur = region.line(cur).word[0].load(Ordering::Relaxed) as usize;
            assert!(cur < 64);
        }
        // Back at the entry point after exactly one full cycle.
        assert_eq!(cur, 0);
        assert!(seen.iter().all(|&v| v));
    }

    #[test]
    fn chase_cycle_on_tiny_regions() {
        for n in [1usize, 2, 3] {
            let region = open_lines(n);
            region.build_chase_cycle(7);
            let mut cur = 0usize;
            for _ in 0..n {
                cur = region.line(cur).word[0].load(Ordering::Relaxed) as usize;
            }
            assert_eq!(cur, 0);
        }
    }
}
