//! Cycle counting and memory-ordering primitives.
//!
//! Everything here compiles to at most a couple of instructions. The measured
//! kernels wrap these around the operation under test, so they must not do
//! hidden work of their own; serialization beyond the requested fence is left
//! to the caller's fence mode.

/// A raw cycle-counter reading.
pub type Ticks = u64;

/// Reads the monotonic cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn now() -> Ticks {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn now() -> Ticks {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as Ticks
}

/// Full memory fence (mfence).
#[inline(always)]
pub fn full_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_mfence()
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Store fence (sfence).
#[inline(always)]
pub fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_sfence()
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
}

/// Load fence (lfence).
#[inline(always)]
pub fn load_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_lfence()
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
}

/// One pause/yield hint, as used in spin loops and the PAUSE kernel.
#[inline(always)]
pub fn cpu_pause() {
    std::hint::spin_loop();
}

/// A single nop, for the NOP kernel.
#[inline(always)]
pub fn nop() {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    unsafe {
        std::arch::asm!("nop")
    }
}

/// Evicts the cache line holding `ptr` from the entire hierarchy.
///
/// On targets without an eviction instruction this degrades to a full fence;
/// the Invalid-state tests are then measuring fence cost only.
#[inline(always)]
pub fn flush_cache_line<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_clflush(ptr as *const u8)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}
