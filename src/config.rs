//! Run configuration: the test catalogue, fence policy table, and the
//! immutable `RunConfig` handed to every worker.

use serde::Serialize;

use crate::error::{BenchError, Result};
use crate::rankmap::RankMap;

/// Size of one cache line in bytes.
pub const CACHE_LINE_BYTES: usize = 64;
/// 32-bit words per cache line.
pub const WORDS_PER_LINE: usize = CACHE_LINE_BYTES / 4;

pub const DEFAULT_REPS: usize = 10_000;
pub const DEFAULT_CORES: usize = 2;
pub const DEFAULT_STRIDE: u32 = 8;
pub const DEFAULT_BACKOFF_MAX: u32 = 1024;
/// Default region size: 8 MiB of cache lines, enough headroom for the
/// moving-window tests at default stride and repetition count.
pub const DEFAULT_CACHE_LINES: usize = 131_072;

/// The operations a rank can be asked to measure, by their stable numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(usize)]
pub enum TestId {
    StoreOnModified = 0,
    StoreOnModifiedNoSync = 1,
    StoreOnExclusive = 2,
    StoreOnShared = 3,
    StoreOnOwnedMine = 4,
    StoreOnOwned = 5,
    StoreOnInvalid = 6,
    LoadFromModified = 7,
    LoadFromExclusive = 8,
    LoadFromShared = 9,
    LoadFromOwned = 10,
    LoadFromInvalid = 11,
    Cas = 12,
    Fai = 13,
    Tas = 14,
    Swap = 15,
    CasOnModified = 16,
    FaiOnModified = 17,
    TasOnModified = 18,
    SwapOnModified = 19,
    CasOnShared = 20,
    FaiOnShared = 21,
    TasOnShared = 22,
    SwapOnShared = 23,
    CasConcurrent = 24,
    FaiOnInvalid = 25,
    LoadFromL1 = 26,
    LoadFromMemSize = 27,
    Lfence = 28,
    Sfence = 29,
    Mfence = 30,
    Pause = 31,
    Nop = 32,
    Profiler = 33,
    CasUntilSuccess = 34,
}

impl TestId {
    pub const ALL: [TestId; 35] = [
        TestId::StoreOnModified,
        TestId::StoreOnModifiedNoSync,
        TestId::StoreOnExclusive,
        TestId::StoreOnShared,
        TestId::StoreOnOwnedMine,
        TestId::StoreOnOwned,
        TestId::StoreOnInvalid,
        TestId::LoadFromModified,
        TestId::LoadFromExclusive,
        TestId::LoadFromShared,
        TestId::LoadFromOwned,
        TestId::LoadFromInvalid,
        TestId::Cas,
        TestId::Fai,
        TestId::Tas,
        TestId::Swap,
        TestId::CasOnModified,
        TestId::FaiOnModified,
        TestId::TasOnModified,
        TestId::SwapOnModified,
        TestId::CasOnShared,
        TestId::FaiOnShared,
        TestId::TasOnShared,
        TestId::SwapOnShared,
        TestId::CasConcurrent,
        TestId::FaiOnInvalid,
        TestId::LoadFromL1,
        TestId::LoadFromMemSize,
        TestId::Lfence,
        TestId::Sfence,
        TestId::Mfence,
        TestId::Pause,
        TestId::Nop,
        TestId::Profiler,
        TestId::CasUntilSuccess,
    ];

    /// Maps a raw numeric id to a known test, if any. Unknown ids are kept
    /// raw so the worker can emit aligned no-op samples instead of failing.
    pub fn from_raw(raw: usize) -> Option<TestId> {
        TestId::ALL.get(raw).copied()
    }

    pub fn raw(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TestId::StoreOnModified => "STORE_ON_MODIFIED",
            TestId::StoreOnModifiedNoSync => "STORE_ON_MODIFIED_NO_SYNC",
            TestId::StoreOnExclusive => "STORE_ON_EXCLUSIVE",
            TestId::StoreOnShared => "STORE_ON_SHARED",
            TestId::StoreOnOwnedMine => "STORE_ON_OWNED_MINE",
            TestId::StoreOnOwned => "STORE_ON_OWNED",
            TestId::StoreOnInvalid => "STORE_ON_INVALID",
            TestId::LoadFromModified => "LOAD_FROM_MODIFIED",
            TestId::LoadFromExclusive => "LOAD_FROM_EXCLUSIVE",
            TestId::LoadFromShared => "LOAD_FROM_SHARED",
            TestId::LoadFromOwned => "LOAD_FROM_OWNED",
            TestId::LoadFromInvalid => "LOAD_FROM_INVALID",
            TestId::Cas => "CAS",
            TestId::Fai => "FAI",
            TestId::Tas => "TAS",
            TestId::Swap => "SWAP",
            TestId::CasOnModified => "CAS_ON_MODIFIED",
            TestId::FaiOnModified => "FAI_ON_MODIFIED",
            TestId::TasOnModified => "TAS_ON_MODIFIED",
            TestId::SwapOnModified => "SWAP_ON_MODIFIED",
            TestId::CasOnShared => "CAS_ON_SHARED",
            TestId::FaiOnShared => "FAI_ON_SHARED",
            TestId::TasOnShared => "TAS_ON_SHARED",
            TestId::SwapOnShared => "SWAP_ON_SHARED",
            TestId::CasConcurrent => "CAS_CONCURRENT",
            TestId::FaiOnInvalid => "FAI_ON_INVALID",
            TestId::LoadFromL1 => "LOAD_FROM_L1",
            TestId::LoadFromMemSize => "LOAD_FROM_MEM_SIZE",
            TestId::Lfence => "LFENCE",
            TestId::Sfence => "SFENCE",
            TestId::Mfence => "MFENCE",
            TestId::Pause => "PAUSE",
            TestId::Nop => "NOP",
            TestId::Profiler => "PROFILER",
            TestId::CasUntilSuccess => "CAS_UNTIL_SUCCESS",
        }
    }

    /// Tests whose non-flush runs advance the target window by `stride`
    /// lines each repetition so every repetition meets a fresh line.
    pub fn advances_window(self) -> bool {
        matches!(
            self,
            TestId::StoreOnExclusive
                | TestId::StoreOnInvalid
                | TestId::LoadFromExclusive
                | TestId::LoadFromShared
                | TestId::LoadFromInvalid
                | TestId::FaiOnInvalid
        )
    }

    /// Whether the test walks the whole region as a pointer-chase cycle.
    pub fn is_pointer_chase(self) -> bool {
        self == TestId::LoadFromMemSize
    }
}

/// Fence inserted after each measured load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadFence {
    None,
    Partial,
    Full,
}

/// Fence inserted after each measured store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreFence {
    None,
    Partial,
    Full,
    /// No fence; the store is repeated into the neighbouring line instead.
    DoubleWrite,
}

/// The `(load, store)` fence pair selected by `--fence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FencePolicy {
    pub load: LoadFence,
    pub store: StoreFence,
}

impl FencePolicy {
    /// Decodes a fence level 0..=9 into its `(load, store)` pair.
    pub fn from_level(level: u32) -> Result<FencePolicy> {
        use LoadFence as L;
        use StoreFence as S;
        let (load, store) = match level {
            0 => (L::None, S::None),
            1 => (L::Partial, S::Partial),
            2 => (L::Full, S::Full),
            3 => (L::Partial, S::None),
            4 => (L::None, S::Partial),
            5 => (L::Full, S::None),
            6 => (L::None, S::Full),
            7 => (L::Full, S::Partial),
            8 => (L::Partial, S::Full),
            9 => (L::None, S::DoubleWrite),
            _ => {
                return Err(BenchError::config(format!(
                    "fence level {level} out of range 0..=9"
                )))
            }
        };
        Ok(FencePolicy { load, store })
    }

    pub fn describe(&self) -> String {
        format!("{:?}/{:?}", self.load, self.store)
    }
}

/// How the freshly allocated region is first-touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPolicy {
    /// Touch and flush only the contended line.
    SingleLine,
    /// Touch and flush every line, forcing first-touch placement for the
    /// whole region.
    FullRegion,
}

/// Immutable configuration for one run, shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub reps: usize,
    /// Raw `--test` rows, if given.
    pub tests: Option<Vec<Vec<usize>>>,
    /// Raw `--cores_array` rows, if given.
    pub cores: Option<Vec<Vec<usize>>>,
    /// Raw `--backoff-array` rows, if given.
    pub backoff_rows: Option<Vec<Vec<usize>>>,
    /// Thread count used when `--cores_array` is absent.
    pub default_cores: usize,
    /// Test id used where `--test` does not supply one.
    pub default_test: usize,
    /// Core that primes the contended line each repetition; `None` selects
    /// classic barrier choreography.
    pub seed_core: Option<usize>,
    /// Stride-hiding factor, always a power of two.
    pub stride: u32,
    pub fence: FencePolicy,
    /// Region size in bytes.
    pub mem_size: usize,
    /// Flush the contended line before every repetition.
    pub flush: bool,
    /// Force atomic operations to succeed by preconditioning the word.
    pub ao_success: bool,
    /// Exponential backoff in the retry-until-success loop.
    pub backoff: bool,
    /// Cap on backoff pause iterations.
    pub backoff_max: u32,
    pub lock_pages: bool,
    pub numa: bool,
    pub verbose: bool,
    /// How many raw samples to print per rank under `--verbose`.
    pub print: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            reps: DEFAULT_REPS,
            tests: None,
            cores: None,
            backoff_rows: None,
            default_cores: DEFAULT_CORES,
            default_test: TestId::StoreOnModified.raw(),
            seed_core: None,
            stride: DEFAULT_STRIDE,
            fence: FencePolicy::from_level(0).unwrap(),
            mem_size: DEFAULT_CACHE_LINES * CACHE_LINE_BYTES,
            flush: false,
            ao_success: false,
            backoff: false,
            backoff_max: DEFAULT_BACKOFF_MAX,
            lock_pages: false,
            numa: true,
            verbose: false,
            print: 0,
        }
    }
}

impl RunConfig {
    /// Number of cache lines in the region.
    pub fn n_lines(&self) -> usize {
        self.mem_size / CACHE_LINE_BYTES
    }

    /// Checks the cross-field constraints that the rank map alone cannot.
    pub fn validate(&self, map: &RankMap) -> Result<()> {
        let lines = self.n_lines();
        if lines == 0 {
            return Err(BenchError::config("mem-size smaller than one cache line"));
        }
        if !self.stride.is_power_of_two() {
            return Err(BenchError::config(format!(
                "stride {} is not a power of two",
                self.stride
            )));
        }
        for info in map.ranks() {
            let Some(test) = TestId::from_raw(info.test) else {
                continue;
            };
            if !test.is_pointer_chase() && self.stride as usize >= lines {
                return Err(BenchError::config(format!(
                    "stride {} does not fit a {}-line region",
                    self.stride, lines
                )));
            }
            if test.advances_window() && !self.flush && self.reps * self.stride as usize > lines {
                return Err(BenchError::config(format!(
                    "{} without --flush needs reps*stride <= {} lines (got {}*{})",
                    test.name(),
                    lines,
                    self.reps,
                    self.stride
                )));
            }
        }
        Ok(())
    }
}

/// Rounds up to the next power of two, with a floor of 1.
pub fn pow2_roundup(x: u32) -> u32 {
    x.max(1).next_power_of_two()
}

/// Parses a byte size with an optional `K`/`M`/`G` suffix (and a trailing
/// `b`/`B` which is ignored), e.g. `4M`, `512K`, `64`.
pub fn parse_size(s: &str) -> Result<usize> {
    let bad = || BenchError::config(format!("invalid size: {s:?}"));
    let mut t = s.trim();
    if t.ends_with('b') || t.ends_with('B') {
        t = &t[..t.len() - 1];
    }
    let (digits, multi) = match t.chars().last() {
        Some('k') | Some('K') => (&t[..t.len() - 1], 1usize << 10),
        Some('m') | Some('M') => (&t[..t.len() - 1], 1usize << 20),
        Some('g') | Some('G') => (&t[..t.len() - 1], 1usize << 30),
        Some(c) if c.is_ascii_digit() => (t, 1),
        _ => return Err(bad()),
    };
    let n: usize = digits.trim().parse().map_err(|_| bad())?;
    n.checked_mul(multi).ok_or_else(bad)
}
