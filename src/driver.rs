//! The round driver: spawns one pinned worker per rank (plus at most one
//! auxiliary seeder), runs the synchronized repetition loop, and hands the
//! per-rank results to the reporter.
//!
//! Two execution shapes exist. In seed mode a designated core primes the
//! contended line and publishes the round-start tick each repetition, then
//! releases every contender at once from barrier 4. In classic mode the
//! coherence precondition is built purely from the per-group barrier
//! choreography.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::arch;
use crate::barrier::{self, group_slot, BarrierBank, B0, B10, B3, B4};
use crate::choreo::{self, Action, Preset};
use crate::config::{RunConfig, TestId, TouchPolicy};
use crate::error::{BenchError, Result};
use crate::kernels::{FenceKind, KernelCtx};
use crate::race::{RaceTracker, RetryStats};
use crate::rankmap::RankMap;
use crate::region::{Region, RegionSpec};
use crate::report::RunReport;
use crate::samples::SampleStore;
use crate::topology::{SocketPolicy, Topology};

/// Pins the calling thread to a hardware thread. Best-effort: a failed pin
/// costs timing stability, not correctness.
pub fn pin_to_core(core: usize) {
    if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
        warn!(core, "could not pin thread; timings may wander");
    }
}

fn current_cpu() -> i32 {
    #[cfg(target_os = "linux")]
    return unsafe { libc::sched_getcpu() };
    #[cfg(not(target_os = "linux"))]
    return -1;
}

/// How the contended line gets primed each repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeederShape {
    /// No seed core: classic barrier choreography.
    None,
    /// The seed core is one of the ranks; it primes inline.
    InBand(usize),
    /// The seed core sits outside the rank set; a dedicated non-measuring
    /// thread primes and joins barrier 4 as the extra participant.
    Auxiliary(usize),
}

/// What one worker brings home.
pub struct WorkerOutput {
    pub rank: usize,
    pub probe: SampleStore,
    pub retry: RetryStats,
    pub sum: u64,
}

/// The run controller.
pub struct Engine;

impl Engine {
    /// Runs one full benchmark and returns the assembled report.
    pub fn run(cfg: RunConfig) -> Result<RunReport> {
        let map = RankMap::from_config(&cfg)?;
        cfg.validate(&map)?;
        if map.num_groups() > barrier::max_groups() {
            return Err(BenchError::config(format!(
                "{} groups exceed the {} per-group barrier slots",
                map.num_groups(),
                barrier::max_groups()
            )));
        }

        let t = map.len();
        let bank = BarrierBank::new(t as u32);
        for g in 0..map.num_groups() {
            for k in 0..barrier::PER_GROUP_SLOTS {
                bank.set_participants(group_slot(g, k), map.group_size(g) as u32)?;
            }
            debug!(group = g, size = map.group_size(g), "group barriers configured");
        }

        let seeder = match cfg.seed_core {
            None => SeederShape::None,
            Some(core) => match map.rank_of_core(core) {
                Some(rank) => SeederShape::InBand(rank),
                None => SeederShape::Auxiliary(core),
            },
        };
        if let SeederShape::Auxiliary(core) = seeder {
            bank.set_participants(B4, t as u32 + 1)?;
            debug!(core, "auxiliary seeder joins barrier 4");
        }

        let touch_core = if cfg.numa { cfg.seed_core } else { None };
        if let Some(core) = touch_core {
            let topo = Topology::detect();
            debug!(core, node = topo.node_of(core), "first-touch placement");
        }
        let region = Region::open(&RegionSpec {
            size_bytes: cfg.mem_size,
            touch_core,
            lock_pages: cfg.lock_pages,
            touch: TouchPolicy::FullRegion,
        })?;
        if map
            .ranks()
            .any(|r| TestId::from_raw(r.test).is_some_and(|t| t.is_pointer_chase()))
        {
            region.build_chase_cycle(0xB9E4_E2F1_F1E2_E3D5);
        }

        let race = RaceTracker::new(t, cfg.reps);

        info!(
            threads = t,
            reps = cfg.reps,
            stride = cfg.stride,
            fence = %cfg.fence.describe(),
            lines = cfg.n_lines(),
            "starting run"
        );

        let outputs = std::thread::scope(|s| -> Result<Vec<WorkerOutput>> {
            let cfg = &cfg;
            let map = &map;
            let region = &region;
            let bank = &bank;
            let race = &race;

            let aux = match seeder {
                SeederShape::Auxiliary(core) => Some(
                    std::thread::Builder::new()
                        .name("seeder".into())
                        .spawn_scoped(s, move || aux_seeder_loop(core, cfg, region, bank, race))
                        .map_err(|e| BenchError::System(format!("spawn seeder: {e}")))?,
                ),
                _ => None,
            };

            let mut handles = Vec::with_capacity(t.saturating_sub(1));
            for rank in 1..t {
                let handle = std::thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(s, move || {
                        worker_loop(rank, cfg, map, region, bank, race, seeder)
                    })
                    .map_err(|e| BenchError::System(format!("spawn rank {rank}: {e}")))?;
                handles.push(handle);
            }

            // Rank 0 runs on the controller thread, like its peers pinned to
            // its configured core.
            let mut outputs = vec![worker_loop(0, cfg, map, region, bank, race, seeder)];
            for h in handles {
                outputs.push(
                    h.join()
                        .map_err(|_| BenchError::System("worker panicked".into()))?,
                );
            }
            if let Some(h) = aux {
                h.join()
                    .map_err(|_| BenchError::System("seeder panicked".into()))?;
            }
            outputs.sort_by_key(|o| o.rank);
            Ok(outputs)
        })?;

        let final_word = region.contended().word[0].load(Ordering::Relaxed);
        Ok(RunReport::assemble(
            &cfg,
            &map,
            &race,
            outputs,
            &SocketPolicy::default(),
            final_word,
        ))
    }
}

/// Seeder duty for one repetition, in publication order: prime the word,
/// reopen the race, publish the start tick, each step fenced.
#[inline]
fn seed_round(rep: usize, region: &Region, race: &RaceTracker) {
    // The primed value alternates so each repetition's CAS expected value
    // differs from the previous outcome.
    region
        .contended()
        .word[0]
        .store((rep & 1) as u32, Ordering::Relaxed);
    arch::full_fence();
    race.reset_winner(rep);
    arch::full_fence();
    race.publish_round_start(rep);
    arch::full_fence();
}

fn aux_seeder_loop(core: usize, cfg: &RunConfig, region: &Region, bank: &BarrierBank, race: &RaceTracker) {
    pin_to_core(core);
    for rep in 0..cfg.reps {
        seed_round(rep, region, race);
        bank.wait(B4);
    }
}

fn worker_loop(
    rank: usize,
    cfg: &RunConfig,
    map: &RankMap,
    region: &Region,
    bank: &BarrierBank,
    race: &RaceTracker,
    seeder: SeederShape,
) -> WorkerOutput {
    let info = *map.rank(rank);
    pin_to_core(info.core);

    let mut ctx = KernelCtx::new(
        region,
        race,
        rank,
        cfg.stride,
        cfg.fence,
        cfg.backoff,
        info.backoff,
        cfg.reps,
    );

    let test = TestId::from_raw(info.test);
    if test.is_none() {
        warn!(rank, test = info.test, "unknown test id, emitting aligned no-op samples");
    }
    info!(
        rank,
        core = info.core,
        cpu = current_cpu(),
        test = info.test,
        role = info.role,
        "worker online"
    );

    let script = test
        .map(|t| choreo::script(t, info.role, cfg.ao_success))
        .unwrap_or_default();
    let seed_mode = seeder != SeederShape::None;
    let in_band_seeder = seeder == SeederShape::InBand(rank);
    // Only the classic choreography consumes fresh lines each repetition;
    // seed mode re-primes the same contended line every round.
    let advance = !seed_mode && !cfg.flush && test.is_some_and(|t| t.advances_window());

    bank.wait(B0);

    for rep in 0..cfg.reps {
        if cfg.flush {
            arch::full_fence();
            region.flush_line(ctx.base);
            arch::full_fence();
        }
        bank.wait(B0);

        if seed_mode {
            if in_band_seeder {
                seed_round(rep, region, race);
            }
            bank.wait(B4);
            // The in-band seeder sits the contention out, except in
            // retry-until-success mode where it competes like everyone else.
            if !in_band_seeder || test == Some(TestId::CasUntilSuccess) {
                match test {
                    Some(t) => seed_dispatch(&mut ctx, t, rep),
                    None => ctx.noop_sample(rep),
                }
            }
            bank.wait(group_slot(info.group, 0));
        } else {
            for &action in &script {
                run_action(&mut ctx, bank, info.group, rep, action);
            }
            if test.is_none() {
                ctx.noop_sample(rep);
            }
        }

        bank.wait(B3);
        if advance {
            ctx.base += cfg.stride as usize;
        }
    }

    bank.wait(B10);

    let (probe, retry, sum) = ctx.into_parts();
    WorkerOutput {
        rank,
        probe,
        retry,
        sum,
    }
}

/// Seed-mode dispatch: every contender runs the kernel its test id names,
/// released simultaneously from barrier 4.
fn seed_dispatch(ctx: &mut KernelCtx, test: TestId, rep: usize) {
    use TestId::*;
    match test {
        Cas | CasOnModified | CasOnShared => {
            let ok = ctx.cas_contended(rep);
            ctx.sum = ctx.sum.wrapping_add(ok as u64);
        }
        CasConcurrent => {
            let ok = ctx.cas_once(rep);
            ctx.sum = ctx.sum.wrapping_add(ok as u64);
        }
        CasUntilSuccess => ctx.cas_until_success(rep),
        Fai | FaiOnModified | FaiOnShared | FaiOnInvalid => {
            let prev = ctx.fai(rep);
            ctx.sum = ctx.sum.wrapping_add(prev as u64);
        }
        Tas | TasOnModified | TasOnShared => {
            let free = ctx.tas(rep, true);
            ctx.sum = ctx.sum.wrapping_add(free as u64);
            ctx.tas_reset();
        }
        Swap | SwapOnModified | SwapOnShared => {
            let prev = ctx.swap_word(rep);
            ctx.sum = ctx.sum.wrapping_add(prev as u64);
        }
        StoreOnModified | StoreOnModifiedNoSync | StoreOnExclusive | StoreOnShared
        | StoreOnOwnedMine | StoreOnOwned | StoreOnInvalid => ctx.store_contended(rep, 0),
        LoadFromModified | LoadFromExclusive | LoadFromShared | LoadFromOwned
        | LoadFromInvalid | LoadFromL1 => {
            let v = ctx.load_contended(rep);
            ctx.sum = ctx.sum.wrapping_add(v);
        }
        LoadFromMemSize => {
            let v = ctx.pointer_chase(rep);
            ctx.sum = ctx.sum.wrapping_add(v);
        }
        Lfence => ctx.fence_op(rep, FenceKind::Load),
        Sfence => ctx.fence_op(rep, FenceKind::Store),
        Mfence => ctx.fence_op(rep, FenceKind::Full),
        Pause => ctx.fence_op(rep, FenceKind::Pause),
        Nop => ctx.fence_op(rep, FenceKind::Nop),
        Profiler => ctx.noop_sample(rep),
    }
}

/// Interprets one classic-mode choreography step.
fn run_action(ctx: &mut KernelCtx, bank: &BarrierBank, group: usize, rep: usize, action: Action) {
    match action {
        Action::GroupBarrier(k) => bank.wait(group_slot(group, k as usize)),
        Action::Store => ctx.store_contended(rep, 0),
        Action::StoreSecond => ctx.store_contended(rep, 1),
        Action::StoreOnce => ctx.store_once(rep),
        Action::StoreQuiet => ctx.store_once_quiet(rep),
        Action::Load => {
            let v = ctx.load_contended(rep);
            ctx.sum = ctx.sum.wrapping_add(v);
        }
        Action::LoadQuiet => {
            let v = ctx.load_contended_quiet(rep);
            ctx.sum = ctx.sum.wrapping_add(v);
        }
        Action::Invalidate => ctx.invalidate(rep),
        Action::CasOnce => {
            let ok = ctx.cas_once(rep);
            ctx.sum = ctx.sum.wrapping_add(ok as u64);
        }
        Action::CasOnceQuiet => {
            let ok = ctx.cas_once_quiet(rep);
            ctx.sum = ctx.sum.wrapping_add(ok as u64);
        }
        Action::Cas => {
            let ok = ctx.cas_contended(rep);
            ctx.sum = ctx.sum.wrapping_add(ok as u64);
        }
        Action::Fai => {
            let prev = ctx.fai(rep);
            ctx.sum = ctx.sum.wrapping_add(prev as u64);
        }
        Action::Tas => {
            let free = ctx.tas(rep, false);
            ctx.sum = ctx.sum.wrapping_add(free as u64);
        }
        Action::TasReset => ctx.tas_reset(),
        Action::Swap => {
            let prev = ctx.swap_word(rep);
            ctx.sum = ctx.sum.wrapping_add(prev as u64);
        }
        Action::CasUntilSuccess => ctx.cas_until_success(rep),
        Action::PointerChase => {
            let v = ctx.pointer_chase(rep);
            ctx.sum = ctx.sum.wrapping_add(v);
        }
        Action::Fence(kind) => ctx.fence_op(rep, kind),
        Action::LoadL1 => {
            let v = ctx.load_l1(rep);
            ctx.sum = ctx.sum.wrapping_add(v);
        }
        Action::Preset(p) => ctx.preset_word(match p {
            Preset::Zero => 0,
            Preset::Ones => u32::MAX,
            Preset::RepParity => (rep & 1) as u32,
        }),
        Action::Noop => ctx.noop_sample(rep),
    }
}
