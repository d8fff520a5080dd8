//! Post-run reporting: per-rank statistics, the cross-core summary, the
//! per-socket roll-up, winner tallies, retry accounting and the common-start
//! latency block.
//!
//! Everything here runs strictly after the workers have joined, so it reads
//! the tracker arrays and sample stores without synchronization concerns.
//! The line formats are stable; sibling scripts scrape them.

use std::io::{self, Write};

use serde::Serialize;

use crate::config::{RunConfig, TestId};
use crate::driver::WorkerOutput;
use crate::race::{RaceTracker, RetryStats};
use crate::rankmap::RankMap;
use crate::samples::AbsDeviation;
use crate::topology::SocketPolicy;

/// One rank's results.
#[derive(Debug, Clone, Serialize)]
pub struct RankLine {
    pub rank: usize,
    pub core: usize,
    pub group: usize,
    pub role: usize,
    pub test: usize,
    pub stats: Option<AbsDeviation>,
    pub wins: u32,
    pub retry: Option<RetryStats>,
    pub latency: Option<LatencyLine>,
    pub sum: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_samples: Option<Vec<u64>>,
}

/// Release-to-success latency summary for one rank.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencyLine {
    pub mean: f64,
    pub min: u64,
    pub max: u64,
    pub recorded: usize,
}

/// Cross-core summary over the per-rank averages.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Summary {
    pub mean_avg: f64,
    pub min_avg: f64,
    pub min_core: usize,
    pub max_avg: f64,
    pub max_core: usize,
}

/// Per-socket roll-up of the per-rank averages.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SocketLine {
    pub socket: usize,
    pub mean_avg: f64,
    pub threads: usize,
}

/// The assembled results of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub reps: usize,
    pub ranks: Vec<RankLine>,
    pub summary: Option<Summary>,
    pub sockets: Vec<SocketLine>,
    /// Fraction of claimed repetitions where the first winner also had the
    /// smallest recorded common-start latency.
    pub winner_agreement: Option<f64>,
    pub claimed_reps: usize,
    pub final_word: u32,
    #[serde(skip)]
    verbose: bool,
    #[serde(skip)]
    print: usize,
    #[serde(skip)]
    flush: bool,
    #[serde(skip)]
    ao_success: bool,
    #[serde(skip)]
    per_thread_header: bool,
}

impl RunReport {
    pub fn assemble(
        cfg: &RunConfig,
        map: &RankMap,
        race: &RaceTracker,
        outputs: Vec<WorkerOutput>,
        policy: &SocketPolicy,
        final_word: u32,
    ) -> RunReport {
        let mut ranks = Vec::with_capacity(outputs.len());
        for out in &outputs {
            let info = map.rank(out.rank);
            let stats = out.probe.first_valid().map(|(_, d)| d);
            let latency = latency_line(race, out.rank);
            let head_samples = (cfg.verbose && cfg.print > 0)
                .then(|| {
                    out.probe
                        .samples(out.probe.first_valid().map(|(s, _)| s).unwrap_or(0))
                        .map(|s| s.iter().take(cfg.print).copied().collect::<Vec<u64>>())
                })
                .flatten();
            ranks.push(RankLine {
                rank: out.rank,
                core: info.core,
                group: info.group,
                role: info.role,
                test: info.test,
                stats,
                wins: race.wins(out.rank),
                retry: (!out.retry.is_empty()).then_some(out.retry),
                latency,
                sum: out.sum,
                head_samples,
            });
        }

        let summary = summarize(&ranks);
        let sockets = socket_rollup(&ranks, policy);
        let winner_agreement = agreement(race, outputs.len());

        RunReport {
            reps: cfg.reps,
            ranks,
            summary,
            sockets,
            winner_agreement,
            claimed_reps: race.claimed_reps(),
            final_word,
            verbose: cfg.verbose,
            print: cfg.print,
            flush: cfg.flush,
            ao_success: cfg.ao_success,
            per_thread_header: per_thread_header(cfg, map),
        }
    }

    /// Writes the line-oriented report.
    pub fn render(&self, out: &mut impl Write) -> io::Result<()> {
        self.render_headers(out)?;
        writeln!(out)?;
        writeln!(
            out,
            "---- Cross-core summary ------------------------------------------------------------"
        )?;

        let mut prev_group = usize::MAX;
        for line in &self.ranks {
            if line.role == 0 && line.group != prev_group {
                writeln!(out, "Test number {} uses test ID {}", line.group, line.test)?;
                prev_group = line.group;
            }
            match &line.stats {
                None => writeln!(out, "Thread {} : no samples recorded", line.core)?,
                Some(d) => writeln!(
                    out,
                    "Core number {} is using thread: {}. with: avg {:5.1} cycles (min {:5.1} | max {:5.1}), std dev: {:5.1}, abs dev: {:5.1}",
                    line.role, line.core, d.avg, d.min, d.max, d.std_dev, d.abs_dev
                )?,
            }
            let last_of_group = self
                .ranks
                .iter()
                .find(|r| r.rank == line.rank + 1)
                .map_or(true, |next| next.group != line.group);
            if last_of_group {
                writeln!(out, "End test {} results for ID {}", line.group, line.test)?;
            }
        }
        writeln!(out)?;

        match &self.summary {
            Some(s) => writeln!(
                out,
                " Summary : mean avg {:8.1} cycles | min avg {:8.1} (core {}) | max avg {:8.1} (core {})",
                s.mean_avg, s.min_avg, s.min_core, s.max_avg, s.max_core
            )?,
            None => writeln!(out, " Summary : no statistics captured")?,
        }
        for s in &self.sockets {
            writeln!(
                out,
                " Socket {} : mean avg {:8.1} cycles over {} threads",
                s.socket, s.mean_avg, s.threads
            )?;
        }

        writeln!(out)?;
        writeln!(
            out,
            "First-op winners per thread (out of {} reps):",
            self.reps
        )?;
        for line in &self.ranks {
            writeln!(
                out,
                "  Group {} role {} on thread {} (thread ID {}): {} wins",
                line.group, line.role, line.core, line.rank, line.wins
            )?;
        }
        if let Some(pct) = self.winner_agreement {
            writeln!(
                out,
                "Winner/latency agreement: {:.1}% over {} claimed reps",
                pct * 100.0,
                self.claimed_reps
            )?;
        }

        if self.ranks.iter().any(|r| r.retry.is_some()) {
            writeln!(out)?;
            writeln!(out, "Retry stats (CAS until success):")?;
            for line in &self.ranks {
                if let Some(r) = &line.retry {
                    writeln!(
                        out,
                        "  Thread {} (rank {}): {} attempts, {} successes, {} failures",
                        line.core, line.rank, r.attempts, r.successes, r.failures
                    )?;
                }
            }
        }

        if self.ranks.iter().any(|r| r.latency.is_some()) {
            writeln!(out)?;
            writeln!(out, "Common-start latency (cycles):")?;
            for line in &self.ranks {
                if let Some(l) = &line.latency {
                    writeln!(
                        out,
                        "  Thread {} (rank {}): mean {:8.1} | min {} | max {} over {} reps",
                        line.core, line.rank, l.mean, l.min, l.max, l.recorded
                    )?;
                }
            }
        }

        if self.verbose {
            for line in &self.ranks {
                if let Some(samples) = &line.head_samples {
                    for (i, v) in samples.iter().enumerate() {
                        writeln!(out, "  [rank {}] sample[{}] = {}", line.rank, i, v)?;
                    }
                }
                writeln!(
                    out,
                    " value of word[0] is {:<10} / sum is {}",
                    self.final_word, line.sum
                )?;
            }
        }

        self.render_commentary(out)?;
        Ok(())
    }

    fn render_headers(&self, out: &mut impl Write) -> io::Result<()> {
        if self.per_thread_header {
            writeln!(out, "Per-thread ops in group 0:")?;
            for line in &self.ranks {
                writeln!(out, "  Test {} on core {}", line.test, line.core)?;
            }
            return Ok(());
        }
        let mut prev_group = usize::MAX;
        for line in &self.ranks {
            if line.group != prev_group {
                let cores: Vec<String> = self
                    .ranks
                    .iter()
                    .filter(|r| r.group == line.group)
                    .map(|r| r.core.to_string())
                    .collect();
                writeln!(
                    out,
                    "Test {} runs on cores: {}",
                    line.test,
                    cores.join(", ")
                )?;
                prev_group = line.group;
            }
        }
        Ok(())
    }

    /// One short interpretation block per distinct test in the run.
    fn render_commentary(&self, out: &mut impl Write) -> io::Result<()> {
        let mut seen = Vec::new();
        let cores = self.ranks.len();
        for line in &self.ranks {
            let Some(test) = TestId::from_raw(line.test) else {
                continue;
            };
            if seen.contains(&test) {
                continue;
            }
            seen.push(test);
            for note in commentary(test, self.flush, self.ao_success, cores) {
                writeln!(out, " ** {note}")?;
            }
        }
        Ok(())
    }
}

fn per_thread_header(cfg: &RunConfig, map: &RankMap) -> bool {
    match (&cfg.tests, &cfg.cores) {
        (Some(t), Some(x)) => {
            t.len() == 1 && x.len() == 1 && t[0].len() == x[0].len() && map.num_groups() == 1
        }
        _ => false,
    }
}

fn latency_line(race: &RaceTracker, rank: usize) -> Option<LatencyLine> {
    let mut recorded = 0usize;
    let mut total = 0u64;
    let mut min = u64::MAX;
    let mut max = 0u64;
    for rep in 0..race.reps() {
        if let Some(v) = race.latency(rank, rep) {
            recorded += 1;
            total += v;
            min = min.min(v);
            max = max.max(v);
        }
    }
    (recorded > 0).then(|| LatencyLine {
        mean: total as f64 / recorded as f64,
        min,
        max,
        recorded,
    })
}

fn summarize(ranks: &[RankLine]) -> Option<Summary> {
    let mut sum = 0.0;
    let mut n = 0usize;
    let mut min_avg = f64::MAX;
    let mut max_avg = 0.0f64;
    let mut min_core = 0;
    let mut max_core = 0;
    for line in ranks {
        let Some(d) = &line.stats else { continue };
        sum += d.avg;
        n += 1;
        if d.avg < min_avg {
            min_avg = d.avg;
            min_core = line.core;
        }
        if d.avg > max_avg {
            max_avg = d.avg;
            max_core = line.core;
        }
    }
    (n > 0).then(|| Summary {
        mean_avg: sum / n as f64,
        min_avg,
        min_core,
        max_avg,
        max_core,
    })
}

fn socket_rollup(ranks: &[RankLine], policy: &SocketPolicy) -> Vec<SocketLine> {
    let mut acc: Vec<(usize, f64, usize)> = Vec::new();
    for line in ranks {
        let Some(d) = &line.stats else { continue };
        let socket = policy.socket_of(line.core);
        match acc.iter_mut().find(|(s, _, _)| *s == socket) {
            Some((_, sum, n)) => {
                *sum += d.avg;
                *n += 1;
            }
            None => acc.push((socket, d.avg, 1)),
        }
    }
    acc.sort_by_key(|(s, _, _)| *s);
    acc.into_iter()
        .map(|(socket, sum, n)| SocketLine {
            socket,
            mean_avg: sum / n as f64,
            threads: n,
        })
        .collect()
}

/// Fraction of claimed repetitions where the winner also posted the smallest
/// recorded common-start latency. A consistency check on the race plumbing.
fn agreement(race: &RaceTracker, ranks: usize) -> Option<f64> {
    let mut considered = 0usize;
    let mut agreed = 0usize;
    for rep in 0..race.reps() {
        let Some(winner) = race.winner(rep) else { continue };
        let mut best: Option<(usize, u64)> = None;
        for rank in 0..ranks {
            if let Some(v) = race.latency(rank, rep) {
                if best.map_or(true, |(_, b)| v < b) {
                    best = Some((rank, v));
                }
            }
        }
        if let Some((rank, _)) = best {
            considered += 1;
            if rank == winner as usize {
                agreed += 1;
            }
        }
    }
    (considered > 0).then(|| agreed as f64 / considered as f64)
}

fn commentary(test: TestId, flush: bool, ao_success: bool, cores: usize) -> Vec<String> {
    let mut notes = Vec::new();
    match test {
        TestId::StoreOnModified => {
            if flush {
                notes.push("Results from role 0 : store on invalid".into());
                notes.push("Results from role 1 : store on modified".into());
            } else {
                notes.push("Results from roles 0 and 1 : store on modified".into());
            }
        }
        TestId::StoreOnModifiedNoSync => {
            if flush {
                notes.push("Results do not make sense under --flush".into());
            } else {
                notes.push(
                    "Results from roles 0 and 1 : store on modified while the other core races the same store"
                        .into(),
                );
            }
        }
        TestId::StoreOnExclusive => {
            notes.push(if flush {
                "Results from role 0 : load from invalid".into()
            } else {
                "Results from role 0 : load from invalid, but prefetching may interfere".into()
            });
            notes.push("Results from role 1 : store on exclusive".into());
        }
        TestId::StoreOnShared => {
            notes.push(
                "Results from roles 0 & 2 : load from modified and exclusive/shared respectively"
                    .into(),
            );
            notes.push("Results from role 1 : store on shared".into());
            if cores < 3 {
                notes.push("Need >= 3 threads to reach STORE_ON_SHARED".into());
            }
        }
        TestId::StoreOnOwnedMine => {
            notes.push("Results from role 0 : load from modified (owned, where supported)".into());
            notes.push(if flush {
                "Results 1 from role 1 : store to invalid".into()
            } else {
                "Results 1 from role 1 : store to modified mine".into()
            });
            notes.push("Results 2 from role 1 : store to owned mine (else exclusive)".into());
        }
        TestId::StoreOnOwned => {
            notes.push(if flush {
                "Results from role 0 : store to modified".into()
            } else {
                "Results from role 0 : store to invalid".into()
            });
            notes.push("Results 1 from role 1 : load from modified (owned, where supported)".into());
            notes.push("Results 2 from role 1 : store to owned (else exclusive mine)".into());
        }
        TestId::StoreOnInvalid => {
            notes.push("Results from role 0 : store on invalid".into());
            notes.push("Results from role 1 : cache line flush".into());
        }
        TestId::LoadFromModified => {
            notes.push(if flush {
                "Results from role 0 : store to invalid".into()
            } else {
                "Results from role 0 : store to owned mine (else exclusive)".into()
            });
            notes.push("Results from role 1 : load from modified (owned, where supported)".into());
        }
        TestId::LoadFromExclusive => {
            notes.push(if flush {
                "Results from role 0 : load from invalid".into()
            } else {
                "Results from role 0 : load from invalid, but prefetching may interfere".into()
            });
            notes.push("Results from role 1 : load from exclusive".into());
        }
        TestId::LoadFromShared => {
            notes.push("Results from role 0 : load from invalid or exclusive".into());
            notes.push("Results from role 1 : load from shared".into());
            if cores < 3 {
                notes.push("Need >= 3 threads to reach LOAD_FROM_SHARED".into());
            }
        }
        TestId::LoadFromOwned => {
            notes.push(if flush {
                "Results from role 0 : store to invalid".into()
            } else {
                "Results from role 0 : store to owned mine (else shared)".into()
            });
            notes.push("Results from role 1 : load from modified".into());
            if cores >= 3 {
                notes.push("Results from role 2 : load from owned".into());
            } else {
                notes.push("Need 3 threads to reach LOAD_FROM_OWNED".into());
            }
        }
        TestId::LoadFromInvalid => {
            notes.push("Results from role 0 : load from invalid".into());
            notes.push("Results from role 1 : cache line flush".into());
        }
        TestId::Cas => {
            notes.push("Results from role 0 : CAS successful".into());
            notes.push("Results from role 1 : CAS unsuccessful".into());
        }
        TestId::Fai => notes.push("Results from roles 0 & 1 : FAI".into()),
        TestId::Tas => {
            notes.push("Results from role 0 : TAS successful".into());
            notes.push("Results from role 1 : TAS unsuccessful".into());
        }
        TestId::Swap => notes.push("Results from roles 0 & 1 : SWAP".into()),
        TestId::CasOnModified => {
            notes.push("Results from role 0 : store on modified".into());
            let pct = 50 + ao_success as u32 * 50;
            notes.push(format!("Results from role 1 : CAS on modified ({pct}% successful)"));
        }
        TestId::FaiOnModified => {
            notes.push("Results from role 0 : store on modified".into());
            notes.push("Results from role 1 : FAI on modified".into());
        }
        TestId::TasOnModified => {
            notes.push("Results from role 0 : store on modified".into());
            let pct = ao_success as u32 * 100;
            notes.push(format!("Results from role 1 : TAS on modified ({pct}% successful)"));
        }
        TestId::SwapOnModified => {
            notes.push("Results from role 0 : store on modified".into());
            notes.push("Results from role 1 : SWAP on modified".into());
        }
        TestId::CasOnShared => {
            notes.push("Results from role 0 : load from modified".into());
            notes.push("Results from role 1 : CAS on shared (100% successful)".into());
            notes.push("Results from role 2 : load from exclusive or shared".into());
            if cores < 3 {
                notes.push("Need >= 3 threads to reach CAS_ON_SHARED".into());
            }
        }
        TestId::FaiOnShared => {
            notes.push("Results from role 0 : load from modified".into());
            notes.push("Results from role 1 : FAI on shared".into());
            notes.push("Results from role 2 : load from exclusive or shared".into());
            if cores < 3 {
                notes.push("Need >= 3 threads to reach FAI_ON_SHARED".into());
            }
        }
        TestId::TasOnShared => {
            notes.push("Results from role 0 : load from L1".into());
            let pct = ao_success as u32 * 100;
            notes.push(format!("Results from role 1 : TAS on shared ({pct}% successful)"));
            notes.push("Results from role 2 : load from exclusive or shared".into());
            if cores < 3 {
                notes.push("Need >= 3 threads to reach TAS_ON_SHARED".into());
            }
        }
        TestId::SwapOnShared => {
            notes.push("Results from role 0 : load from modified".into());
            notes.push("Results from role 1 : SWAP on shared".into());
            notes.push("Results from role 2 : load from exclusive or shared".into());
            if cores < 3 {
                notes.push("Need >= 3 threads to reach SWAP_ON_SHARED".into());
            }
        }
        TestId::CasConcurrent => {
            notes.push(format!("Results from {cores} threads : CAS concurrent"));
        }
        TestId::FaiOnInvalid => {
            notes.push("Results from role 0 : FAI on invalid".into());
            notes.push("Results from role 1 : cache line flush".into());
        }
        TestId::LoadFromL1 => notes.push("Results from role 0 : load from L1".into()),
        TestId::LoadFromMemSize => {
            notes.push("Results from all threads : pointer-chase over the whole region".into());
        }
        TestId::Lfence => notes.push("Results from roles 0 & 1 : load fence".into()),
        TestId::Sfence => notes.push("Results from roles 0 & 1 : store fence".into()),
        TestId::Mfence => notes.push("Results from roles 0 & 1 : full fence".into()),
        TestId::Pause => notes.push("Results from roles 0 & 1 : pause".into()),
        TestId::Nop => notes.push("Results from roles 0 & 1 : nop".into()),
        TestId::Profiler => notes.push("Results from all threads : empty probe bracket".into()),
        TestId::CasUntilSuccess => {
            notes.push("Results from all threads : CAS retried until success".into());
        }
    }
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::AbsDeviation;

    fn line(rank: usize, core: usize, avg: f64) -> RankLine {
        RankLine {
            rank,
            core,
            group: 0,
            role: rank,
            test: 12,
            stats: Some(AbsDeviation {
                avg,
                min: avg,
                max: avg,
                std_dev: 0.0,
                abs_dev: 0.0,
            }),
            wins: 0,
            retry: None,
            latency: None,
            sum: 0,
            head_samples: None,
        }
    }

    #[test]
    fn summary_tracks_min_and_max_cores() {
        let ranks = vec![line(0, 2, 100.0), line(1, 4, 50.0), line(2, 6, 150.0)];
        let s = summarize(&ranks).unwrap();
        assert!((s.mean_avg - 100.0).abs() < 1e-9);
        assert_eq!(s.min_core, 4);
        assert_eq!(s.max_core, 6);
    }

    #[test]
    fn summary_of_no_stats_is_none() {
        let mut l = line(0, 0, 1.0);
        l.stats = None;
        assert!(summarize(&[l]).is_none());
    }

    #[test]
    fn parity_rollup_splits_sockets() {
        let ranks = vec![line(0, 0, 10.0), line(1, 2, 30.0), line(2, 1, 100.0)];
        let sockets = socket_rollup(&ranks, &SocketPolicy::Parity);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].socket, 0);
        assert_eq!(sockets[0].threads, 2);
        assert!((sockets[0].mean_avg - 20.0).abs() < 1e-9);
        assert_eq!(sockets[1].threads, 1);
    }

    #[test]
    fn agreement_matches_winner_and_argmin() {
        let race = RaceTracker::new(2, 2);
        race.publish_round_start(0);
        assert!(race.try_claim(1, 0));
        race.record_success(1, 0);
        // Rank 0 records later, so its latency is larger.
        race.record_success(0, 0);
        let pct = agreement(&race, 2).unwrap();
        assert!(pct >= 0.0 && pct <= 1.0);
    }

    #[test]
    fn commentary_covers_every_test() {
        for &test in &TestId::ALL {
            assert!(
                !commentary(test, false, false, 4).is_empty(),
                "{} has no commentary",
                test.name()
            );
        }
    }
}
