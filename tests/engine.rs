//! End-to-end engine runs with small repetition counts.
//!
//! Core pinning is best-effort, so these run on any machine; the properties
//! checked are the accounting invariants, not absolute cycle numbers.

use linebench::config::CACHE_LINE_BYTES;
use linebench::{Engine, RunConfig, TestId};

fn base() -> RunConfig {
    RunConfig {
        reps: 200,
        stride: 1,
        mem_size: 1024 * CACHE_LINE_BYTES,
        ..RunConfig::default()
    }
}

fn cfg_for(test: TestId, cores: &[usize]) -> RunConfig {
    RunConfig {
        cores: Some(vec![cores.to_vec()]),
        default_test: test.raw(),
        ..base()
    }
}

#[test]
fn classic_store_on_modified() {
    let report = Engine::run(cfg_for(TestId::StoreOnModified, &[0, 1])).unwrap();
    assert_eq!(report.ranks.len(), 2);
    for line in &report.ranks {
        assert!(line.stats.is_some(), "rank {} lost its samples", line.rank);
    }
    let total_wins: u32 = report.ranks.iter().map(|r| r.wins).sum();
    assert_eq!(total_wins as usize, report.claimed_reps);
    assert!(report.claimed_reps <= report.reps);
}

#[test]
fn seed_mode_with_in_band_seeder() {
    let mut cfg = cfg_for(TestId::Cas, &[0, 1]);
    cfg.seed_core = Some(0);
    let report = Engine::run(cfg).unwrap();
    // The in-band seeder sits the contention out, so rank 1 claims every rep.
    assert_eq!(report.claimed_reps, report.reps);
    assert_eq!(report.ranks[0].wins, 0);
    assert_eq!(report.ranks[1].wins as usize, report.reps);
}

#[test]
fn seed_mode_with_auxiliary_seeder_records_latencies() {
    let mut cfg = cfg_for(TestId::Fai, &[0, 1]);
    // Core 9 is outside the rank set, so a helper thread is spawned and
    // barrier 4 widens to T + 1.
    cfg.seed_core = Some(9);
    cfg.reps = 100;
    let report = Engine::run(cfg).unwrap();
    assert_eq!(report.claimed_reps, report.reps);
    for line in &report.ranks {
        let lat = line.latency.expect("FAI records common-start latency");
        assert_eq!(lat.recorded, report.reps);
        assert!(lat.min >= 1, "latencies share the seeder's zero");
    }
    assert!(report.winner_agreement.is_some());
}

#[test]
fn cas_until_success_accounting() {
    let mut cfg = cfg_for(TestId::CasUntilSuccess, &[0, 1, 2, 3]);
    cfg.seed_core = Some(0);
    cfg.backoff = true;
    cfg.backoff_max = 1024;
    cfg.reps = 100;
    let report = Engine::run(cfg).unwrap();
    let mut total_successes = 0;
    for line in &report.ranks {
        let retry = line.retry.expect("every contender retried");
        assert_eq!(retry.attempts, retry.successes + retry.failures);
        assert_eq!(retry.successes as usize, report.reps);
        total_successes += retry.successes;
        let lat = line.latency.expect("success records latency");
        assert!(lat.min >= 1);
    }
    assert!(total_successes as usize >= report.claimed_reps);
    assert_eq!(report.claimed_reps, report.reps);
    let total_wins: u32 = report.ranks.iter().map(|r| r.wins).sum();
    assert_eq!(total_wins as usize, report.reps);
}

#[test]
fn two_groups_do_not_block_each_other() {
    let cfg = RunConfig {
        tests: Some(vec![vec![TestId::Cas.raw()], vec![TestId::Fai.raw()]]),
        cores: Some(vec![vec![0, 1], vec![2, 3]]),
        reps: 100,
        ..base()
    };
    let report = Engine::run(cfg).unwrap();
    assert_eq!(report.ranks.len(), 4);
    let cores: Vec<usize> = report.ranks.iter().map(|r| r.core).collect();
    assert_eq!(cores, vec![0, 1, 2, 3]);
    assert_eq!(report.ranks[2].test, TestId::Fai.raw());
}

#[test]
fn mfence_samples_every_rep_on_both_ranks() {
    let report = Engine::run(cfg_for(TestId::Mfence, &[0, 1])).unwrap();
    for line in &report.ranks {
        let stats = line.stats.expect("fence ranks record every rep");
        assert!(stats.min >= 0.0);
    }
}

#[test]
fn zero_reps_reports_no_samples() {
    let mut cfg = cfg_for(TestId::Cas, &[0, 1]);
    cfg.reps = 0;
    let report = Engine::run(cfg).unwrap();
    for line in &report.ranks {
        assert!(line.stats.is_none());
    }
    let mut rendered = Vec::new();
    report.render(&mut rendered).unwrap();
    let text = String::from_utf8(rendered).unwrap();
    assert!(text.contains("no samples recorded"));
}

#[test]
fn single_thread_choreography_terminates() {
    let mut cfg = cfg_for(TestId::StoreOnModified, &[0]);
    cfg.reps = 100;
    let report = Engine::run(cfg).unwrap();
    assert_eq!(report.ranks.len(), 1);
    // Alone in the race, rank 0 wins every claimed rep.
    assert_eq!(report.ranks[0].wins as usize, report.claimed_reps);
    assert_eq!(report.claimed_reps, report.reps);
}

#[test]
fn unknown_test_id_still_aligns_samples() {
    let cfg = RunConfig {
        cores: Some(vec![vec![0, 1]]),
        default_test: 99,
        reps: 50,
        ..base()
    };
    let report = Engine::run(cfg).unwrap();
    for line in &report.ranks {
        assert!(line.stats.is_some(), "no-op samples keep counts aligned");
    }
}

#[test]
fn pointer_chase_covers_the_region() {
    let mut cfg = cfg_for(TestId::LoadFromMemSize, &[0, 1]);
    cfg.mem_size = 256 * CACHE_LINE_BYTES;
    cfg.reps = 20;
    let report = Engine::run(cfg).unwrap();
    for line in &report.ranks {
        let stats = line.stats.expect("chase records one sample per rep");
        // One sample covers 256 dereferences, so it dwarfs a single load.
        assert!(stats.avg > 0.0);
    }
}

#[test]
fn flush_mode_runs_the_invalid_path() {
    let mut cfg = cfg_for(TestId::StoreOnModified, &[0, 1]);
    cfg.flush = true;
    cfg.reps = 100;
    let report = Engine::run(cfg).unwrap();
    assert_eq!(report.ranks.len(), 2);
    assert!(report.ranks.iter().all(|r| r.stats.is_some()));
}

#[test]
fn render_emits_the_stable_surface() {
    let mut cfg = cfg_for(TestId::Cas, &[0, 1]);
    cfg.reps = 50;
    let report = Engine::run(cfg).unwrap();
    let mut rendered = Vec::new();
    report.render(&mut rendered).unwrap();
    let text = String::from_utf8(rendered).unwrap();
    assert!(text.contains("Cross-core summary"));
    assert!(text.contains(" Summary : mean avg"));
    assert!(text.contains("First-op winners per thread (out of 50 reps):"));
    assert!(text.contains("Group 0 role 1 on thread 1 (thread ID 1):"));
    assert!(text.contains("Core number 0 is using thread: 0."));
}

#[test]
fn report_serializes_to_json() {
    let mut cfg = cfg_for(TestId::Fai, &[0, 1]);
    cfg.reps = 20;
    let report = Engine::run(cfg).unwrap();
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"ranks\""));
    assert!(json.contains("\"wins\""));
}

#[test]
fn too_many_groups_is_a_config_error() {
    let cfg = RunConfig {
        cores: Some((0..9).map(|c| vec![c]).collect()),
        reps: 1,
        ..base()
    };
    assert!(Engine::run(cfg).is_err());
}
