//! Rank mapping: turns the jagged `--test`/`--cores_array`/`--backoff-array`
//! inputs into a dense per-rank assignment of core, test, role, group and
//! backoff cap.

use crate::config::RunConfig;
use crate::error::{BenchError, Result};

/// Everything one worker needs to know about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankInfo {
    /// Physical hardware thread to pin to.
    pub core: usize,
    /// Raw test id. Unknown ids are preserved so the worker can emit
    /// aligned no-op samples.
    pub test: usize,
    /// 0-based position inside the group.
    pub role: usize,
    /// Index of the jagged group.
    pub group: usize,
    /// Cap on pause iterations in retry loops, always at least 1.
    pub backoff: u32,
}

/// The dense rank table for a run.
#[derive(Debug, Clone)]
pub struct RankMap {
    ranks: Vec<RankInfo>,
    group_sizes: Vec<usize>,
}

impl RankMap {
    pub fn from_config(cfg: &RunConfig) -> Result<RankMap> {
        RankMap::build(
            &cfg.tests,
            &cfg.cores,
            &cfg.backoff_rows,
            cfg.default_cores,
            cfg.default_test,
            cfg.backoff_max,
        )
    }

    /// Applies the shape rules in order; the first matching rule wins.
    pub fn build(
        tests: &Option<Vec<Vec<usize>>>,
        cores: &Option<Vec<Vec<usize>>>,
        backoff_rows: &Option<Vec<Vec<usize>>>,
        default_cores: usize,
        default_test: usize,
        default_backoff: u32,
    ) -> Result<RankMap> {
        let mut ranks = Vec::new();
        let mut group_sizes = Vec::new();

        match cores {
            None => {
                // No core array: one synthesized group, cores 0..N, role 0.
                let n = default_cores.max(1);
                for r in 0..n {
                    ranks.push(RankInfo {
                        core: r,
                        test: default_test,
                        role: 0,
                        group: 0,
                        backoff: default_backoff.max(1),
                    });
                }
                group_sizes.push(n);
            }
            Some(core_rows) => {
                let num_groups = core_rows.len();
                let per_thread_tests = match tests {
                    Some(t_rows) => {
                        num_groups == 1 && t_rows.len() == 1 && t_rows[0].len() == core_rows[0].len()
                    }
                    None => false,
                };

                for (g, row) in core_rows.iter().enumerate() {
                    let group_test = match tests {
                        None => default_test,
                        Some(_) if per_thread_tests => default_test, // overridden per rank
                        Some(t_rows) if t_rows.len() == 1 => {
                            *t_rows[0].get(g).ok_or_else(|| {
                                BenchError::config(format!(
                                    "-t supplies {} tests for {} groups",
                                    t_rows[0].len(),
                                    num_groups
                                ))
                            })?
                        }
                        Some(t_rows) if t_rows.len() == num_groups => {
                            *t_rows[g].first().ok_or_else(|| {
                                BenchError::config(format!("-t row {g} is empty"))
                            })?
                        }
                        Some(t_rows) => {
                            return Err(BenchError::config(format!(
                                "mismatched -t/-x shapes: {} test rows vs {} groups",
                                t_rows.len(),
                                num_groups
                            )))
                        }
                    };

                    for (j, &core) in row.iter().enumerate() {
                        let test = if per_thread_tests {
                            tests.as_ref().unwrap()[0][j]
                        } else {
                            group_test
                        };
                        ranks.push(RankInfo {
                            core,
                            test,
                            role: j,
                            group: g,
                            backoff: default_backoff.max(1),
                        });
                    }
                    group_sizes.push(row.len());
                }
            }
        }

        if let Some(rows) = backoff_rows {
            if rows.len() != 1 || rows[0].len() != ranks.len() {
                return Err(BenchError::config(format!(
                    "-A must be a single row of length {} (the thread count)",
                    ranks.len()
                )));
            }
            for (info, &cap) in ranks.iter_mut().zip(&rows[0]) {
                info.backoff = (cap as u32).max(1);
            }
        }

        Ok(RankMap { ranks, group_sizes })
    }

    /// Total number of ranks.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn num_groups(&self) -> usize {
        self.group_sizes.len()
    }

    pub fn group_size(&self, group: usize) -> usize {
        self.group_sizes[group]
    }

    pub fn rank(&self, rank: usize) -> &RankInfo {
        &self.ranks[rank]
    }

    pub fn ranks(&self) -> impl Iterator<Item = &RankInfo> {
        self.ranks.iter()
    }

    /// Rank pinned to `core`, if any. Used to decide between the in-band and
    /// auxiliary seeder shapes.
    pub fn rank_of_core(&self, core: usize) -> Option<usize> {
        self.ranks.iter().position(|r| r.core == core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jagged;

    fn build(
        t: Option<&str>,
        x: Option<&str>,
        a: Option<&str>,
        default_test: usize,
    ) -> Result<RankMap> {
        let parse = |s: Option<&str>| s.map(|v| jagged::parse(v).unwrap());
        RankMap::build(&parse(t), &parse(x), &parse(a), 2, default_test, 64)
    }

    #[test]
    fn no_core_array_synthesizes_one_group() {
        let map = build(None, None, None, 12).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.num_groups(), 1);
        for (r, info) in map.ranks().enumerate() {
            assert_eq!(info.core, r);
            assert_eq!(info.test, 12);
            assert_eq!(info.role, 0);
            assert_eq!(info.group, 0);
        }
    }

    #[test]
    fn per_thread_ops_row() {
        // Single group, -t row length equals group size: per-position tests.
        let map = build(Some("[12,13,14]"), Some("[[0,1,2]]"), None, 0).unwrap();
        let tests: Vec<usize> = map.ranks().map(|r| r.test).collect();
        assert_eq!(tests, vec![12, 13, 14]);
        let roles: Vec<usize> = map.ranks().map(|r| r.role).collect();
        assert_eq!(roles, vec![0, 1, 2]);
    }

    #[test]
    fn one_test_per_group_by_position() {
        let map = build(Some("[12,13]"), Some("[[0,1],[2,3,4]]"), None, 0).unwrap();
        assert_eq!(map.len(), 5);
        assert_eq!(map.num_groups(), 2);
        let tests: Vec<usize> = map.ranks().map(|r| r.test).collect();
        assert_eq!(tests, vec![12, 12, 13, 13, 13]);
    }

    #[test]
    fn per_group_test_rows() {
        let map = build(Some("[[12],[13]]"), Some("[[0,1],[2,3]]"), None, 0).unwrap();
        let tests: Vec<usize> = map.ranks().map(|r| r.test).collect();
        assert_eq!(tests, vec![12, 12, 13, 13]);
        let groups: Vec<usize> = map.ranks().map(|r| r.group).collect();
        assert_eq!(groups, vec![0, 0, 1, 1]);
    }

    #[test]
    fn roles_are_dense_within_groups() {
        let map = build(None, Some("[[5,3],[7,9,11]]"), None, 0).unwrap();
        for g in 0..map.num_groups() {
            let mut roles: Vec<usize> = map
                .ranks()
                .filter(|r| r.group == g)
                .map(|r| r.role)
                .collect();
            roles.sort_unstable();
            assert_eq!(roles, (0..map.group_size(g)).collect::<Vec<_>>());
        }
        assert_eq!(
            map.len(),
            (0..map.num_groups()).map(|g| map.group_size(g)).sum()
        );
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        assert!(build(Some("[[12],[13],[14]]"), Some("[[0],[1]]"), None, 0).is_err());
        assert!(build(Some("[12]"), Some("[[0],[1]]"), None, 0).is_err());
    }

    #[test]
    fn backoff_array_is_per_rank_and_clamped() {
        let map = build(None, Some("[[0,1,2]]"), Some("[0,5,900]"), 0).unwrap();
        let caps: Vec<u32> = map.ranks().map(|r| r.backoff).collect();
        assert_eq!(caps, vec![1, 5, 900]);
        // Wrong length is a config error.
        assert!(build(None, Some("[[0,1,2]]"), Some("[1,2]"), 0).is_err());
    }

    #[test]
    fn rank_of_core_finds_the_seeder() {
        let map = build(None, Some("[[4,8]]"), None, 0).unwrap();
        assert_eq!(map.rank_of_core(8), Some(1));
        assert_eq!(map.rank_of_core(2), None);
    }
}
