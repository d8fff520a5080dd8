//! Classic-mode choreography: the barrier scripts that put the contended
//! line into a known coherence state before each measured operation.
//!
//! Every `(test, role)` pair maps to a short action sequence. Role 0 usually
//! prepares the state, role 1 performs the measured operation, and higher
//! roles either generate Shared-state traffic or just keep the group's
//! barriers balanced. The sequences are interpreted by the round driver; the
//! group barriers `GroupBarrier(0)` and `GroupBarrier(1)` resolve to the
//! group's own slots so disjoint groups never wait on each other.

use crate::config::TestId;
use crate::kernels::FenceKind;

/// One step of a choreography script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wait on the group's k-th intra-group barrier.
    GroupBarrier(u8),
    /// Stride-hiding store (probe slot 0).
    Store,
    /// Stride-hiding store into probe slot 1, for second-store tests.
    StoreSecond,
    /// Single timed store to the contended line.
    StoreOnce,
    /// Unprobed store, traffic only.
    StoreQuiet,
    /// Stride-hiding load.
    Load,
    /// Unprobed stride-hiding load, Shared-state traffic.
    LoadQuiet,
    /// Timed cache-line eviction.
    Invalidate,
    /// Single-shot CAS.
    CasOnce,
    /// Single-shot CAS without a probe.
    CasOnceQuiet,
    /// Stride-hiding CAS.
    Cas,
    Fai,
    Tas,
    /// Release the TAS slot.
    TasReset,
    Swap,
    CasUntilSuccess,
    PointerChase,
    Fence(FenceKind),
    /// Three back-to-back loads; the surviving sample is the L1 hit.
    LoadL1,
    /// Write a preconditioning value into the contended word.
    Preset(Preset),
    /// Aligned empty sample.
    Noop,
}

/// Values role 0 presets the contended word to under `--success` handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Leave the slot free so the next TAS succeeds.
    Zero,
    /// Fill the slot so the next TAS fails.
    Ones,
    /// Match the repetition parity so the next CAS succeeds.
    RepParity,
}

/// The script for one rank in one repetition of classic mode.
pub fn script(test: TestId, role: usize, ao_success: bool) -> Vec<Action> {
    use Action::*;
    match test {
        TestId::StoreOnModified => match role {
            0 => vec![Store, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Store],
            _ => vec![GroupBarrier(0)],
        },
        TestId::StoreOnModifiedNoSync => match role {
            0..=2 => vec![StoreOnce],
            _ => vec![StoreQuiet],
        },
        TestId::StoreOnExclusive => match role {
            0 => vec![Load, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Store],
            _ => vec![GroupBarrier(0)],
        },
        TestId::StoreOnShared => match role {
            0 => vec![Load, GroupBarrier(0), GroupBarrier(1)],
            1 => vec![GroupBarrier(0), GroupBarrier(1), Store],
            2 => vec![GroupBarrier(0), Load, GroupBarrier(1)],
            _ => vec![GroupBarrier(0), LoadQuiet, GroupBarrier(1)],
        },
        TestId::StoreOnOwnedMine => match role {
            0 => vec![GroupBarrier(0), Load, GroupBarrier(1)],
            1 => vec![Store, GroupBarrier(0), GroupBarrier(1), StoreSecond],
            _ => vec![GroupBarrier(0), LoadQuiet, GroupBarrier(1)],
        },
        TestId::StoreOnOwned => match role {
            0 => vec![Store, GroupBarrier(0), GroupBarrier(1)],
            1 => vec![GroupBarrier(0), Load, GroupBarrier(1), StoreSecond],
            _ => vec![GroupBarrier(0), LoadQuiet, GroupBarrier(1)],
        },
        TestId::StoreOnInvalid => match role {
            0 => vec![GroupBarrier(0), StoreOnce],
            1 => vec![Invalidate, GroupBarrier(0)],
            _ => vec![GroupBarrier(0)],
        },
        TestId::LoadFromModified => match role {
            0 => vec![Store, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Load],
            _ => vec![GroupBarrier(0)],
        },
        TestId::LoadFromExclusive => match role {
            0 => vec![Load, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Load],
            _ => vec![GroupBarrier(0)],
        },
        TestId::LoadFromShared => match role {
            0 => vec![Load, GroupBarrier(0), GroupBarrier(1)],
            1 => vec![GroupBarrier(0), GroupBarrier(1), Load],
            2 => vec![GroupBarrier(0), Load, GroupBarrier(1)],
            _ => vec![GroupBarrier(0), LoadQuiet, GroupBarrier(1)],
        },
        TestId::LoadFromOwned => match role {
            0 => vec![Store, GroupBarrier(0), GroupBarrier(1)],
            1 => vec![GroupBarrier(0), Load, GroupBarrier(1)],
            2 => vec![GroupBarrier(0), GroupBarrier(1), Load],
            _ => vec![GroupBarrier(0), GroupBarrier(1)],
        },
        TestId::LoadFromInvalid => match role {
            0 => vec![GroupBarrier(0), Load],
            1 => vec![Invalidate, GroupBarrier(0)],
            _ => vec![GroupBarrier(0)],
        },
        TestId::Cas => match role {
            0 => vec![Cas, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Cas],
            _ => vec![GroupBarrier(0)],
        },
        TestId::Fai => match role {
            0 => vec![Fai, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Fai],
            _ => vec![GroupBarrier(0)],
        },
        TestId::Tas => match role {
            0 => vec![Tas, GroupBarrier(0), GroupBarrier(1)],
            1 => vec![GroupBarrier(0), Tas, TasReset, GroupBarrier(1)],
            _ => vec![GroupBarrier(0), GroupBarrier(1)],
        },
        TestId::Swap => match role {
            0 => vec![Swap, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Swap],
            _ => vec![GroupBarrier(0)],
        },
        TestId::CasOnModified => match role {
            0 if ao_success => vec![Store, Preset(crate::choreo::Preset::RepParity), GroupBarrier(0)],
            0 => vec![Store, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Cas],
            _ => vec![GroupBarrier(0)],
        },
        TestId::FaiOnModified => match role {
            0 => vec![Store, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Fai],
            _ => vec![GroupBarrier(0)],
        },
        TestId::TasOnModified => match role {
            0 if ao_success => vec![Store, GroupBarrier(0)],
            0 => vec![Store, Preset(crate::choreo::Preset::Ones), GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Tas],
            _ => vec![GroupBarrier(0)],
        },
        TestId::SwapOnModified => match role {
            0 => vec![Store, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), Swap],
            _ => vec![GroupBarrier(0)],
        },
        TestId::CasOnShared => match role {
            0 => vec![Load, GroupBarrier(0), GroupBarrier(1)],
            1 => vec![GroupBarrier(0), Cas, GroupBarrier(1)],
            2 => vec![GroupBarrier(0), Load, GroupBarrier(1)],
            _ => vec![GroupBarrier(0), LoadQuiet, GroupBarrier(1)],
        },
        TestId::FaiOnShared => match role {
            0 => vec![Load, GroupBarrier(0), GroupBarrier(1)],
            1 => vec![GroupBarrier(0), GroupBarrier(1), Fai],
            2 => vec![GroupBarrier(0), Load, GroupBarrier(1)],
            _ => vec![GroupBarrier(0), LoadQuiet, GroupBarrier(1)],
        },
        TestId::TasOnShared => match role {
            0 => vec![
                Preset(if ao_success { crate::choreo::Preset::Zero } else { crate::choreo::Preset::Ones }),
                Load,
                GroupBarrier(0),
                GroupBarrier(1),
            ],
            1 => vec![GroupBarrier(0), GroupBarrier(1), Tas],
            2 => vec![GroupBarrier(0), Load, GroupBarrier(1)],
            _ => vec![GroupBarrier(0), LoadQuiet, GroupBarrier(1)],
        },
        TestId::SwapOnShared => match role {
            0 => vec![Load, GroupBarrier(0), GroupBarrier(1)],
            1 => vec![GroupBarrier(0), GroupBarrier(1), Swap],
            2 => vec![GroupBarrier(0), Load, GroupBarrier(1)],
            _ => vec![GroupBarrier(0), LoadQuiet, GroupBarrier(1)],
        },
        TestId::CasConcurrent => match role {
            0..=2 => vec![CasOnce],
            _ => vec![CasOnceQuiet],
        },
        TestId::FaiOnInvalid => match role {
            0 => vec![GroupBarrier(0), Fai],
            1 => vec![Invalidate, GroupBarrier(0)],
            _ => vec![GroupBarrier(0)],
        },
        TestId::LoadFromL1 => match role {
            0 => vec![LoadL1],
            _ => vec![],
        },
        TestId::LoadFromMemSize => vec![PointerChase],
        TestId::Lfence => fence_script(role, FenceKind::Load),
        TestId::Sfence => fence_script(role, FenceKind::Store),
        TestId::Mfence => fence_script(role, FenceKind::Full),
        TestId::Pause => fence_script(role, FenceKind::Pause),
        TestId::Nop => fence_script(role, FenceKind::Nop),
        TestId::Profiler => vec![Noop],
        TestId::CasUntilSuccess => match role {
            0 => vec![CasUntilSuccess, GroupBarrier(0)],
            1 => vec![GroupBarrier(0), CasUntilSuccess],
            _ => vec![GroupBarrier(0)],
        },
    }
}

fn fence_script(role: usize, kind: FenceKind) -> Vec<Action> {
    if role < 2 {
        vec![Action::Fence(kind)]
    } else {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn barrier_counts(test: TestId, role: usize) -> [usize; 2] {
        let mut counts = [0usize; 2];
        for a in script(test, role, false) {
            if let Action::GroupBarrier(k) = a {
                counts[k as usize] += 1;
            }
        }
        counts
    }

    /// Every role of a group must pass each group barrier the same number of
    /// times per repetition, for any group size; anything else deadlocks.
    #[test]
    fn barrier_counts_agree_across_roles() {
        for &test in &TestId::ALL {
            for group_size in 1..=6 {
                let reference = barrier_counts(test, 0);
                for role in 1..group_size {
                    assert_eq!(
                        barrier_counts(test, role),
                        reference,
                        "{} role {role} of {group_size}",
                        test.name()
                    );
                }
            }
        }
    }

    #[test]
    fn ao_success_presets_only_role_zero() {
        for &test in &TestId::ALL {
            for role in 1..4 {
                for ao in [false, true] {
                    assert!(
                        !script(test, role, ao)
                            .iter()
                            .any(|a| matches!(a, Action::Preset(_))),
                        "{} role {role}",
                        test.name()
                    );
                }
            }
        }
        assert!(script(TestId::CasOnModified, 0, true)
            .iter()
            .any(|a| matches!(a, Action::Preset(Preset::RepParity))));
        assert!(script(TestId::TasOnModified, 0, false)
            .iter()
            .any(|a| matches!(a, Action::Preset(Preset::Ones))));
        assert!(script(TestId::TasOnShared, 0, true)
            .iter()
            .any(|a| matches!(a, Action::Preset(Preset::Zero))));
    }

    #[test]
    fn measured_role_follows_the_precondition() {
        // Role 1's measured store comes strictly after its group barriers.
        let s = script(TestId::StoreOnShared, 1, false);
        assert_eq!(
            s,
            vec![
                Action::GroupBarrier(0),
                Action::GroupBarrier(1),
                Action::Store
            ]
        );
        // The owned-transition tests take a second timed store.
        assert!(script(TestId::StoreOnOwned, 1, false)
            .iter()
            .any(|a| *a == Action::StoreSecond));
    }

    #[test]
    fn spectators_only_wait() {
        for &test in &[TestId::Cas, TestId::Fai, TestId::Swap, TestId::CasUntilSuccess] {
            assert_eq!(script(test, 5, false), vec![Action::GroupBarrier(0)]);
        }
    }

    #[test]
    fn fence_tests_run_on_two_roles_only() {
        for &test in &[
            TestId::Lfence,
            TestId::Sfence,
            TestId::Mfence,
            TestId::Pause,
            TestId::Nop,
        ] {
            assert_eq!(script(test, 0, false).len(), 1);
            assert_eq!(script(test, 1, false).len(), 1);
            assert!(script(test, 2, false).is_empty());
        }
    }
}
