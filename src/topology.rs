//! Socket and NUMA topology heuristics.
//!
//! The reporter needs to fold per-core averages up to sockets and the
//! allocator wants a NUMA node guess for first-touch placement. Exact
//! topology is not portable to query, so detection stays conservative and the
//! socket mapping is an injectable policy.

use std::collections::HashMap;

/// Maps a physical core id to a socket for the per-socket roll-up.
#[derive(Debug, Clone, Default)]
pub enum SocketPolicy {
    /// Even core ids on socket 0, odd on socket 1. A platform heuristic,
    /// right on the interleaved-numbering machines this tool grew up on.
    #[default]
    Parity,
    /// Explicit core-to-socket table; unmapped cores land on socket 0.
    Map(HashMap<usize, usize>),
}

impl SocketPolicy {
    pub fn socket_of(&self, core: usize) -> usize {
        match self {
            SocketPolicy::Parity => core & 1,
            SocketPolicy::Map(m) => m.get(&core).copied().unwrap_or(0),
        }
    }
}

/// Conservative NUMA layout estimate.
///
/// Defaults to a single node unless the machine is large enough that several
/// nodes are likely; a wrong single-node guess only costs locality, never
/// correctness.
#[derive(Debug, Clone)]
pub struct Topology {
    core_to_node: HashMap<usize, usize>,
    pub num_nodes: usize,
    pub num_cores: usize,
}

impl Topology {
    pub fn detect() -> Topology {
        use sysinfo::{CpuRefreshKind, System};

        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        let num_cores = system.cpus().len().max(1);

        let num_nodes = if num_cores > 32 {
            (num_cores / 16).clamp(1, 4)
        } else {
            1
        };

        let mut core_to_node = HashMap::new();
        for core in 0..num_cores {
            core_to_node.insert(core, core % num_nodes);
        }

        Topology {
            core_to_node,
            num_nodes,
            num_cores,
        }
    }

    pub fn node_of(&self, core: usize) -> usize {
        self.core_to_node.get(&core).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_policy_splits_even_and_odd() {
        let policy = SocketPolicy::Parity;
        assert_eq!(policy.socket_of(0), 0);
        assert_eq!(policy.socket_of(7), 1);
        assert_eq!(policy.socket_of(12), 0);
    }

    #[test]
    fn map_policy_defaults_to_socket_zero() {
        let policy = SocketPolicy::Map(HashMap::from([(3, 1), (5, 1)]));
        assert_eq!(policy.socket_of(3), 1);
        assert_eq!(policy.socket_of(4), 0);
    }

    #[test]
    fn detection_is_sane() {
        let topo = Topology::detect();
        assert!(topo.num_nodes >= 1);
        assert!(topo.num_cores >= 1);
        assert!(topo.node_of(0) < topo.num_nodes);
    }
}
