//! NUMA topology probe and worker affinity pinning (spec §4.5 "NUMA
//! affinity", §6 "Environment"). Linux-only; a no-op elsewhere.

#[derive(Debug, Clone, Default)]
pub struct NumaTopology {
    /// One entry per NUMA node, each holding its CPU ids.
    pub nodes: Vec<Vec<usize>>,
}

impl NumaTopology {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Which NUMA node worker `i` (of `n_threads`) should be pinned to
    /// (spec §4.5: `i / ceil(n_threads / n_nodes)`).
    pub fn node_for_worker(&self, i: usize, n_threads: usize) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let n_nodes = self.nodes.len();
        let per_node = (n_threads + n_nodes - 1) / n_nodes;
        (i / per_node.max(1)).min(n_nodes - 1)
    }
}

#[cfg(target_os = "linux")]
pub fn numa_topology() -> NumaTopology {
    use std::fs;

    let mut nodes = Vec::new();
    let Ok(entries) = fs::read_dir("/sys/devices/system/node") else {
        return NumaTopology { nodes };
    };
    let mut node_dirs: Vec<_> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("node"))
        .collect();
    node_dirs.sort_by_key(|e| e.file_name());

    for node_dir in node_dirs {
        let Ok(cpu_entries) = fs::read_dir(node_dir.path()) else {
            continue;
        };
        let mut cpus: Vec<usize> = cpu_entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_prefix("cpu")?.parse::<usize>().ok()
            })
            .collect();
        cpus.sort_unstable();
        nodes.push(cpus);
    }
    tracing::debug!(node_count = nodes.len(), "numa topology read from /sys");
    NumaTopology { nodes }
}

#[cfg(not(target_os = "linux"))]
pub fn numa_topology() -> NumaTopology {
    NumaTopology::default()
}

/// Warns once if the kernel's automatic NUMA balancing is enabled, since it
/// perturbs performance measurements (spec §6 "Environment").
#[cfg(target_os = "linux")]
pub fn warn_if_numa_balancing_enabled() {
    if let Ok(contents) = std::fs::read_to_string("/proc/sys/kernel/numa_balancing") {
        if contents.trim() != "0" {
            tracing::warn!("kernel NUMA balancing is enabled; this can perturb measurements");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn warn_if_numa_balancing_enabled() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_for_worker_distributes_evenly() {
        let topo = NumaTopology { nodes: vec![vec![0, 1], vec![2, 3]] };
        assert_eq!(topo.node_for_worker(0, 4), 0);
        assert_eq!(topo.node_for_worker(1, 4), 0);
        assert_eq!(topo.node_for_worker(2, 4), 1);
        assert_eq!(topo.node_for_worker(3, 4), 1);
    }

    #[test]
    fn empty_topology_pins_everyone_to_zero() {
        let topo = NumaTopology::default();
        assert_eq!(topo.node_for_worker(5, 8), 0);
    }
}
