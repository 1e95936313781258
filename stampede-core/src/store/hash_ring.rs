use stampede_proto::Process;

use crate::util::hash;

/// Number of slots on the placement ring.
pub const HASH_SLOTS: u64 = 1024;

#[derive(Clone, Debug)]
pub struct HashNode {
    pub hash_key: u64,
    pub process: Process,
}

/// Consistent-hash ring rebuilt from the membership list after every
/// change. Collisions resolve by OR-ing an incrementing probe into the
/// key, which is deterministic across nodes given the same member set.
#[derive(Clone, Debug, Default)]
pub struct HashRing {
    nodes: Vec<HashNode>,
}

impl HashRing {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[HashNode] {
        &self.nodes
    }

    /// Rebuild from the current membership.
    pub fn refresh(&mut self, processes: &[Process]) {
        self.nodes.clear();
        let mut taken = std::collections::HashSet::new();

        for process in processes {
            let base = hash(&process.address());
            let mut probe = 0u64;
            while probe < HASH_SLOTS && taken.contains(&((base | probe) % HASH_SLOTS)) {
                probe += 1;
            }
            let hash_key = (base | probe) % HASH_SLOTS;
            taken.insert(hash_key);
            self.nodes.push(HashNode {
                hash_key,
                process: process.clone(),
            });
        }

        self.nodes.sort_by_key(|node| node.hash_key);
    }

    /// The `min(n, ring len)` nodes clockwise from the key's slot.
    pub fn find_replicas(&self, key: &str, n: usize) -> Vec<Process> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let slot = hash(key) % HASH_SLOTS;
        let start = self
            .nodes
            .iter()
            .position(|node| node.hash_key >= slot)
            .unwrap_or(0);

        (0..n.min(self.nodes.len()))
            .map(|i| self.nodes[(start + i) % self.nodes.len()].process.clone())
            .collect()
    }

    /// The `n` nodes immediately clockwise of `process`, excluding it.
    pub fn find_successors(&self, process: &Process, n: usize) -> Vec<Process> {
        let Some(index) = self.find_process_index(process) else {
            return Vec::new();
        };

        let mut successors = Vec::new();
        for i in 0..n {
            let candidate = &self.nodes[(index + i + 1) % self.nodes.len()].process;
            if candidate.same_identity(process) {
                break;
            }
            successors.push(candidate.clone());
        }
        successors
    }

    /// The single node immediately counter-clockwise, or `None` when the
    /// ring has at most one node.
    pub fn find_predecessor(&self, process: &Process) -> Option<Process> {
        let index = self.find_process_index(process)?;
        if self.nodes.len() <= 1 {
            return None;
        }
        let at = (index + self.nodes.len() - 1) % self.nodes.len();
        Some(self.nodes[at].process.clone())
    }

    /// Primary replica for a key.
    pub fn route_process(&self, key: &str) -> Option<Process> {
        if self.nodes.is_empty() {
            return None;
        }
        let slot = hash(key) % HASH_SLOTS;
        let node = self
            .nodes
            .iter()
            .find(|node| node.hash_key >= slot)
            .unwrap_or(&self.nodes[0]);
        Some(node.process.clone())
    }

    fn find_process_index(&self, process: &Process) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.process.same_identity(process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processes(n: u16) -> Vec<Process> {
        (0..n).map(|i| Process::new("host", 5000 + i)).collect()
    }

    fn ring_of(n: u16) -> HashRing {
        let mut ring = HashRing::default();
        ring.refresh(&processes(n));
        ring
    }

    #[test]
    fn refresh_is_deterministic_and_sorted() {
        let first = ring_of(8);
        let second = ring_of(8);

        let keys: Vec<u64> = first.nodes().iter().map(|n| n.hash_key).collect();
        let again: Vec<u64> = second.nodes().iter().map(|n| n.hash_key).collect();
        assert_eq!(keys, again);
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "sorted, no duplicates");
    }

    #[test]
    fn replicas_clamp_to_ring_size() {
        let ring = ring_of(3);
        assert_eq!(ring.find_replicas("some-file", 4).len(), 3);
        assert_eq!(ring.find_replicas("some-file", 2).len(), 2);
        assert!(HashRing::default().find_replicas("some-file", 4).is_empty());
    }

    #[test]
    fn replicas_are_distinct_consecutive_nodes() {
        let ring = ring_of(6);
        let replicas = ring.find_replicas("model.bin", 4);
        assert_eq!(replicas.len(), 4);

        let mut addresses: Vec<String> = replicas.iter().map(|p| p.address()).collect();
        addresses.dedup();
        assert_eq!(addresses.len(), 4, "no node appears twice");
    }

    #[test]
    fn successors_exclude_self_and_wrap() {
        let ring = ring_of(4);
        let some_process = ring.nodes()[2].process.clone();

        let successors = ring.find_successors(&some_process, 3);
        assert_eq!(successors.len(), 3);
        assert!(successors.iter().all(|p| !p.same_identity(&some_process)));

        // Asking for more than available stops at the wrap-around.
        let all = ring.find_successors(&some_process, 10);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn predecessor_requires_two_nodes() {
        let solo = ring_of(1);
        let process = solo.nodes()[0].process.clone();
        assert!(solo.find_predecessor(&process).is_none());

        let ring = ring_of(4);
        let process = ring.nodes()[0].process.clone();
        let predecessor = ring.find_predecessor(&process).expect("predecessor");
        assert!(predecessor.same_identity(&ring.nodes()[3].process));
    }

    #[test]
    fn route_is_first_replica() {
        let ring = ring_of(5);
        for key in ["a.txt", "b.txt", "weights/epoch-3"] {
            let primary = ring.route_process(key).expect("primary");
            let replicas = ring.find_replicas(key, 4);
            assert!(primary.same_identity(&replicas[0]));
        }
    }
}
