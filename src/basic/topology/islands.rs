use derive_more::derive::{Deref, DerefMut, From, Into};
use nalgebra_sparse::CscMatrix;
use serde::{Deserialize, Serialize};

/// Sorted bus indices of one connected component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, DerefMut, From, Into, Serialize, Deserialize)]
pub struct Island(Vec<usize>);

impl Island {
    pub fn buses(&self) -> &[usize] {
        &self.0
    }
}

/// Connected components of the graph given by a (symmetric) bus adjacency.
///
/// Inactive buses are never visited. Islands come out ordered by their
/// lowest bus and each island is sorted ascending. The traversal is a DFS
/// on an explicit stack over the CSC columns, O(n + nnz).
pub fn find_islands(adjacency: &CscMatrix<f64>, active: &[bool]) -> Vec<Island> {
    let n = adjacency.ncols();
    debug_assert_eq!(n, active.len());
    let mut visited = vec![false; n];
    let mut stack = Vec::with_capacity(n);
    let mut islands = Vec::new();

    for seed in 0..n {
        if visited[seed] || !active[seed] {
            continue;
        }
        let mut island = Vec::new();
        visited[seed] = true;
        stack.push(seed);
        while let Some(node) = stack.pop() {
            island.push(node);
            let col = adjacency.col(node);
            for &nb in col.row_indices() {
                if !visited[nb] && active[nb] {
                    visited[nb] = true;
                    stack.push(nb);
                }
            }
        }
        island.sort_unstable();
        islands.push(Island(island));
    }
    islands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::circuit::{Branch, Bus, NumericalCircuit};
    use crate::basic::system::Connectivity;

    #[test]
    fn test_islands_partition_active_buses() {
        let mut c = NumericalCircuit::new(100.0);
        for _ in 0..7 {
            c.add_bus(Bus::pq());
        }
        c.add_branch(Branch::line(0, 3, 0.01, 0.1, 0.0));
        c.add_branch(Branch::line(3, 5, 0.01, 0.1, 0.0));
        c.add_branch(Branch::line(1, 2, 0.01, 0.1, 0.0));
        let mut open = Branch::line(2, 4, 0.01, 0.1, 0.0);
        open.active = false;
        c.add_branch(open);
        c.bus.active[6] = false;

        let conn = Connectivity::new(&c);
        let islands = find_islands(&conn.adjacency(), &c.bus.active);
        let as_vec: Vec<Vec<usize>> = islands.iter().map(|i| i.to_vec()).collect();
        assert_eq!(as_vec, vec![vec![0, 3, 5], vec![1, 2], vec![4]]);

        let mut all: Vec<usize> = islands.iter().flat_map(|i| i.iter().copied()).collect();
        all.sort_unstable();
        let active: Vec<usize> = (0..7).filter(|&i| c.bus.active[i]).collect();
        assert_eq!(all, active);
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        let n = 20_000;
        let mut c = NumericalCircuit::new(100.0);
        for _ in 0..n {
            c.add_bus(Bus::pq());
        }
        for k in 1..n {
            c.add_branch(Branch::line(k - 1, k, 0.01, 0.1, 0.0));
        }
        let conn = Connectivity::new(&c);
        let islands = find_islands(&conn.adjacency(), &c.bus.active);
        assert_eq!(islands.len(), 1);
        assert_eq!(islands[0].len(), n);
    }
}
