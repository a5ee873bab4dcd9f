use nalgebra_sparse::{CooMatrix, CscMatrix};

use crate::basic::circuit::NumericalCircuit;

/// Branch-bus incidence matrices of a circuit.
///
/// `cf`/`ct` only hold rows for branches that take part in the calculation
/// (see [`NumericalCircuit::branch_in_calculation`]); `cr` holds the active
/// reducible branches between active buses. Rows of excluded branches are
/// empty, so every matrix stays `m × n` and branch indices are preserved.
#[derive(Debug, Clone)]
pub struct Connectivity {
    pub cf: CscMatrix<f64>,
    pub ct: CscMatrix<f64>,
    pub cr: CscMatrix<f64>,
    pub in_calculation: Vec<bool>,
}

impl Connectivity {
    pub fn new(circuit: &NumericalCircuit) -> Self {
        let n = circuit.nbus();
        let br = &circuit.branch;
        let in_calculation: Vec<bool> = (0..circuit.nbranch())
            .map(|k| circuit.branch_in_calculation(k))
            .collect();
        let reducible: Vec<bool> = (0..circuit.nbranch())
            .map(|k| {
                br.active[k]
                    && br.reducible[k]
                    && br.f[k] != br.t[k]
                    && circuit.bus.active[br.f[k]]
                    && circuit.bus.active[br.t[k]]
            })
            .collect();

        let (cf, ct) = branch_incidence(&br.f, &br.t, &in_calculation, n);
        let cr = reducible_incidence(&br.f, &br.t, &reducible, n);
        Self {
            cf,
            ct,
            cr,
            in_calculation,
        }
    }

    /// Bus adjacency `A = Cᵀ C` with `C = Cf + Ct`.
    pub fn adjacency(&self) -> CscMatrix<f64> {
        let c = &self.cf + &self.ct;
        &c.transpose() * &c
    }

    /// Bus adjacency of the unreduced network, `Cᵀ C + Crᵀ Cr`: closed
    /// switches connect their buses here.
    pub fn topology_adjacency(&self) -> CscMatrix<f64> {
        &self.adjacency() + &self.reducible_adjacency()
    }

    /// Bus adjacency through reducible branches only, `Crᵀ Cr`.
    pub fn reducible_adjacency(&self) -> CscMatrix<f64> {
        &self.cr.transpose() * &self.cr
    }
}

/// From/to incidence (`m × n`) for the branches selected by `mask`.
pub fn branch_incidence(
    f: &[usize],
    t: &[usize],
    mask: &[bool],
    nbus: usize,
) -> (CscMatrix<f64>, CscMatrix<f64>) {
    let m = f.len();
    let mut cf = CooMatrix::new(m, nbus);
    let mut ct = CooMatrix::new(m, nbus);
    for k in (0..m).filter(|&k| mask[k]) {
        cf.push(k, f[k], 1.0);
        ct.push(k, t[k], 1.0);
    }
    (CscMatrix::from(&cf), CscMatrix::from(&ct))
}

/// Single incidence where both ends of a selected branch are marked with 1.
fn reducible_incidence(f: &[usize], t: &[usize], mask: &[bool], nbus: usize) -> CscMatrix<f64> {
    let m = f.len();
    let mut cr = CooMatrix::new(m, nbus);
    for k in (0..m).filter(|&k| mask[k]) {
        cr.push(k, f[k], 1.0);
        cr.push(k, t[k], 1.0);
    }
    CscMatrix::from(&cr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::circuit::{Branch, Bus};
    use nalgebra::DMatrix;

    #[test]
    fn test_incidence_skips_excluded_branches() {
        let mut c = NumericalCircuit::new(100.0);
        for _ in 0..4 {
            c.add_bus(Bus::pq());
        }
        c.add_branch(Branch::line(0, 1, 0.01, 0.1, 0.0));
        c.add_branch(Branch::switch(1, 2));
        c.add_branch(Branch::line(2, 3, 0.01, 0.1, 0.0));
        c.add_branch(Branch::line(3, 3, 0.01, 0.1, 0.0));
        c.bus.active[3] = false;

        let conn = Connectivity::new(&c);
        assert_eq!(conn.in_calculation, vec![true, false, false, false]);
        assert_eq!((conn.cf.nrows(), conn.cf.ncols()), (4, 4));
        assert_eq!(conn.cf.nnz(), 1);
        assert_eq!(conn.cr.nnz(), 2);

        let a = DMatrix::from(&conn.adjacency());
        assert_eq!(a[(0, 1)], 1.0);
        assert_eq!(a[(1, 0)], 1.0);
        assert_eq!(a[(1, 2)], 0.0);

        let ar = DMatrix::from(&conn.reducible_adjacency());
        assert_eq!(ar[(1, 2)], 1.0);
        assert_eq!(ar[(0, 1)], 0.0);

        let at = DMatrix::from(&conn.topology_adjacency());
        assert_eq!(at[(0, 1)], 1.0);
        assert_eq!(at[(1, 2)], 1.0);
        assert_eq!(at[(2, 3)], 0.0);
    }
}
