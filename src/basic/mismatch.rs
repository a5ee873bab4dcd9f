use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use super::pf::SolverInput;

/// Power injected by the network, `V·conj(Ybus·V)`.
pub fn compute_power(ybus: &CscMatrix<Complex64>, v: &DVector<Complex64>) -> DVector<Complex64> {
    v.component_mul(&(ybus * v).conjugate())
}

/// Mismatch vector `[Re ΔS(pvpq), Im ΔS(pq)]`.
pub fn compute_fx(mis: &DVector<Complex64>, pvpq: &[usize], pq: &[usize]) -> DVector<f64> {
    DVector::from_iterator(
        pvpq.len() + pq.len(),
        pvpq.iter()
            .map(|&i| mis[i].re)
            .chain(pq.iter().map(|&i| mis[i].im)),
    )
}

/// Infinity norm, zero for an empty vector.
pub fn inf_norm(fx: &DVector<f64>) -> f64 {
    fx.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

/// Power mismatch of a voltage vector.
#[derive(Debug, Clone)]
pub struct Mismatch {
    /// Computed injection.
    pub scalc: DVector<Complex64>,
    /// `scalc - sbus(|V|)` at every bus.
    pub mis: DVector<Complex64>,
    pub fx: DVector<f64>,
    pub error: f64,
}

impl SolverInput<'_> {
    pub fn mismatch(&self, v: &DVector<Complex64>, pvpq: &[usize]) -> Mismatch {
        let scalc = compute_power(self.ybus, v);
        let mis = &scalc - self.sbus(&v.map(|c| c.norm()));
        let fx = compute_fx(&mis, pvpq, self.pq);
        let error = inf_norm(&fx);
        Mismatch {
            scalc,
            mis,
            fx,
            error,
        }
    }

    /// Mismatch error of `v` against the full AC equations.
    pub fn error_of(&self, v: &DVector<Complex64>) -> f64 {
        self.mismatch(v, &self.pvpq()).error
    }
}
