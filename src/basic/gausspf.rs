use std::time::Instant;

use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use num_complex::Complex64;

use super::error::Result;
use super::pf::{SolverConfig, SolverInput, SolverOutput};

/// `Ybus[k, :]·V` and `Ybus[k, k]`.
fn row_current(y: &CsrMatrix<Complex64>, v: &DVector<Complex64>, k: usize) -> (Complex64, Complex64) {
    let row = y.row(k);
    let mut ykk = Complex64::new(0.0, 0.0);
    let mut i = Complex64::new(0.0, 0.0);
    for (&c, &val) in row.col_indices().iter().zip(row.values()) {
        i += val * v[c];
        if c == k {
            ykk = val;
        }
    }
    (i, ykk)
}

/// Gauss-Seidel power flow, one iteration being a sweep over the PQ buses
/// followed by the PV buses.
///
/// At PV buses the reactive injection is taken from the current voltages
/// before the update and the magnitude is reset to its set point after it.
/// Convergence is linear, so expect far more iterations than Newton needs.
pub fn gauss_seidel_pf(input: &SolverInput, config: &SolverConfig) -> Result<SolverOutput> {
    let start = Instant::now();
    let pvpq = input.pvpq();
    let y = CsrMatrix::from(input.ybus);
    let v_set: Vec<f64> = input.pv.iter().map(|&b| input.v0[b].norm()).collect();

    let mut v = input.v0.clone();
    let mut error = input.mismatch(&v, &pvpq).error;
    let mut iterations = 0;

    while error > config.tolerance && iterations < config.max_iter && !pvpq.is_empty() {
        if config.is_cancelled() {
            return Ok(SolverOutput::new(v, error, config.tolerance, iterations)
                .cancelled()
                .with_elapsed(start.elapsed()));
        }
        for &k in input.pq {
            let s = input.s0[k] + input.i0[k] * v[k].norm();
            let (i, ykk) = row_current(&y, &v, k);
            if ykk.norm_sqr() > 0.0 {
                let vk = v[k];
                v[k] = vk + ((s / vk).conj() - i) / ykk;
            }
        }
        for (&k, &vs) in input.pv.iter().zip(&v_set) {
            let (i, ykk) = row_current(&y, &v, k);
            let q = (v[k] * i.conj()).im;
            let s = Complex64::new((input.s0[k] + input.i0[k] * v[k].norm()).re, q);
            if ykk.norm_sqr() > 0.0 {
                let vk = v[k];
                v[k] = vk + ((s / vk).conj() - i) / ykk;
            }
            v[k] = v[k] * (vs / v[k].norm());
        }
        iterations += 1;
        error = input.mismatch(&v, &pvpq).error;
        log::debug!("GS iteration {iterations}: error {error:.3e}");
    }

    let out = SolverOutput::new(v, error, config.tolerance, iterations).with_elapsed(start.elapsed());
    if !out.converged && config.is_cancelled() {
        return Ok(out.cancelled());
    }
    Ok(out)
}
