use std::time::Instant;

use nalgebra::DVector;
use num_complex::Complex64;

use super::dsbus_dv::{dIbus_dV, unit_phasors};
use super::error::{PowerFlowError, Result};
use super::jacobian::assemble;
use super::mismatch::{compute_fx, inf_norm};
use super::newtonpf::polar;
use super::pf::{SolverConfig, SolverInput, SolverOutput};
use super::solver::Solve;
use super::sparse::diag;

/// Specified current injection `conj(S/V) + conj(I0)·V/|V|`.
fn current_spec(s: &DVector<Complex64>, i0: &DVector<Complex64>, v: &DVector<Complex64>) -> DVector<Complex64> {
    let vn = unit_phasors(v);
    DVector::from_iterator(
        v.len(),
        (0..v.len()).map(|k| (s[k] / v[k]).conj() + i0[k].conj() * vn[k]),
    )
}

/// `[Re ΔI(pvpq), Im ΔI(pq)]` with `ΔI = Ispec - Ybus·V`.
fn current_mismatch(
    input: &SolverInput,
    s: &DVector<Complex64>,
    v: &DVector<Complex64>,
    pvpq: &[usize],
) -> DVector<f64> {
    let di = current_spec(s, input.i0, v) - input.ybus * v;
    compute_fx(&di, pvpq, input.pq)
}

/// Newton-Raphson on the current balance `conj(S/V) − Ybus·V = 0`.
///
/// The reactive power of the PV buses is unknown in this formulation, so it
/// is replaced by the computed one before every iteration. The step is
/// backtracked (`µ ← µ/4`) while the current mismatch grows. Convergence is
/// judged on the power mismatch, like the other methods.
pub fn newton_pf_current<S: Solve>(
    input: &SolverInput,
    config: &SolverConfig,
    solver: &mut S,
) -> Result<SolverOutput> {
    let start = Instant::now();
    let pvpq = input.pvpq();
    let pq = input.pq;
    let npvpq = pvpq.len();

    let mut v = input.v0.clone();
    let mut s = input.s0.clone();
    let mut m = input.mismatch(&v, &pvpq);
    let mut iterations = 0;

    while m.error > config.tolerance && iterations < config.max_iter && npvpq > 0 {
        if config.is_cancelled() {
            return Ok(SolverOutput::new(v, m.error, config.tolerance, iterations)
                .cancelled()
                .with_elapsed(start.elapsed()));
        }
        // PV reactive power from the network
        for &b in input.pv {
            s[b].im = m.scalc[b].im;
        }
        let f = current_mismatch(input, &s, &v, &pvpq);
        let norm_f = inf_norm(&f);

        let (di_dvm, di_dva) = dIbus_dV(input.ybus, &v);
        let (disp_dvm, disp_dva): (Vec<_>, Vec<_>) = (0..v.len())
            .map(|k| {
                let vc = v[k].conj();
                let vm = v[k].norm();
                let dvm = if vm > 0.0 { -s[k].conj() / (vc * vm) } else { Complex64::new(0.0, 0.0) };
                let vn = if vm > 0.0 { v[k] / vm } else { Complex64::new(0.0, 0.0) };
                let dva = Complex64::i() * (s[k].conj() / vc + input.i0[k].conj() * vn);
                (dvm, dva)
            })
            .unzip();
        let d_dvm = &di_dvm - &diag(&disp_dvm);
        let d_dva = &di_dva - &diag(&disp_dva);
        let j = assemble(&d_dvm, &d_dva, &pvpq, pq);

        let mut dx = f.clone();
        solver
            .solve(&j, dx.as_mut_slice())
            .map_err(|_| PowerFlowError::SingularJacobian { iteration: iterations })?;

        let vm = v.map(|c| c.norm());
        let va = v.map(|c| c.arg());
        let step = |mu: f64| {
            let mut vm = vm.clone();
            let mut va = va.clone();
            pvpq.iter().enumerate().for_each(|(k, &b)| va[b] += mu * dx[k]);
            pq.iter().enumerate().for_each(|(k, &b)| vm[b] += mu * dx[npvpq + k]);
            let v_new = polar(&vm, &va);
            let f_new = inf_norm(&current_mismatch(input, &s, &v_new, &pvpq));
            (v_new, f_new)
        };

        let mut mu = 1.0;
        let (mut v_new, mut f_new) = step(mu);
        let mut tries = 0;
        while !(f_new < norm_f) && tries < 10 && mu > 0.01 {
            mu *= 0.25;
            tries += 1;
            (v_new, f_new) = step(mu);
        }

        v = v_new;
        m = input.mismatch(&v, &pvpq);
        iterations += 1;
        log::debug!(
            "current NR iteration {iterations}: |dI| {f_new:.3e}, error {:.3e}, mu {mu}",
            m.error
        );
    }

    let out = SolverOutput::new(v, m.error, config.tolerance, iterations).with_elapsed(start.elapsed());
    if !out.converged && config.is_cancelled() {
        return Ok(out.cancelled());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::newtonpf::newton_pf;
    use crate::basic::pf::IslandModel;
    use crate::basic::solver::DefaultSolver;
    use crate::testcases;

    #[test]
    fn test_current_nr_matches_power_nr() {
        for circuit in [testcases::three_bus(), testcases::five_bus()] {
            let model = IslandModel::new(circuit).unwrap();
            let v0 = model.flat_start();
            let input = model.input(&v0);
            let config = SolverConfig {
                max_iter: 40,
                ..Default::default()
            };
            let reference = newton_pf(&input, &config, &mut DefaultSolver::default()).unwrap();
            let out = newton_pf_current(&input, &config, &mut DefaultSolver::default()).unwrap();
            assert!(out.converged);
            for (a, b) in reference.v.iter().zip(out.v.iter()) {
                assert!((a - b).norm() < 1e-5);
            }
        }
    }

    #[test]
    fn test_zip_current_component() {
        let mut circuit = testcases::radial_pq();
        circuit.load.i[0] = Complex64::new(10.0, 3.0);
        let model = IslandModel::new(circuit).unwrap();
        let v0 = model.flat_start();
        let out = newton_pf_current(&model.input(&v0), &SolverConfig::default(), &mut DefaultSolver::default())
            .unwrap();
        assert!(out.converged);
        let input = model.input(&v0);
        assert!(input.error_of(&out.v) < 1e-6);
    }
}
