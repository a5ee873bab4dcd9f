use std::time::Instant;

use nalgebra::DVector;

use super::error::{PowerFlowError, Result};
use super::newtonpf::polar;
use super::pf::{SolverConfig, SolverInput, SolverOutput};
use super::solver::Solve;
use super::sparse::slice::select;
use super::system::{DecoupledScheme, fast_decoupled_matrices, linear_matrices};

/// DC angles `θ[pvpq] = B[pvpq, pvpq]⁻¹·(P − Pshift − B[pvpq, slack]·θslack)`,
/// returned as full-length magnitude and angle vectors.
fn dc_angles<S: Solve>(input: &SolverInput, solver: &mut S) -> Result<(DVector<f64>, DVector<f64>)> {
    let pvpq = input.pvpq();
    let lin = linear_matrices(input.circuit, input.conn)?;
    let vm = input.v0.map(|c| c.norm());
    let mut va = input.v0.map(|c| c.arg());
    if pvpq.is_empty() {
        return Ok((vm, va));
    }

    let p = input.sbus(&vm).map(|s| s.re);
    let theta_slack = DVector::from_iterator(input.slack.len(), input.slack.iter().map(|&b| va[b]));
    let coupling = &select(&lin.bbus, &pvpq, input.slack) * &theta_slack;
    let mut rhs: Vec<f64> = pvpq
        .iter()
        .enumerate()
        .map(|(k, &b)| p[b] - lin.pbus_shift[b] - coupling[k])
        .collect();

    solver
        .solve(&select(&lin.bbus, &pvpq, &pvpq), &mut rhs)
        .map_err(|_| PowerFlowError::SingularJacobian { iteration: 0 })?;
    pvpq.iter().zip(rhs).for_each(|(&b, theta)| va[b] = theta);
    Ok((vm, va))
}

fn linear_output(input: &SolverInput, vm: &DVector<f64>, va: &DVector<f64>, start: Instant) -> SolverOutput {
    let v = polar(vm, va);
    let error = input.error_of(&v);
    let mut out = SolverOutput::new(v, error, f64::INFINITY, 1).with_elapsed(start.elapsed());
    // a linear solution is final by construction
    out.converged = true;
    out
}

/// DC power flow: lossless, flat magnitudes, angles from one linear solve.
///
/// The reported error is the AC mismatch of the DC voltages.
pub fn dc_pf<S: Solve>(input: &SolverInput, config: &SolverConfig, solver: &mut S) -> Result<SolverOutput> {
    let start = Instant::now();
    if config.is_cancelled() {
        let error = input.error_of(input.v0);
        return Ok(SolverOutput::new(input.v0.clone(), error, config.tolerance, 0).cancelled());
    }
    let (vm, va) = dc_angles(input, solver)?;
    let out = linear_output(input, &vm, &va, start);
    log::debug!("DC power flow: AC error {:.3e}", out.error);
    Ok(out)
}

/// Linear AC power flow: the DC angles followed by one magnitude correction
/// `B''[pq, pq]·ΔVm = ΔQ/|V|` at the PQ buses.
pub fn linear_ac_pf<S: Solve + Default>(
    input: &SolverInput,
    config: &SolverConfig,
    solver: &mut S,
) -> Result<SolverOutput> {
    let start = Instant::now();
    if config.is_cancelled() {
        let error = input.error_of(input.v0);
        return Ok(SolverOutput::new(input.v0.clone(), error, config.tolerance, 0).cancelled());
    }
    let (mut vm, va) = dc_angles(input, solver)?;
    let pq = input.pq;
    if !pq.is_empty() {
        let (_, bpp) = fast_decoupled_matrices(input.circuit, input.conn, input.y0, DecoupledScheme::XB)?;
        let v = polar(&vm, &va);
        let mis = super::mismatch::compute_power(input.ybus, &v) - input.sbus(&vm);
        let mut dvm: Vec<f64> = pq.iter().map(|&b| mis[b].im / vm[b]).collect();
        let mut q_solver = S::default();
        q_solver
            .solve(&select(&bpp, pq, pq), &mut dvm)
            .map_err(|_| PowerFlowError::SingularJacobian { iteration: 0 })?;
        pq.iter().zip(dvm).for_each(|(&b, d)| vm[b] -= d);
    }
    let out = linear_output(input, &vm, &va, start);
    log::debug!("linear AC power flow: AC error {:.3e}", out.error);
    Ok(out)
}
