//! Holomorphic embedding load flow.
//!
//! The voltages of the non-slack buses are expanded as a power series `U(s)`
//! of the embedding parameter, with `X(s) = 1/conj(U(s))` and, for PV buses,
//! a series `Q(s)` of the unknown reactive injections. At `s = 0` the grid
//! is unloaded and the solution is linear; every further order costs one
//! solve with a constant real matrix. The value at `s = 1` is obtained by
//! Padé approximation or Wynn's epsilon algorithm on the partial sums.

use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CscMatrix};
use num_complex::Complex64;

use super::error::{PowerFlowError, Result};
use super::options::HelmExtrapolation;
use super::pf::{SolverConfig, SolverInput, SolverOutput};
use super::solver::Solve;
use super::sparse::{conj::RealImag, slice::select, stack::csc_bmat};

const ZERO: Complex64 = Complex64::new(0.0, 0.0);

/// Coefficient series of one run, rows are orders and columns the PV
/// buses followed by the PQ buses.
#[derive(Debug, Clone)]
pub struct HelmSeries {
    pub u: DMatrix<Complex64>,
    pub x: DMatrix<Complex64>,
    pub q: DMatrix<Complex64>,
    /// Index of the last computed order of `u`.
    pub last: usize,
}

/// `Σ_{k=1..c} conj(A[k])·B[c-k]`
fn conv1(a: &DMatrix<Complex64>, b: &DMatrix<Complex64>, c: usize, d: usize) -> Complex64 {
    (1..=c).map(|k| a[(k, d)].conj() * b[(c - k, d)]).sum()
}

/// `Σ_{k=1..c-1} A[k]·B[c-1-k]`
fn conv2(a: &DMatrix<Complex64>, b: &DMatrix<Complex64>, c: usize, d: usize) -> Complex64 {
    (1..c).map(|k| a[(k, d)] * b[(c - 1 - k, d)]).sum()
}

/// `Σ_{k=1..c-1} A[k]·conj(B[c-k])`
fn conv3(a: &DMatrix<Complex64>, b: &DMatrix<Complex64>, c: usize, d: usize) -> Complex64 {
    (1..c).map(|k| a[(k, d)] * b[(c - k, d)].conj()).sum()
}

/// Real `2m × 2m` form `[[G, -B], [B, G]]` of a complex matrix.
fn realify(y: &CscMatrix<Complex64>) -> (CscMatrix<f64>, CscMatrix<f64>, CscMatrix<f64>) {
    let g = y.real();
    let b = y.imag();
    let neg_b = &b * -1.0;
    (g, b, neg_b)
}

/// Diagonal-like `rows × cols` block with `values[k]` at `(r(k), c(k))`.
fn sparse_block(
    rows: usize,
    cols: usize,
    values: impl Iterator<Item = (usize, usize, f64)>,
) -> CscMatrix<f64> {
    let mut coo = CooMatrix::new(rows, cols);
    values.for_each(|(r, c, v)| coo.push(r, c, v));
    CscMatrix::from(&coo)
}

fn split(v: &[f64], m: usize) -> impl Iterator<Item = Complex64> + '_ {
    (0..m).map(move |i| Complex64::new(v[i], v[m + i]))
}

/// Computes the coefficient series until the partial sum satisfies the
/// tolerance with an odd last order, `max_coefficients` is reached or the
/// sum blows up.
pub fn helm_coefficients<S: Solve + Default>(
    input: &SolverInput,
    config: &SolverConfig,
    solver: &mut S,
) -> Result<(HelmSeries, DVector<Complex64>, bool)> {
    let idx = input.pvpq();
    let npv = input.pv.len();
    let m = idx.len();
    let max_c = config.helm_max_coefficients;
    let vm0 = input.v0.map(|c| c.norm());
    let sbus = input.sbus(&vm0);

    let mut u = DMatrix::from_element(max_c + 1, m, ZERO);
    let mut x = DMatrix::from_element(max_c + 1, m, ZERO);
    let mut q = DMatrix::from_element(max_c + 1, m, ZERO);

    let yred = select(input.yseries, &idx, &idx);
    let yslack = select(input.yseries, &idx, input.slack) * Complex64::new(-1.0, 0.0);
    let vslack = DVector::from_iterator(input.slack.len(), input.slack.iter().map(|&b| input.v0[b]));
    let ysl_sum = &yslack * &DVector::from_element(input.slack.len(), Complex64::new(1.0, 0.0));
    let i_inj_slack = &yslack * &vslack;
    let p: Vec<f64> = idx.iter().map(|&b| sbus[b].re).collect();
    let qs: Vec<f64> = idx.iter().map(|&b| sbus[b].im).collect();
    let w: Vec<f64> = idx.iter().map(|&b| vm0[b] * vm0[b]).collect();
    let ysh: Vec<Complex64> = idx.iter().map(|&b| input.yshunt[b]).collect();

    let (g, b, neg_b) = realify(&yred);

    // order 0: the unloaded grid
    let mut base = S::default();
    base.factorize(&csc_bmat(&[&[&g, &neg_b], &[&b, &g]]))?;
    let mut rhs: Vec<f64> = ysl_sum.iter().map(|c| c.re).chain(ysl_sum.iter().map(|c| c.im)).collect();
    base.solve_factored(&mut rhs)?;
    for (d, val) in split(&rhs, m).enumerate() {
        u[(0, d)] = val;
        x[(0, d)] = 1.0 / val.conj();
    }

    // the augmented system, constant for every order >= 1
    let vre = sparse_block(npv, m, (0..npv).map(|k| (k, k, 2.0 * u[(0, k)].re)));
    let vim = sparse_block(npv, m, (0..npv).map(|k| (k, k, 2.0 * u[(0, k)].im)));
    let xim = sparse_block(m, npv, (0..npv).map(|k| (k, k, -x[(0, k)].im)));
    let xre = sparse_block(m, npv, (0..npv).map(|k| (k, k, x[(0, k)].re)));
    let empty = CscMatrix::zeros(npv, npv);
    let mat = csc_bmat(&[&[&g, &neg_b, &xim], &[&b, &g, &xre], &[&vre, &vim, &empty]]);
    solver.factorize(&mat)?;

    let solve_order = |solver: &S, valor: &[Complex64], tail: &[f64]| -> Result<Vec<f64>> {
        let mut rhs: Vec<f64> = valor
            .iter()
            .map(|c| c.re)
            .chain(valor.iter().map(|c| c.im))
            .chain(tail.iter().copied())
            .collect();
        solver.solve_factored(&mut rhs)?;
        Ok(rhs)
    };

    // order 1
    let valor: Vec<Complex64> = (0..m)
        .map(|d| {
            let injection = if d < npv {
                Complex64::new(p[d], 0.0)
            } else {
                Complex64::new(p[d], -qs[d])
            };
            i_inj_slack[d] - ysl_sum[d] + injection * x[(0, d)] - u[(0, d)] * ysh[d]
        })
        .collect();
    let tail: Vec<f64> = (0..npv).map(|k| w[k] - (u[(0, k)] * u[(0, k)]).re).collect();
    let lhs = solve_order(solver, &valor, &tail)?;
    for (d, val) in split(&lhs, m).enumerate() {
        u[(1, d)] = val;
    }
    for k in 0..npv {
        q[(0, k)] = Complex64::new(lhs[2 * m + k], 0.0);
    }
    for d in 0..m {
        x[(1, d)] = -x[(0, d)] * u[(1, d)].conj() / u[(0, d)].conj();
    }

    let mut v = input.v0.clone();
    for (d, &bus) in idx.iter().enumerate() {
        v[bus] = u[(0, d)] + u[(1, d)];
    }
    let mut converged = false;
    let mut last = 1;
    let mut c = 2;
    while c <= max_c && !converged {
        if config.is_cancelled() {
            return Ok((HelmSeries { u, x, q, last }, v, true));
        }
        let valor: Vec<Complex64> = (0..m)
            .map(|d| {
                if d < npv {
                    -Complex64::i() * conv2(&x, &q, c, d) - u[(c - 1, d)] * ysh[d] + x[(c - 1, d)] * p[d]
                } else {
                    Complex64::new(p[d], -qs[d]) * x[(c - 1, d)] - u[(c - 1, d)] * ysh[d]
                }
            })
            .collect();
        let tail: Vec<f64> = (0..npv).map(|k| -conv3(&u, &u, c, k).re).collect();
        let lhs = solve_order(solver, &valor, &tail)?;
        for (d, val) in split(&lhs, m).enumerate() {
            u[(c, d)] = val;
        }
        for k in 0..npv {
            q[(c - 1, k)] = Complex64::new(lhs[2 * m + k], 0.0);
        }
        for d in 0..m {
            x[(c, d)] = -conv1(&u, &x, c, d) / u[(0, d)].conj();
        }
        for (d, &bus) in idx.iter().enumerate() {
            v[bus] += u[(c, d)];
        }
        last = c;

        if v.iter().map(|z| z.re).fold(f64::MIN, f64::max) < 10.0 {
            let error = input.error_of(&v);
            converged = error <= config.tolerance && c % 2 == 1;
            log::debug!("HELM order {c}: error {error:.3e}");
        } else {
            log::warn!("HELM series diverges at order {c}");
            break;
        }
        c += 1;
    }
    Ok((HelmSeries { u, x, q, last }, v, false))
}

/// Padé approximant `[L/L]` at `s = 1` of the series `coeff[0..=order]`,
/// with `L = order/2`. `None` when the denominator system is singular.
pub fn pade(coeff: &[Complex64], order: usize) -> Option<Complex64> {
    let l = order / 2;
    if l == 0 {
        return Some(coeff.iter().take(order + 1).sum());
    }
    let c = DMatrix::from_fn(l, l, |i, j| coeff[i + 1 + j]);
    let rhs = DVector::from_fn(l, |i, _| -coeff[l + 1 + i]);
    let sol = c.lu().solve(&rhs)?;
    let mut bq = vec![Complex64::new(1.0, 0.0)];
    bq.extend(sol.iter().rev());
    let mut pa = vec![coeff[0]];
    for k in 1..=l {
        pa.push((0..=k).map(|j| coeff[k - j] * bq[j]).sum());
    }
    let num: Complex64 = pa.iter().sum();
    let den: Complex64 = bq.iter().sum();
    let val = num / den;
    (val.re.is_finite() && val.im.is_finite()).then_some(val)
}

/// Wynn's epsilon algorithm on the partial sums of `coeff[0..=order]`,
/// in the backward form given by E. J. Weniger, "Nonlinear sequence
/// transformations for the acceleration of convergence and the summation
/// of divergent series", Comput. Phys. Rep. 10 (1989).
pub fn wynn(coeff: &[Complex64], order: usize) -> Complex64 {
    let tiny = Complex64::new(f64::MIN_POSITIVE, 0.0);
    let huge = Complex64::new(f64::MAX, 0.0);
    let mut e = vec![ZERO; order + 1];
    let mut sn = ZERO;
    let mut estimate = ZERO;
    for n in 0..=order {
        sn += coeff[n];
        e[n] = sn;
        if n == 0 {
            estimate = sn;
            continue;
        }
        let mut aux2 = ZERO;
        for j in (1..=n).rev() {
            let aux1 = aux2;
            aux2 = e[j - 1];
            let mut diff = e[j] - aux2;
            if diff.norm() <= tiny.re {
                e[j - 1] = huge;
            } else {
                if diff == ZERO {
                    diff = tiny;
                }
                e[j - 1] = aux1 + 1.0 / diff;
            }
        }
        estimate = if n % 2 == 0 { e[0] } else { e[1] };
    }
    estimate
}

/// Holomorphic embedding power flow.
///
/// PQ-only islands are solved reliably. The PV extension is best-effort:
/// the error is always assessed afterwards against the AC equations and a
/// poor result simply comes back as not converged.
pub fn helm_pf<S: Solve + Default>(input: &SolverInput, config: &SolverConfig) -> Result<SolverOutput> {
    let start = Instant::now();
    let idx = input.pvpq();
    if idx.is_empty() || input.slack.is_empty() {
        let error = input.error_of(input.v0);
        return Ok(SolverOutput::new(input.v0.clone(), error, config.tolerance, 0).with_elapsed(start.elapsed()));
    }

    let mut solver = S::default();
    let (series, v_sum, cancelled) = helm_coefficients(input, config, &mut solver)
        .map_err(|e| match e {
            PowerFlowError::Factorization(_) => PowerFlowError::SingularJacobian { iteration: 0 },
            e => e,
        })?;
    let iterations = series.last;
    let sum_error = input.error_of(&v_sum);
    if cancelled {
        return Ok(SolverOutput::new(v_sum, sum_error, config.tolerance, iterations)
            .cancelled()
            .with_elapsed(start.elapsed()));
    }

    let mut degenerate = false;
    let mut v = input.v0.clone();
    for (d, &bus) in idx.iter().enumerate() {
        let coeff: Vec<Complex64> = series.u.column(d).iter().copied().collect();
        let value = match config.helm_extrapolation {
            HelmExtrapolation::Pade => pade(&coeff, series.last),
            HelmExtrapolation::Wynn => Some(wynn(&coeff, series.last)),
        };
        match value {
            Some(val) => v[bus] = val,
            None => {
                degenerate = true;
                v[bus] = v_sum[bus];
            }
        }
    }
    if degenerate {
        log::warn!("Padé approximation is singular, the series sum is used instead");
    }

    let error = input.error_of(&v);
    let (v, error) = if error <= sum_error { (v, error) } else { (v_sum, sum_error) };
    let mut out = SolverOutput::new(v, error, config.tolerance, iterations).with_elapsed(start.elapsed());
    out.degenerate = degenerate;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::newtonpf::newton_pf;
    use crate::basic::pf::IslandModel;
    use crate::basic::solver::DefaultSolver;
    use crate::testcases;
    use approx::assert_relative_eq;

    fn geometric(n: usize, r: f64) -> Vec<Complex64> {
        (0..n).map(|k| Complex64::new(r.powi(k as i32), 0.0)).collect()
    }

    #[test]
    fn test_pade_and_wynn_sum_geometric_series() {
        // 1/(1 - r) at s = 1
        let coeff = geometric(3, 0.5);
        assert_relative_eq!(pade(&coeff, 2).unwrap().re, 2.0, epsilon = 1e-12);
        assert_relative_eq!(wynn(&coeff, 2).re, 2.0, epsilon = 1e-12);
        // outside the radius of convergence Padé still finds the pole form
        let coeff = geometric(3, 3.0);
        assert_relative_eq!(pade(&coeff, 2).unwrap().re, -0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_acceleration_of_a_slow_series() {
        // ln(1 + s) at s = 1
        let coeff: Vec<Complex64> = (0..9)
            .map(|k| match k {
                0 => ZERO,
                k => Complex64::new(if k % 2 == 1 { 1.0 } else { -1.0 } / k as f64, 0.0),
            })
            .collect();
        let ln2 = std::f64::consts::LN_2;
        let plain: Complex64 = coeff.iter().sum();
        assert!((plain.re - ln2).abs() > 1e-2);
        assert!((pade(&coeff, 8).unwrap().re - ln2).abs() < 1e-5);
        assert!((wynn(&coeff, 8).re - ln2).abs() < 1e-5);
    }

    #[test]
    fn test_pade_singular_is_none() {
        let coeff = vec![Complex64::new(1.0, 0.0), ZERO, ZERO, ZERO, ZERO];
        assert!(pade(&coeff, 4).is_none());
    }

    #[test]
    fn test_helm_matches_nr_on_radial_pq() {
        let model = IslandModel::new(testcases::radial_pq()).unwrap();
        let v0 = model.flat_start();
        let input = model.input(&v0);
        let config = SolverConfig {
            tolerance: 1e-9,
            ..Default::default()
        };
        let nr = newton_pf(&input, &config, &mut DefaultSolver::default()).unwrap();
        for extrapolation in [HelmExtrapolation::Pade, HelmExtrapolation::Wynn] {
            let config = SolverConfig {
                helm_extrapolation: extrapolation,
                ..config.clone()
            };
            let out = helm_pf::<DefaultSolver>(&input, &config).unwrap();
            assert!(out.converged, "{extrapolation:?} error {}", out.error);
            for (a, b) in nr.v.iter().zip(out.v.iter()) {
                assert!((a - b).norm() < 1e-6);
            }
        }
    }

    #[test]
    fn test_helm_with_pv_bus_is_consistent() {
        let model = IslandModel::new(testcases::five_bus()).unwrap();
        let v0 = model.flat_start();
        let input = model.input(&v0);
        let out = helm_pf::<DefaultSolver>(&input, &SolverConfig::default()).unwrap();
        // best effort: whatever comes back must be honestly assessed
        assert_relative_eq!(out.error, input.error_of(&out.v));
        assert_eq!(out.converged, out.error < 1e-6);
    }
}
