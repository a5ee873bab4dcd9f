use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use super::connectivity::Connectivity;
use crate::basic::circuit::NumericalCircuit;
use crate::basic::error::{PowerFlowError, Result};
use crate::basic::sparse::{cast::Cast, conj::RealImag, diag};

/// Simplifications applied when computing the branch primitives.
#[derive(Debug, Clone, Copy, Default)]
struct Simplify {
    no_resistance: bool,
    no_charging: bool,
    no_taps: bool,
    no_shift: bool,
}

/// Per-branch two-port admittances; branches outside the calculation are 0.
#[derive(Debug, Clone)]
pub struct BranchPrimitives {
    pub yff: DVector<Complex64>,
    pub yft: DVector<Complex64>,
    pub ytf: DVector<Complex64>,
    pub ytt: DVector<Complex64>,
    /// Charging legs after tap scaling, the shunt part of `yff`/`ytt`.
    pub ysh_f: DVector<Complex64>,
    pub ysh_t: DVector<Complex64>,
}

impl BranchPrimitives {
    fn compute(
        circuit: &NumericalCircuit,
        in_calculation: &[bool],
        simplify: Simplify,
    ) -> Result<Self> {
        let br = &circuit.branch;
        let m = circuit.nbranch();
        let zero = Complex64::new(0.0, 0.0);
        let mut p = Self {
            yff: DVector::from_element(m, zero),
            yft: DVector::from_element(m, zero),
            ytf: DVector::from_element(m, zero),
            ytt: DVector::from_element(m, zero),
            ysh_f: DVector::from_element(m, zero),
            ysh_t: DVector::from_element(m, zero),
        };
        for k in (0..m).filter(|&k| in_calculation[k]) {
            if br.r[k] == 0.0 && br.x[k] == 0.0 {
                return Err(PowerFlowError::ZeroImpedanceBranch { branch: k });
            }
            let r = if simplify.no_resistance { 0.0 } else { br.r[k] };
            let z = Complex64::new(r, br.x[k]);
            let ys = if z.norm_sqr() > 0.0 { z.inv() } else { zero };
            let gbc2 = if simplify.no_charging {
                zero
            } else {
                Complex64::new(br.g[k], br.b[k]) / 2.0
            };
            let (m_tap, vtf, vtt) = if simplify.no_taps {
                (1.0, 1.0, 1.0)
            } else {
                (br.tap_module[k], br.vtap_f[k], br.vtap_t[k])
            };
            let tau = if simplify.no_shift { 0.0 } else { br.tap_angle[k] };
            let tap = Complex64::from_polar(m_tap, tau);

            let ff = vtf * vtf * (tap * tap.conj());
            p.ysh_f[k] = gbc2 / ff;
            p.ysh_t[k] = gbc2 / (vtt * vtt);
            p.yff[k] = (ys + gbc2) / ff;
            p.ytt[k] = (ys + gbc2) / (vtt * vtt);
            p.yft[k] = -ys / (vtf * vtt * tap.conj());
            p.ytf[k] = -ys / (vtt * vtf * tap);
        }
        Ok(p)
    }
}

/// `Yf = diag(a)·Cf + diag(b)·Ct`
fn branch_matrix(
    cf: &CscMatrix<Complex64>,
    ct: &CscMatrix<Complex64>,
    a: &DVector<Complex64>,
    b: &DVector<Complex64>,
) -> CscMatrix<Complex64> {
    &(&diag(a.as_slice()) * cf) + &(&diag(b.as_slice()) * ct)
}

/// `Cfᵀ·Yf + Ctᵀ·Yt`
fn bus_matrix(
    cf: &CscMatrix<Complex64>,
    ct: &CscMatrix<Complex64>,
    yf: &CscMatrix<Complex64>,
    yt: &CscMatrix<Complex64>,
) -> CscMatrix<Complex64> {
    &(&cf.transpose() * yf) + &(&ct.transpose() * yt)
}

/// Admittance matrices of a circuit (or of one island slice).
#[derive(Debug, Clone)]
pub struct AdmittanceBundle {
    pub ybus: CscMatrix<Complex64>,
    pub yf: CscMatrix<Complex64>,
    pub yt: CscMatrix<Complex64>,
    /// Series part of `ybus`, used by the holomorphic embedding.
    pub yseries: CscMatrix<Complex64>,
    /// `ybus = yseries + diag(yshunt)`.
    pub yshunt: DVector<Complex64>,
    pub primitives: BranchPrimitives,
}

impl AdmittanceBundle {
    /// Assembles the bundle. `y_bus_shunt` is the per-bus shunt admittance
    /// (p.u.) from bus shunts, shunt devices and constant-impedance loads.
    ///
    /// Fails with [`PowerFlowError::ZeroImpedanceBranch`] when a branch in
    /// the calculation has `R == X == 0`.
    pub fn new(
        circuit: &NumericalCircuit,
        conn: &Connectivity,
        y_bus_shunt: &DVector<Complex64>,
    ) -> Result<Self> {
        let primitives =
            BranchPrimitives::compute(circuit, &conn.in_calculation, Simplify::default())?;
        let (cf, ct) = (conn.cf.cast(), conn.ct.cast());

        let yf = branch_matrix(&cf, &ct, &primitives.yff, &primitives.yft);
        let yt = branch_matrix(&cf, &ct, &primitives.ytf, &primitives.ytt);
        let ybus = &bus_matrix(&cf, &ct, &yf, &yt) + &diag(y_bus_shunt.as_slice());

        let yfs = branch_matrix(&cf, &ct, &(&primitives.yff - &primitives.ysh_f), &primitives.yft);
        let yts = branch_matrix(&cf, &ct, &primitives.ytf, &(&primitives.ytt - &primitives.ysh_t));
        let yseries = bus_matrix(&cf, &ct, &yfs, &yts);
        let yshunt = y_bus_shunt
            + &conn.cf.transpose().cast() * &primitives.ysh_f
            + &conn.ct.transpose().cast() * &primitives.ysh_t;

        Ok(Self {
            ybus,
            yf,
            yt,
            yseries,
            yshunt,
            primitives,
        })
    }
}

/// Fast-decoupled scheme: which matrix drops the branch resistance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoupledScheme {
    /// `B'` without resistance.
    XB,
    /// `B''` without resistance.
    BX,
}

/// Builds `B'` and `B''` (full `n × n`, to be sliced by the caller).
///
/// `B'` ignores shunts, line charging and taps; `B''` ignores phase shifts.
pub fn fast_decoupled_matrices(
    circuit: &NumericalCircuit,
    conn: &Connectivity,
    y_bus_shunt: &DVector<Complex64>,
    scheme: DecoupledScheme,
) -> Result<(CscMatrix<f64>, CscMatrix<f64>)> {
    let (cf, ct) = (conn.cf.cast(), conn.ct.cast());
    let imag_ybus = |simplify: Simplify, shunt: Option<&DVector<Complex64>>| -> Result<CscMatrix<f64>> {
        let p = BranchPrimitives::compute(circuit, &conn.in_calculation, simplify)?;
        let yf = branch_matrix(&cf, &ct, &p.yff, &p.yft);
        let yt = branch_matrix(&cf, &ct, &p.ytf, &p.ytt);
        let mut y = bus_matrix(&cf, &ct, &yf, &yt);
        if let Some(sh) = shunt {
            y = &y + &diag(sh.as_slice());
        }
        Ok(y.imag() * -1.0)
    };

    let b1 = imag_ybus(
        Simplify {
            no_resistance: scheme == DecoupledScheme::XB,
            no_charging: true,
            no_taps: true,
            no_shift: true,
        },
        None,
    )?;
    let b2 = imag_ybus(
        Simplify {
            no_resistance: scheme == DecoupledScheme::BX,
            no_shift: true,
            ..Default::default()
        },
        Some(y_bus_shunt),
    )?;
    Ok((b1, b2))
}

/// Susceptance matrices of the DC approximation.
#[derive(Debug, Clone)]
pub struct LinearMatrices {
    /// `Bbus = Cftᵀ·diag(b)·Cft`
    pub bbus: CscMatrix<f64>,
    /// `Bf = diag(b)·Cft`
    pub bf: CscMatrix<f64>,
    /// Branch flow offsets from phase shifters, `-b·τ`.
    pub pf_shift: DVector<f64>,
    /// Bus injection equivalent of the phase shifters, `Cftᵀ·pf_shift`.
    pub pbus_shift: DVector<f64>,
}

pub fn linear_matrices(circuit: &NumericalCircuit, conn: &Connectivity) -> Result<LinearMatrices> {
    let br = &circuit.branch;
    let m = circuit.nbranch();
    let mut b = DVector::zeros(m);
    for k in (0..m).filter(|&k| conn.in_calculation[k]) {
        let xm = br.x[k] * br.tap_module[k];
        if xm == 0.0 {
            if br.r[k] == 0.0 {
                return Err(PowerFlowError::ZeroImpedanceBranch { branch: k });
            }
            continue;
        }
        b[k] = 1.0 / xm;
    }
    let pf_shift = DVector::from_iterator(m, (0..m).map(|k| -b[k] * br.tap_angle[k]));

    let cft = &conn.cf - &conn.ct;
    let bf = &diag(b.as_slice()) * &cft;
    let cft_t = cft.transpose();
    let bbus = &cft_t * &bf;
    let pbus_shift = &cft_t * &pf_shift;
    Ok(LinearMatrices {
        bbus,
        bf,
        pf_shift,
        pbus_shift,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::circuit::{Branch, Bus};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn phase_shifter_case() -> NumericalCircuit {
        let mut c = NumericalCircuit::new(100.0);
        for _ in 0..3 {
            c.add_bus(Bus::pq());
        }
        c.add_branch(Branch::line(0, 1, 0.01, 0.1, 0.02));
        c.add_branch(Branch::transformer(1, 2, 0.005, 0.08, 1.05, 0.1));
        c.add_branch(Branch::line(0, 2, 0.02, 0.2, 0.04));
        c
    }

    #[test]
    fn test_ybus_two_port_values() {
        let mut c = NumericalCircuit::new(100.0);
        c.add_bus(Bus::slack());
        c.add_bus(Bus::pq());
        c.add_branch(Branch::line(0, 1, 0.01, 0.03, 0.02));
        let conn = Connectivity::new(&c);
        let y = AdmittanceBundle::new(&c, &conn, &DVector::from_element(2, Complex64::new(0.0, 0.0)))
            .unwrap();
        let ybus = DMatrix::from(&y.ybus);
        let ys = Complex64::new(0.01, 0.03).inv();
        let yc = Complex64::new(0.0, 0.01);
        assert_relative_eq!((ybus[(0, 0)] - (ys + yc)).norm(), 0.0, epsilon = 1e-9);
        assert_relative_eq!((ybus[(0, 1)] + ys).norm(), 0.0, epsilon = 1e-9);
        assert_relative_eq!((ybus[(1, 1)] - (ys + yc)).norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ybus_pattern_symmetric_with_phase_shift() {
        let c = phase_shifter_case();
        let conn = Connectivity::new(&c);
        let y = AdmittanceBundle::new(&c, &conn, &DVector::from_element(3, Complex64::new(0.0, 0.0)))
            .unwrap();
        let dense = DMatrix::from(&y.ybus);
        // values differ across the shifter ...
        assert!((dense[(1, 2)] - dense[(2, 1)]).norm() > 1e-6);
        // ... but the pattern does not.
        let t = y.ybus.transpose();
        assert_eq!(y.ybus.pattern(), t.pattern());
    }

    #[test]
    fn test_series_plus_shunt_is_ybus() {
        let c = phase_shifter_case();
        let conn = Connectivity::new(&c);
        let y0 = DVector::from_vec(vec![
            Complex64::new(0.0, 0.1),
            Complex64::new(0.02, 0.0),
            Complex64::new(0.0, 0.0),
        ]);
        let y = AdmittanceBundle::new(&c, &conn, &y0).unwrap();
        let recomposed = DMatrix::from(&y.yseries) + DMatrix::from_diagonal(&y.yshunt);
        let diff = DMatrix::from(&y.ybus) - recomposed;
        assert_relative_eq!(diff.iter().map(|v| v.norm()).fold(0.0, f64::max), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_impedance_is_rejected() {
        let mut c = NumericalCircuit::new(100.0);
        c.add_bus(Bus::slack());
        c.add_bus(Bus::pq());
        c.add_branch(Branch::line(0, 1, 0.0, 0.0, 0.0));
        let conn = Connectivity::new(&c);
        let err = AdmittanceBundle::new(&c, &conn, &DVector::from_element(2, Complex64::new(0.0, 0.0)));
        assert_eq!(err.unwrap_err(), PowerFlowError::ZeroImpedanceBranch { branch: 0 });
    }

    #[test]
    fn test_decoupled_and_linear_matrices() {
        let c = phase_shifter_case();
        let conn = Connectivity::new(&c);
        let y0 = DVector::from_element(3, Complex64::new(0.0, 0.0));
        let (b1, b2) = fast_decoupled_matrices(&c, &conn, &y0, DecoupledScheme::XB).unwrap();
        let b1 = DMatrix::from(&b1);
        assert_relative_eq!(b1[(0, 0)], 1.0 / 0.1 + 1.0 / 0.2, epsilon = 1e-9);
        assert_relative_eq!(b1[(0, 1)], -10.0, epsilon = 1e-9);
        // B'' keeps the charging of the lines
        let b2 = DMatrix::from(&b2);
        assert!(b2[(0, 0)] < b1[(0, 0)] + 1.0);

        let lin = linear_matrices(&c, &conn).unwrap();
        let bbus = DMatrix::from(&lin.bbus);
        assert_relative_eq!(bbus[(1, 1)], 10.0 + 1.0 / (0.08 * 1.05), epsilon = 1e-9);
        assert_relative_eq!(lin.pbus_shift[1], -0.1 / (0.08 * 1.05), epsilon = 1e-9);
        assert_relative_eq!(lin.pbus_shift[2], 0.1 / (0.08 * 1.05), epsilon = 1e-9);
    }
}
