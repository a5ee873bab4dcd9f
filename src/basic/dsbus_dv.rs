use crate::basic::sparse::{conj::Conjugate, diag};
use nalgebra::*;
use nalgebra_sparse::CscMatrix;

/// `V/|V|`, with zero where the voltage is zero.
pub(crate) fn unit_phasors(v: &DVector<Complex<f64>>) -> DVector<Complex<f64>> {
    v.map(|e| {
        let m = e.norm();
        if m > 0.0 { e / m } else { Complex::new(0.0, 0.0) }
    })
}

/// Computes the partial derivatives of the power injections with respect to
/// voltage magnitude and angle.
///
/// # Arguments
///
/// * `Ybus` - the nodal admittance matrix.
/// * `v` - the complex bus voltages.
///
/// # Returns
///
/// A tuple `(dS_dVm, dS_dVa)` of sparse matrices with the pattern of `Ybus`
/// (plus the diagonal).
///
/// # Notes
///
/// * The formulation is the one used by MatPower:
///  R. D. Zimmerman, "AC Power Flows, Generalized OPF Costs and
///  their Derivatives using Complex Matrix Notation", MATPOWER
///  Technical Note 2, February 2010.U{http://www.pserc.cornell.edu/matpower/TN2-OPF-Derivatives.pdf}
///  @author: Ray Zimmerman (PSERC Cornell)
/// * Only the network part `V·conj(Ybus·V)` is differentiated; voltage
///   dependent injections are handled by the caller.
#[allow(non_snake_case)]
pub fn dSbus_dV(
    Ybus: &CscMatrix<Complex<f64>>,
    v: &DVector<Complex<f64>>,
) -> (CscMatrix<Complex<f64>>, CscMatrix<Complex<f64>>) {
    let ibus = Ybus * v;
    let diagV = diag(v.as_slice());
    let diagVnorm = diag(unit_phasors(v).as_slice());
    let diagIbus = diag(ibus.as_slice());

    // dS_dVm = diagV * conj(Ybus * diagVnorm) + conj(diagIbus) * diagVnorm
    // dS_dVa = 1j * diagV * conj(diagIbus - Ybus * diagV)
    let dS_dVm = &diagV * (Ybus * &diagVnorm).conjugate() + diagIbus.conjugate() * &diagVnorm;
    let dS_dVa = &diagV * (diagIbus - Ybus * &diagV).conjugate() * Complex::<f64>::i();
    (dS_dVm, dS_dVa)
}

/// Partial derivatives of the network currents `Ybus·V`:
/// `dI_dVm = Ybus·diag(V/|V|)` and `dI_dVa = j·Ybus·diag(V)`.
#[allow(non_snake_case)]
pub fn dIbus_dV(
    Ybus: &CscMatrix<Complex<f64>>,
    v: &DVector<Complex<f64>>,
) -> (CscMatrix<Complex<f64>>, CscMatrix<Complex<f64>>) {
    let dI_dVm = Ybus * &diag(unit_phasors(v).as_slice());
    let dI_dVa = Ybus * &diag(v.as_slice()) * Complex::<f64>::i();
    (dI_dVm, dI_dVa)
}
