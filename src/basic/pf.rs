//! The data shared by every power flow algorithm: the compiled island, the
//! solver input view, the run settings and the solver output.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use super::circuit::{BusInjections, BusType, NumericalCircuit};
use super::error::Result;
use super::options::{HelmExtrapolation, PowerFlowOptions, StepPolicy};
use super::system::{AdmittanceBundle, Connectivity};

/// Cooperative cancellation flag shared between a caller and running solves.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One island compiled for solving. The bus type lists and the injections
/// are updated in place by the discrete controls.
#[derive(Debug, Clone)]
pub struct IslandModel {
    pub circuit: NumericalCircuit,
    pub conn: Connectivity,
    pub admittance: AdmittanceBundle,
    pub injections: BusInjections,
    pub pv: Vec<usize>,
    pub pq: Vec<usize>,
    pub slack: Vec<usize>,
}

impl IslandModel {
    pub fn new(circuit: NumericalCircuit) -> Result<Self> {
        let conn = Connectivity::new(&circuit);
        let injections = circuit.bus_injections();
        let admittance = AdmittanceBundle::new(&circuit, &conn, &injections.y0)?;
        let mut model = Self {
            circuit,
            conn,
            admittance,
            injections,
            pv: Vec::new(),
            pq: Vec::new(),
            slack: Vec::new(),
        };
        model.refresh_bus_lists();
        Ok(model)
    }

    pub fn nbus(&self) -> usize {
        self.circuit.nbus()
    }

    fn refresh_bus_lists(&mut self) {
        let active = &self.circuit.bus.active;
        self.pv = self.injections.indices_of(BusType::PV, active);
        self.pq = self.injections.indices_of(BusType::PQ, active);
        self.slack = self.injections.indices_of(BusType::Slack, active);
    }

    /// Reclassifies a PV bus as PQ with the given reactive injection (p.u.).
    pub fn switch_to_pq(&mut self, bus: usize, q: f64) {
        self.injections.bus_types[bus] = BusType::PQ;
        self.injections.s0[bus].im = q;
        self.refresh_bus_lists();
    }

    /// Recomputes the admittances after the tap modules changed.
    pub fn rebuild_admittance(&mut self) -> Result<()> {
        self.admittance = AdmittanceBundle::new(&self.circuit, &self.conn, &self.injections.y0)?;
        Ok(())
    }

    /// Flat start: set points at PV and slack buses, `1∠va_set` elsewhere.
    pub fn flat_start(&self) -> DVector<Complex64> {
        self.injections.v0.clone()
    }

    pub fn input<'a>(&'a self, v0: &'a DVector<Complex64>) -> SolverInput<'a> {
        SolverInput {
            circuit: &self.circuit,
            conn: &self.conn,
            ybus: &self.admittance.ybus,
            yseries: &self.admittance.yseries,
            yshunt: &self.admittance.yshunt,
            y0: &self.injections.y0,
            s0: &self.injections.s0,
            i0: &self.injections.i0,
            v0,
            pv: &self.pv,
            pq: &self.pq,
            slack: &self.slack,
        }
    }
}

/// Read-only view handed to the solvers.
#[derive(Debug, Clone, Copy)]
pub struct SolverInput<'a> {
    pub circuit: &'a NumericalCircuit,
    pub conn: &'a Connectivity,
    pub ybus: &'a CscMatrix<Complex64>,
    pub yseries: &'a CscMatrix<Complex64>,
    pub yshunt: &'a DVector<Complex64>,
    /// Per-bus shunt admittance, needed to rebuild `B''`.
    pub y0: &'a DVector<Complex64>,
    /// Constant power injection.
    pub s0: &'a DVector<Complex64>,
    /// Constant current injection (scaled by `|V|`).
    pub i0: &'a DVector<Complex64>,
    pub v0: &'a DVector<Complex64>,
    pub pv: &'a [usize],
    pub pq: &'a [usize],
    pub slack: &'a [usize],
}

impl SolverInput<'_> {
    pub fn nbus(&self) -> usize {
        self.v0.len()
    }

    /// PV then PQ buses, the ordering of the angle unknowns.
    pub fn pvpq(&self) -> Vec<usize> {
        self.pv.iter().chain(self.pq).copied().collect()
    }

    /// Specified injections at the voltage magnitudes `vm`.
    pub fn sbus(&self, vm: &DVector<f64>) -> DVector<Complex64> {
        self.s0 + self.i0.component_mul(&vm.map(|m| Complex64::new(m, 0.0)))
    }
}

/// Settings of a single inner solve.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub tolerance: f64,
    pub max_iter: usize,
    pub step: StepPolicy,
    pub helm_max_coefficients: usize,
    pub helm_extrapolation: HelmExtrapolation,
    pub cancel: CancelToken,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self::from_options(&PowerFlowOptions::default(), CancelToken::default())
    }
}

impl SolverConfig {
    pub fn from_options(options: &PowerFlowOptions, cancel: CancelToken) -> Self {
        Self {
            tolerance: options.tolerance,
            max_iter: options.max_iter,
            step: options.step_policy,
            helm_max_coefficients: options.helm_max_coefficients,
            helm_extrapolation: options.helm_extrapolation,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Result of one inner solve.
#[derive(Debug, Clone)]
pub struct SolverOutput {
    pub v: DVector<Complex64>,
    pub converged: bool,
    /// Infinity norm of the power mismatch at `v`.
    pub error: f64,
    pub iterations: usize,
    pub elapsed: Duration,
    /// Stopped by the cancellation token; `v` is the last committed iterate.
    pub cancelled: bool,
    /// A numerical fallback was taken (e.g. Padé replaced by the plain sum).
    pub degenerate: bool,
}

impl SolverOutput {
    pub(crate) fn new(v: DVector<Complex64>, error: f64, tolerance: f64, iterations: usize) -> Self {
        Self {
            v,
            converged: error <= tolerance,
            error,
            iterations,
            elapsed: Duration::ZERO,
            cancelled: false,
            degenerate: false,
        }
    }

    pub(crate) fn cancelled(mut self) -> Self {
        self.cancelled = true;
        self.converged = false;
        self
    }

    pub(crate) fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}
