//! Power flow results keyed by the indices of the original circuit.

mod display;

use std::time::Duration;

use nalgebra::DVector;
use num_complex::Complex64;
use serde::Serialize;

use super::circuit::NumericalCircuit;
use super::control::{QLimitSwitch, SlackDistribution, TapChange};
use super::error::PowerFlowError;
use super::mismatch::compute_power;
use super::options::SolverType;
use super::pf::IslandModel;
use super::sparse::cast::Cast;
use super::topology::{IslandCircuit, Reduction};

/// Outcome of one island.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IslandStatus {
    Converged,
    /// The solvers ran out of iterations; the voltages are the best iterate.
    NotConverged,
    Failed(PowerFlowError),
    /// A lone bus without slack, skipped on request.
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct IslandReport {
    pub status: IslandStatus,
    /// Algorithm that produced the reported voltages.
    pub method: Option<SolverType>,
    /// Inner iterations summed over every solve of the island.
    pub iterations: usize,
    pub outer_iterations: usize,
    pub error: f64,
    pub elapsed: Duration,
    /// Original indices of the island's calculation buses.
    pub buses: Vec<usize>,
    /// A numerical fallback was taken on the way.
    pub degenerate: bool,
}

impl IslandReport {
    pub fn new(buses: Vec<usize>, status: IslandStatus) -> Self {
        Self {
            status,
            method: None,
            iterations: 0,
            outer_iterations: 0,
            error: f64::NAN,
            elapsed: Duration::ZERO,
            buses,
            degenerate: false,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.status == IslandStatus::Converged
    }
}

/// Everything the driver knows about one island once it is done with it.
#[derive(Debug)]
pub(crate) struct IslandSolution {
    pub(crate) slice: IslandCircuit,
    pub(crate) report: IslandReport,
    /// Final model and voltages, absent when the island was never solved.
    pub(crate) solved: Option<(IslandModel, DVector<Complex64>)>,
    pub(crate) q_switches: Vec<QLimitSwitch>,
    pub(crate) tap_changes: Vec<TapChange>,
    pub(crate) slack: Option<SlackDistribution>,
}

/// Results of a power flow. Powers are in MVA, voltages in p.u.; vectors
/// are indexed like the buses and branches of the input circuit.
#[derive(Debug, Clone, Serialize)]
pub struct PowerFlowResults {
    pub sbase: f64,
    /// Every island converged (or was ignored).
    pub converged: bool,
    /// Largest island error (p.u.).
    pub error: f64,
    /// Largest island iteration count.
    pub iterations: usize,
    pub elapsed: Duration,
    /// Zero for inactive and unsolved buses.
    pub voltage: DVector<Complex64>,
    /// Computed bus injections.
    pub sbus: DVector<Complex64>,
    pub sf: DVector<Complex64>,
    pub st: DVector<Complex64>,
    pub losses: DVector<Complex64>,
    /// `max(|Sf|, |St|)/rate`, zero for unrated branches.
    pub loading: DVector<f64>,
    pub vf: DVector<Complex64>,
    pub vt: DVector<Complex64>,
    pub islands: Vec<IslandReport>,
    /// PV to PQ switches with original bus indices.
    pub q_switches: Vec<QLimitSwitch>,
    /// Tap changes with original branch indices.
    pub tap_changes: Vec<TapChange>,
    /// Final tap modules of all branches.
    pub tap_modules: DVector<f64>,
    pub slack_distribution: Vec<SlackDistribution>,
    pub(crate) branch_ends: Vec<(usize, usize)>,
}

impl PowerFlowResults {
    /// Scatters the island solutions back onto the original circuit.
    pub(crate) fn assemble(
        circuit: &NumericalCircuit,
        reduction: &Reduction,
        solutions: Vec<IslandSolution>,
        elapsed: Duration,
    ) -> Self {
        let n = circuit.nbus();
        let m = circuit.nbranch();
        let sbase = circuit.sbase;
        let zero = Complex64::new(0.0, 0.0);

        let mut voltage = DVector::from_element(n, zero);
        let mut sbus = DVector::from_element(n, zero);
        let mut sf = DVector::from_element(m, zero);
        let mut st = DVector::from_element(m, zero);
        let mut tap_modules = DVector::from_column_slice(&circuit.branch.tap_module);
        let mut islands = Vec::with_capacity(solutions.len());
        let mut q_switches = Vec::new();
        let mut tap_changes = Vec::new();
        let mut slack_distribution = Vec::new();

        for sol in solutions {
            let bus_origin = &sol.slice.bus_origin;
            let branch_origin: Vec<usize> = sol
                .slice
                .branch_origin
                .iter()
                .map(|&k| reduction.branch_origin[k])
                .collect();

            if let Some((model, v)) = &sol.solved {
                let adm = &model.admittance;
                let scalc = compute_power(&adm.ybus, v);
                let vf = &model.conn.cf.cast() * v;
                let vt = &model.conn.ct.cast() * v;
                let if_ = &adm.yf * v;
                let it = &adm.yt * v;
                for (local, &bus) in bus_origin.iter().enumerate() {
                    voltage[bus] = v[local];
                    sbus[bus] = scalc[local] * sbase;
                }
                for (local, &k) in branch_origin.iter().enumerate() {
                    sf[k] = vf[local] * if_[local].conj() * sbase;
                    st[k] = vt[local] * it[local].conj() * sbase;
                    tap_modules[k] = model.circuit.branch.tap_module[local];
                }
            }
            q_switches.extend(sol.q_switches.iter().map(|s| QLimitSwitch {
                bus: bus_origin[s.bus],
                ..*s
            }));
            tap_changes.extend(sol.tap_changes.iter().map(|c| TapChange {
                branch: branch_origin[c.branch],
                ..*c
            }));
            if let Some(dist) = sol.slack {
                slack_distribution.push(SlackDistribution {
                    shares: dist.shares.iter().map(|&(b, p)| (bus_origin[b], p)).collect(),
                    ..dist
                });
            }
            islands.push(sol.report);
        }

        // merged buses share their representative's voltage
        for b in (0..n).filter(|&b| circuit.bus.active[b]) {
            let rep = reduction.representative[b];
            if rep != b {
                voltage[b] = voltage[rep];
            }
        }

        let branch_ends: Vec<(usize, usize)> = circuit
            .branch
            .f
            .iter()
            .zip(&circuit.branch.t)
            .map(|(&f, &t)| (f, t))
            .collect();
        let vf = DVector::from_iterator(m, branch_ends.iter().map(|&(f, _)| voltage[f]));
        let vt = DVector::from_iterator(m, branch_ends.iter().map(|&(_, t)| voltage[t]));
        let losses = &sf + &st;
        let loading = DVector::from_iterator(
            m,
            (0..m).map(|k| match circuit.branch.rate[k] {
                rate if rate > 0.0 => sf[k].norm().max(st[k].norm()) / rate,
                _ => 0.0,
            }),
        );

        let converged = !islands.is_empty()
            && islands
                .iter()
                .all(|r| matches!(r.status, IslandStatus::Converged | IslandStatus::Ignored));
        let error = islands
            .iter()
            .filter(|r| r.error.is_finite())
            .map(|r| r.error)
            .fold(0.0, f64::max);
        let iterations = islands.iter().map(|r| r.iterations).max().unwrap_or(0);

        Self {
            sbase,
            converged,
            error,
            iterations,
            elapsed,
            voltage,
            sbus,
            sf,
            st,
            losses,
            loading,
            vf,
            vt,
            islands,
            q_switches,
            tap_changes,
            tap_modules,
            slack_distribution,
            branch_ends,
        }
    }

    pub fn vm(&self) -> DVector<f64> {
        self.voltage.map(|v| v.norm())
    }

    /// Voltage angles in degrees.
    pub fn va_degrees(&self) -> DVector<f64> {
        self.voltage.map(|v| v.arg().to_degrees())
    }

    /// Total losses of the circuit (MVA).
    pub fn total_losses(&self) -> Complex64 {
        self.losses.sum()
    }

    /// Report of the island containing `bus`, if it was part of one.
    pub fn island_of(&self, bus: usize) -> Option<&IslandReport> {
        self.islands.iter().find(|r| r.buses.contains(&bus))
    }
}
