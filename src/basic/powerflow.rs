//! The power flow driver: validation, topology processing, the per-island
//! control loop with its solver retries, and reassembly of the results.

use std::time::Instant;

use nalgebra::DVector;
use num_complex::Complex64;
use rayon::prelude::*;

use super::circuit::NumericalCircuit;
use super::control::{adjust_taps, distribute_slack, enforce_q_limits};
use super::error::{PowerFlowError, Result};
use super::fdpf::fast_decoupled_pf;
use super::gausspf::gauss_seidel_pf;
use super::helm::helm_pf;
use super::levenberg::levenberg_marquardt_pf;
use super::linearpf::{dc_pf, linear_ac_pf};
use super::newtonpf::newton_pf;
use super::newtonpf_i::newton_pf_current;
use super::options::{PowerFlowOptions, SolverType, StepPolicy};
use super::pf::{CancelToken, IslandModel, SolverConfig, SolverInput, SolverOutput};
use super::results::{IslandReport, IslandSolution, IslandStatus, PowerFlowResults};
use super::solver::DefaultSolver;
use super::system::{Connectivity, DecoupledScheme};
use super::topology::{Island, IslandCircuit, find_islands, reduce_branches};

/// Runs one algorithm on one island.
pub fn solve_with(method: SolverType, input: &SolverInput, config: &SolverConfig) -> Result<SolverOutput> {
    let mut solver = DefaultSolver::default();
    match method {
        SolverType::NewtonRaphson => newton_pf(input, config, &mut solver),
        SolverType::Iwamoto => {
            let config = SolverConfig {
                step: StepPolicy::Iwamoto,
                ..config.clone()
            };
            newton_pf(input, &config, &mut solver)
        }
        SolverType::NewtonRaphsonCurrent => newton_pf_current(input, config, &mut solver),
        SolverType::LevenbergMarquardt => levenberg_marquardt_pf(input, config, &mut solver),
        SolverType::FastDecoupledXB => fast_decoupled_pf::<DefaultSolver>(input, config, DecoupledScheme::XB),
        SolverType::FastDecoupledBX => fast_decoupled_pf::<DefaultSolver>(input, config, DecoupledScheme::BX),
        SolverType::GaussSeidel => gauss_seidel_pf(input, config),
        SolverType::Helm => helm_pf::<DefaultSolver>(input, config),
        SolverType::Dc => dc_pf(input, config, &mut solver),
        SolverType::LinearAc => linear_ac_pf(input, config, &mut solver),
    }
}

/// A solve plus the bookkeeping of every attempt that led to it.
struct Attempt {
    out: SolverOutput,
    method: SolverType,
    iterations: usize,
    degenerate: bool,
}

/// Solves with the configured method and, when allowed, walks the retry
/// chain. A fallback replaces the current solution only if it lowers the
/// error; the walk stops at the first converged solution.
fn solve_with_retries(input: &SolverInput, config: &SolverConfig, options: &PowerFlowOptions) -> Result<Attempt> {
    let out = solve_with(options.solver, input, config)?;
    let mut attempt = Attempt {
        iterations: out.iterations,
        degenerate: out.degenerate,
        method: options.solver,
        out,
    };
    if attempt.out.converged || attempt.out.cancelled || !options.retry_with_other_methods {
        return Ok(attempt);
    }

    let chain = &SolverType::RETRY_CHAIN;
    let first = chain.iter().position(|m| *m == options.solver).map_or(0, |p| p + 1);
    for &method in &chain[first..] {
        log::info!(
            "{:?} did not converge (error {:.3e}), retrying with {method:?}",
            attempt.method,
            attempt.out.error
        );
        let mut out = match solve_with(method, input, config) {
            Ok(out) => out,
            Err(e) => {
                log::warn!("{method:?} failed: {e}");
                continue;
            }
        };
        // a linear fallback only counts as converged when it is accurate
        if method.is_linear() {
            out.converged = out.error <= config.tolerance;
        }
        attempt.iterations += out.iterations;
        attempt.degenerate |= out.degenerate;
        let cancelled = out.cancelled;
        if out.error < attempt.out.error {
            attempt.method = method;
            attempt.out = out;
        }
        if attempt.out.converged || cancelled {
            break;
        }
    }
    Ok(attempt)
}

/// Builder for a power flow run over a whole circuit.
///
/// ```ignore
/// let results = PowerFlow::new(&circuit, PowerFlowOptions::default()).run()?;
/// println!("{results}");
/// ```
pub struct PowerFlow<'a> {
    circuit: &'a NumericalCircuit,
    options: PowerFlowOptions,
    cancel: CancelToken,
}

impl<'a> PowerFlow<'a> {
    pub fn new(circuit: &'a NumericalCircuit, options: PowerFlowOptions) -> Self {
        Self {
            circuit,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Shares a token with the caller so the run can be stopped from
    /// another thread.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Starts from the voltages of a previous run of the same circuit.
    pub fn with_warm_start(mut self, previous: &PowerFlowResults) -> Self {
        self.options = self.options.with_warm_start(previous.voltage.clone());
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Solves every island of the circuit.
    ///
    /// Only configuration errors are returned as `Err`; failures of single
    /// islands are reported in [`PowerFlowResults::islands`].
    pub fn run(&self) -> Result<PowerFlowResults> {
        let start = Instant::now();
        let circuit = self.circuit;
        self.options.check(circuit.nbus())?;
        circuit.validate(self.options.reject_self_loops)?;

        let conn = Connectivity::new(circuit);
        let reduction = reduce_branches(circuit, &conn);
        let reduced_conn = Connectivity::new(&reduction.circuit);
        let islands = find_islands(&reduced_conn.adjacency(), &reduction.circuit.bus.active);
        log::info!(
            "{} active buses in {} islands after merging {} reducible branches",
            circuit.active_bus_count(),
            islands.len(),
            circuit.nbranch() - reduction.circuit.nbranch()
        );

        let solve = |(index, island): (usize, &Island)| {
            let slice = reduction.circuit.slice(island);
            self.solve_island(index, island, slice)
        };
        let solutions: Vec<IslandSolution> = if self.options.parallel_islands {
            islands.par_iter().enumerate().map(solve).collect()
        } else {
            islands.iter().enumerate().map(solve).collect()
        };

        let results = PowerFlowResults::assemble(circuit, &reduction, solutions, start.elapsed());
        log::info!(
            "power flow finished: converged {}, error {:.3e}, {:?}",
            results.converged,
            results.error,
            results.elapsed
        );
        Ok(results)
    }

    fn initial_voltage(&self, model: &IslandModel, slice: &IslandCircuit) -> DVector<Complex64> {
        let mut v0 = model.flat_start();
        if let (true, Some(warm)) = (self.options.initialize_with_existing_solution, &self.options.warm_start) {
            for (local, &bus) in slice.bus_origin.iter().enumerate() {
                // unsolved buses of the previous run are zero
                if warm[bus].norm() > 0.0 {
                    v0[local] = warm[bus];
                }
            }
        }
        v0
    }

    fn solve_island(&self, index: usize, island: &Island, slice: IslandCircuit) -> IslandSolution {
        let options = &self.options;
        let mut solution = IslandSolution {
            report: IslandReport::new(island.to_vec(), IslandStatus::NotConverged),
            slice,
            solved: None,
            q_switches: Vec::new(),
            tap_changes: Vec::new(),
            slack: None,
        };

        let mut model = match IslandModel::new(solution.slice.circuit.clone()) {
            Ok(model) => model,
            Err(e) => {
                log::warn!("island {index}: {e}");
                solution.report.status = IslandStatus::Failed(e);
                return solution;
            }
        };
        if model.slack.is_empty() {
            solution.report.status = if island.len() == 1 && options.ignore_single_node_islands {
                log::info!("island {index}: single bus {} ignored", island[0]);
                IslandStatus::Ignored
            } else {
                log::warn!("island {index} ({} buses) has no slack bus", island.len());
                IslandStatus::Failed(PowerFlowError::NoSlack { island: index })
            };
            return solution;
        }

        let config = SolverConfig::from_options(options, self.cancel.clone());
        let controls = !options.solver.is_linear();
        let mut v0 = self.initial_voltage(&model, &solution.slice);
        let mut slack_done = false;
        let report = &mut solution.report;

        loop {
            let attempt = match solve_with_retries(&model.input(&v0), &config, options) {
                Ok(attempt) => attempt,
                Err(e) => {
                    log::warn!("island {index}: {e}");
                    report.status = IslandStatus::Failed(e);
                    break;
                }
            };
            report.method = Some(attempt.method);
            report.iterations += attempt.iterations;
            report.degenerate |= attempt.degenerate;
            report.error = attempt.out.error;
            report.elapsed += attempt.out.elapsed;
            let out = attempt.out;

            if out.cancelled {
                report.status = IslandStatus::Failed(PowerFlowError::Cancelled {
                    iterations: report.iterations,
                });
                solution.solved = Some((model, out.v));
                return solution;
            }
            report.status = if out.converged {
                IslandStatus::Converged
            } else {
                IslandStatus::NotConverged
            };
            if !out.converged || !controls || report.outer_iterations >= options.max_outer_iter {
                solution.solved = Some((model, out.v));
                break;
            }

            let switches = enforce_q_limits(&mut model, &out.v, options.q_control);
            let taps = match adjust_taps(&mut model, &out.v, options.tap_control) {
                Ok(taps) => taps,
                Err(e) => {
                    report.status = IslandStatus::Failed(e);
                    break;
                }
            };
            let mut changed = !switches.is_empty() || !taps.is_empty();
            solution.q_switches.extend(switches);
            solution.tap_changes.extend(taps);
            if options.distributed_slack && !slack_done {
                slack_done = true;
                if let Some(dist) = distribute_slack(&mut model, &out.v) {
                    solution.slack = Some(dist);
                    changed = true;
                }
            }
            if !changed {
                solution.solved = Some((model, out.v));
                break;
            }
            report.outer_iterations += 1;
            log::debug!("island {index}: controls changed, outer iteration {}", report.outer_iterations);
            v0 = out.v;
        }

        match &report.status {
            IslandStatus::Converged => log::info!(
                "island {index}: converged with {:?} in {} iterations, error {:.3e}",
                report.method.unwrap_or_default(),
                report.iterations,
                report.error
            ),
            status => log::warn!("island {index}: {status:?}, error {:.3e}", report.error),
        }
        solution
    }
}

/// Solves the power flow of `circuit` with `options`.
pub fn run_power_flow(circuit: &NumericalCircuit, options: &PowerFlowOptions) -> Result<PowerFlowResults> {
    PowerFlow::new(circuit, options.clone()).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::circuit::{Branch, Bus, BusType, Generator, Load};
    use crate::testcases;
    use approx::assert_relative_eq;

    fn init_logger() {
        let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
    }

    /// Computed injections equal the specified ones at every non-slack bus:
    /// `S` at PQ buses, `P` and `|V|` at PV buses.
    fn assert_power_balance(circuit: &NumericalCircuit, results: &PowerFlowResults) {
        let inj = circuit.bus_injections();
        let vm = results.vm();
        let spec = inj.sbus(&vm);
        for (b, t) in inj.bus_types.iter().enumerate() {
            if !circuit.bus.active[b] || results.island_of(b).is_none() {
                continue;
            }
            let mis = results.sbus[b] / circuit.sbase - spec[b];
            match t {
                BusType::PQ => assert!(mis.norm() < 1e-5, "bus {b}"),
                BusType::PV => {
                    assert!(mis.re.abs() < 1e-5, "bus {b}");
                    assert_relative_eq!(vm[b], inj.v0[b].norm(), epsilon = 1e-9);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_three_bus_newton() {
        init_logger();
        let circuit = testcases::three_bus();
        let results = run_power_flow(&circuit, &PowerFlowOptions::default()).unwrap();
        assert!(results.converged);
        assert!(results.iterations <= 10);
        assert!(results.error < 1e-6);
        assert_eq!(results.islands.len(), 1);
        assert_eq!(results.islands[0].method, Some(SolverType::NewtonRaphson));
        assert_power_balance(&circuit, &results);

        // the losses are what the slack delivers beyond the loads
        let loads: Complex64 = circuit.load.s.iter().sum();
        let generated: Complex64 = results.sbus.iter().sum();
        assert_relative_eq!(generated.re, results.total_losses().re, epsilon = 1e-3);
        assert!(results.sbus[0].re > loads.re);
        assert!(results.to_string().contains("| bus |"));
    }

    #[test]
    fn test_star_reduction() {
        let circuit = testcases::star();
        let results = run_power_flow(&circuit, &PowerFlowOptions::default()).unwrap();
        assert!(results.converged);
        assert_eq!(results.islands.len(), 1);
        // bus 1 collapses into bus 0 and takes its voltage
        assert_eq!(results.islands[0].buses, vec![0, 2]);
        assert_eq!(results.voltage[1], results.voltage[0]);
        assert_eq!(results.vt[0], results.voltage[0]);
        assert_eq!(results.sf[0], Complex64::new(0.0, 0.0));
        assert!(results.sf[1].re > 20.0);
    }

    #[test]
    fn test_isolated_bus_flagged() {
        let circuit = testcases::with_isolated_bus();
        let results = run_power_flow(&circuit, &PowerFlowOptions::default()).unwrap();
        assert_eq!(results.islands.len(), 2);
        assert!(results.islands[0].is_converged());
        assert_eq!(
            results.islands[1].status,
            IslandStatus::Failed(PowerFlowError::NoSlack { island: 1 })
        );
        assert!(!results.converged);
        let lone = results.islands[1].buses[0];
        assert_eq!(results.voltage[lone], Complex64::new(0.0, 0.0));

        let options = PowerFlowOptions {
            ignore_single_node_islands: true,
            ..Default::default()
        };
        let results = run_power_flow(&circuit, &options).unwrap();
        assert_eq!(results.islands[1].status, IslandStatus::Ignored);
        assert!(results.converged);
    }

    #[test]
    fn test_every_method_solves_the_five_bus_case() {
        init_logger();
        let circuit = testcases::five_bus();
        let reference = run_power_flow(&circuit, &PowerFlowOptions::default()).unwrap();
        assert!(reference.converged);
        assert_power_balance(&circuit, &reference);
        for method in [
            SolverType::Iwamoto,
            SolverType::NewtonRaphsonCurrent,
            SolverType::LevenbergMarquardt,
            SolverType::FastDecoupledXB,
            SolverType::FastDecoupledBX,
            SolverType::GaussSeidel,
        ] {
            let options = PowerFlowOptions {
                max_iter: 2000,
                ..PowerFlowOptions::default().with_solver(method)
            };
            let results = run_power_flow(&circuit, &options).unwrap();
            assert!(results.converged, "{method:?}");
            for (a, b) in reference.voltage.iter().zip(results.voltage.iter()) {
                assert!((a - b).norm() < 1e-4, "{method:?}");
            }
        }
    }

    #[test]
    fn test_q_limits_in_outer_loop() {
        let mut circuit = testcases::five_bus();
        circuit.generator.q_max[0] = 1.0;
        let options = PowerFlowOptions {
            q_control: crate::basic::options::QControl::Direct,
            ..Default::default()
        };
        let results = run_power_flow(&circuit, &options).unwrap();
        assert!(results.converged);
        assert_eq!(results.q_switches.len(), 1);
        let switch = results.q_switches[0];
        assert_eq!(switch.bus, circuit.generator.bus[0]);
        assert_relative_eq!(switch.q_fixed, 1.0);
        assert_eq!(results.islands[0].outer_iterations, 1);
    }

    #[test]
    fn test_retry_chain_recovers() {
        init_logger();
        let circuit = testcases::five_bus();
        // Gauss-Seidel cannot make it in three sweeps
        let options = PowerFlowOptions {
            max_iter: 3,
            ..PowerFlowOptions::default().with_solver(SolverType::GaussSeidel)
        };
        let results = run_power_flow(&circuit, &options).unwrap();
        assert!(!results.converged);
        assert_eq!(results.islands[0].status, IslandStatus::NotConverged);

        let options = PowerFlowOptions {
            retry_with_other_methods: true,
            max_iter: 10,
            ..options
        };
        let results = run_power_flow(&circuit, &options).unwrap();
        assert!(results.converged);
        assert_eq!(results.islands[0].method, Some(SolverType::NewtonRaphson));
    }

    #[test]
    fn test_configuration_errors_fail_the_run() {
        let mut circuit = testcases::three_bus();
        circuit.branch.f[0] = 42;
        assert!(matches!(
            run_power_flow(&circuit, &PowerFlowOptions::default()),
            Err(PowerFlowError::BusIndexOutOfRange { value: 42, .. })
        ));

        let circuit = testcases::three_bus();
        let options = PowerFlowOptions {
            max_iter: 0,
            ..Default::default()
        };
        assert!(matches!(
            run_power_flow(&circuit, &options),
            Err(PowerFlowError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_cancelled_before_start() {
        let circuit = testcases::three_bus();
        let flow = PowerFlow::new(&circuit, PowerFlowOptions::default());
        flow.cancel_token().cancel();
        let results = flow.run().unwrap();
        assert!(!results.converged);
        assert_eq!(
            results.islands[0].status,
            IslandStatus::Failed(PowerFlowError::Cancelled { iterations: 0 })
        );
        // the flat start is kept as the last committed iterate
        assert_relative_eq!(results.voltage[1].norm(), 1.0);
    }

    #[test]
    fn test_parallel_islands_match_sequential() {
        let mut circuit = testcases::three_bus();
        let offset = circuit.nbus();
        let second = testcases::five_bus();
        for k in 0..second.nbus() {
            circuit.add_bus(second.bus.get(k));
        }
        for k in 0..second.nbranch() {
            let mut br = second.branch.get(k);
            br.f += offset;
            br.t += offset;
            circuit.add_branch(br);
        }
        for k in 0..second.load.len() {
            circuit.add_load(Load::constant_power(
                second.load.bus[k] + offset,
                second.load.s[k].re,
                second.load.s[k].im,
            ));
        }
        for k in 0..second.generator.len() {
            circuit.add_generator(Generator {
                bus: second.generator.bus[k] + offset,
                p: second.generator.p[k],
                v_set: second.generator.v_set[k],
                ..Default::default()
            });
        }

        let sequential = run_power_flow(&circuit, &PowerFlowOptions::default()).unwrap();
        let options = PowerFlowOptions {
            parallel_islands: true,
            ..Default::default()
        };
        let parallel = run_power_flow(&circuit, &options).unwrap();
        assert_eq!(sequential.islands.len(), 2);
        assert!(parallel.converged);
        assert_eq!(sequential.voltage, parallel.voltage);
    }

    #[test]
    fn test_warm_start_needs_no_iterations() {
        let circuit = testcases::five_bus();
        let first = run_power_flow(&circuit, &PowerFlowOptions::default()).unwrap();
        let second = PowerFlow::new(&circuit, PowerFlowOptions::default())
            .with_warm_start(&first)
            .run()
            .unwrap();
        assert!(second.converged);
        assert!(second.iterations <= 1);
    }

    #[test]
    fn test_dc_run_reports_flows() {
        let circuit = testcases::three_bus();
        let options = PowerFlowOptions::default().with_solver(SolverType::Dc);
        let results = run_power_flow(&circuit, &options).unwrap();
        assert!(results.converged);
        assert_eq!(results.islands[0].outer_iterations, 0);
        assert!(results.sf.iter().any(|s| s.re.abs() > 1.0));
    }

    #[test]
    fn test_switch_between_branches_is_merged() {
        let mut circuit = NumericalCircuit::new(100.0);
        circuit.add_bus(Bus::slack());
        circuit.add_bus(Bus::pq());
        circuit.add_bus(Bus::pq());
        circuit.add_branch(Branch::line(0, 1, 0.01, 0.1, 0.0));
        circuit.add_branch(Branch::switch(1, 2));
        circuit.add_load(Load::constant_power(2, 10.0, 2.0));
        let results = run_power_flow(&circuit, &PowerFlowOptions::default()).unwrap();
        assert!(results.converged);
        assert_eq!(results.voltage[2], results.voltage[1]);
        assert!(results.voltage[1].norm() < 1.0);
        // the mismatch tolerance is in p.u.
        let eps = PowerFlowOptions::default().tolerance * circuit.sbase;
        assert_relative_eq!(results.sf[0].re, 10.0 + results.losses[0].re, epsilon = eps);
    }
}
