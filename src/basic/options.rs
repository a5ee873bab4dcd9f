use nalgebra::DVector;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::error::{PowerFlowError, Result};

/// Algorithm used for the inner (continuous) solve of an island.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverType {
    #[default]
    NewtonRaphson,
    /// Newton-Raphson with the Iwamoto optimal multiplier, whatever
    /// `step_policy` says.
    Iwamoto,
    NewtonRaphsonCurrent,
    LevenbergMarquardt,
    #[serde(rename = "fast_decoupled_xb")]
    FastDecoupledXB,
    #[serde(rename = "fast_decoupled_bx")]
    FastDecoupledBX,
    GaussSeidel,
    Helm,
    Dc,
    LinearAc,
}

impl SolverType {
    /// Fallback order used by `retry_with_other_methods`.
    pub const RETRY_CHAIN: [SolverType; 5] = [
        SolverType::NewtonRaphson,
        SolverType::Helm,
        SolverType::Iwamoto,
        SolverType::LevenbergMarquardt,
        SolverType::LinearAc,
    ];

    /// The linear approximations are solved in one shot.
    pub fn is_linear(self) -> bool {
        matches!(self, SolverType::Dc | SolverType::LinearAc)
    }
}

/// Step size policy of the Newton-Raphson solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPolicy {
    /// Full Newton step.
    #[default]
    Plain,
    /// Quarter the step on the same direction while the error grows.
    LineSearch,
    /// Optimal multiplier from the cubic of Iwamoto and Tamura.
    Iwamoto,
}

/// Reactive power limit enforcement at PV buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QControl {
    #[default]
    None,
    /// Switch every violating bus after each inner solve.
    Direct,
    /// Switch only the worst violation after each inner solve.
    Iterative,
}

/// Discrete tap changer control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapControl {
    #[default]
    None,
    /// Jump to the position that matches the voltage target.
    Direct,
    /// Move one step towards it per outer iteration.
    Iterative,
}

/// How the holomorphic series is summed at `s = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelmExtrapolation {
    #[default]
    Pade,
    Wynn,
}

/// Power flow options, loadable from JSON. Missing fields take their
/// default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerFlowOptions {
    pub solver: SolverType,
    pub retry_with_other_methods: bool,
    /// Infinity norm of the power mismatch (p.u.) accepted as converged.
    pub tolerance: f64,
    pub max_iter: usize,
    /// Bound on the control loop (Q limits, taps, distributed slack).
    pub max_outer_iter: usize,
    pub q_control: QControl,
    pub tap_control: TapControl,
    pub distributed_slack: bool,
    pub step_policy: StepPolicy,
    pub initialize_with_existing_solution: bool,
    /// Voltages of every bus of the circuit, used when
    /// `initialize_with_existing_solution` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_start: Option<DVector<Complex64>>,
    pub ignore_single_node_islands: bool,
    pub parallel_islands: bool,
    pub reject_self_loops: bool,
    pub helm_max_coefficients: usize,
    pub helm_extrapolation: HelmExtrapolation,
}

impl Default for PowerFlowOptions {
    fn default() -> Self {
        Self {
            solver: SolverType::NewtonRaphson,
            retry_with_other_methods: false,
            tolerance: 1e-6,
            max_iter: 25,
            max_outer_iter: 10,
            q_control: QControl::None,
            tap_control: TapControl::None,
            distributed_slack: false,
            step_policy: StepPolicy::Plain,
            initialize_with_existing_solution: false,
            warm_start: None,
            ignore_single_node_islands: false,
            parallel_islands: false,
            reject_self_loops: false,
            helm_max_coefficients: 40,
            helm_extrapolation: HelmExtrapolation::Pade,
        }
    }
}

impl PowerFlowOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PowerFlowError::InvalidOption(e.to_string()))
    }

    /// Sets the tolerance to `10^exponent`.
    pub fn with_tolerance_exponent(mut self, exponent: i32) -> Self {
        self.tolerance = 10f64.powi(exponent);
        self
    }

    pub fn tolerance_exponent(&self) -> i32 {
        self.tolerance.log10().round() as i32
    }

    pub fn with_solver(mut self, solver: SolverType) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_warm_start(mut self, v: DVector<Complex64>) -> Self {
        self.initialize_with_existing_solution = true;
        self.warm_start = Some(v);
        self
    }

    pub(crate) fn check(&self, nbus: usize) -> Result<()> {
        if !(self.tolerance > 0.0) {
            return Err(PowerFlowError::InvalidOption(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iter == 0 {
            return Err(PowerFlowError::InvalidOption("max_iter must be at least 1".into()));
        }
        if self.helm_max_coefficients < 3 {
            return Err(PowerFlowError::InvalidOption(
                "helm_max_coefficients must be at least 3".into(),
            ));
        }
        if self.initialize_with_existing_solution {
            match &self.warm_start {
                Some(v) if v.len() != nbus => {
                    return Err(PowerFlowError::length_mismatch("warm_start", nbus, v.len()));
                }
                None => {
                    return Err(PowerFlowError::InvalidOption(
                        "initialize_with_existing_solution requires a warm start".into(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_json() {
        let opts = PowerFlowOptions::from_json(
            r#"{
                "solver": "fast_decoupled_xb",
                "tolerance": 1e-8,
                "q_control": "iterative",
                "step_policy": "line_search",
                "helm_extrapolation": "wynn"
            }"#,
        )
        .unwrap();
        assert_eq!(opts.solver, SolverType::FastDecoupledXB);
        assert_eq!(opts.q_control, QControl::Iterative);
        assert_eq!(opts.step_policy, StepPolicy::LineSearch);
        assert_eq!(opts.helm_extrapolation, HelmExtrapolation::Wynn);
        assert_eq!(opts.tolerance_exponent(), -8);
        assert_eq!(opts.max_iter, PowerFlowOptions::default().max_iter);

        assert!(matches!(
            PowerFlowOptions::from_json(r#"{"solver": "magic"}"#),
            Err(PowerFlowError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_option_checks() {
        assert!(PowerFlowOptions::default().check(3).is_ok());
        let bad = PowerFlowOptions {
            tolerance: 0.0,
            ..Default::default()
        };
        assert!(bad.check(3).is_err());

        let warm = PowerFlowOptions::default().with_warm_start(DVector::from_element(2, Complex64::new(1.0, 0.0)));
        assert_eq!(
            warm.check(3),
            Err(PowerFlowError::length_mismatch("warm_start", 3, 2))
        );
        approx::assert_relative_eq!(
            PowerFlowOptions::default().with_tolerance_exponent(-4).tolerance,
            1e-4
        );
    }
}
