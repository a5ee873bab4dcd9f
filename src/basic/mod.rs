pub mod circuit;
pub mod control;
pub(crate) mod dsbus_dv;
pub mod error;
pub mod fdpf;
pub mod gausspf;
pub mod helm;
pub(crate) mod jacobian;
pub mod levenberg;
pub mod linearpf;
pub mod mismatch;
pub mod newtonpf;
pub mod newtonpf_i;
pub mod options;
pub mod pf;
pub mod powerflow;
pub mod results;
pub mod solver;
pub(crate) mod sparse;
pub mod system;
pub mod topology;

pub use circuit::*;
pub use error::{PowerFlowError, Result};
pub use newtonpf::newton_pf;
pub use options::*;
pub use pf::{CancelToken, IslandModel, SolverConfig, SolverInput, SolverOutput};
pub use powerflow::{PowerFlow, run_power_flow, solve_with};
pub use results::{IslandReport, IslandStatus, PowerFlowResults};
