//! Discrete controls run between inner solves: generator reactive limits,
//! transformer tap changers and distributed slack.

pub mod qlim;
pub mod slack;
pub mod taps;

pub use qlim::*;
pub use slack::*;
pub use taps::*;
