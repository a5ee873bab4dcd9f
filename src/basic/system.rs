pub mod admittance;
pub mod connectivity;

pub use admittance::*;
pub use connectivity::*;
