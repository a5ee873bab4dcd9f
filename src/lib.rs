mod basic;
pub mod testcases;
pub mod prelude {
    use crate::basic;
    pub use basic::*;
}
