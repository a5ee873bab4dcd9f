//! Branch reduction, island detection and island slicing.

mod islands;
mod merge;
mod slice;

pub use islands::*;
pub use merge::*;
pub use slice::*;
