pub mod leak;
pub mod logical;

pub use leak::{LeakReport, Reachedness};
pub use logical::{PointerKind, PointsToGraph};
