// Request, cache and worker metrics
pub mod collector;

pub use collector::*;
