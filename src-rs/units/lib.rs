pub mod runner;
pub mod types;

pub use runner::WorkUnitRunner;
pub use types::{AttemptOutcome, DelayRange, Pass, RunnerConfig, RunnerCursor, UnitOutcome, WorkUnit};
