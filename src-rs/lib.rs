pub mod config;
pub mod engine;
pub mod error;
pub mod helpers;
pub mod result;
pub mod testing;

#[path = "task/lib.rs"]
pub mod task;
#[path = "session/lib.rs"]
pub mod session;
#[path = "units/lib.rs"]
pub mod units;
#[path = "jobs/lib.rs"]
pub mod jobs;

pub use config::{EngineConfig, StoreBackend};
pub use engine::Engine;
pub use error::{EngineError, JobError, RegistryError, StoreError, STOPPED_BY_OPERATOR};
pub use result::RunSummary;
