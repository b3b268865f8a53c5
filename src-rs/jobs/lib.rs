pub mod download;
pub mod registry;
pub mod types;

pub use download::{
    artifact_name, download_job, load_links, parse_links, register_builtin, task_name_for, DownloadParams,
    DOWNLOAD_JOB,
};
pub use registry::JobRegistry;
pub use types::{JobEntry, JobSpec};
