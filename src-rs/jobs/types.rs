use serde::{Deserialize, Serialize};

use crate::task::WorkFn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub description: String,
    pub can_resume: bool,
}

impl JobSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            can_resume: true,
        }
    }
}

pub struct JobEntry {
    pub name: String,
    pub handler: WorkFn,
    pub spec: JobSpec,
}
