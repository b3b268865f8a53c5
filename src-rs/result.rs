use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one work-unit run, stored as the task's `result_data`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: u64,
    pub first_pass_failed: u64,
    pub recovered: usize,
    /// Unit indices that failed both passes.
    pub still_failed: Vec<usize>,
    /// Sessions opened by this run (not counting earlier runs of a resumed task).
    pub sessions_opened: u32,
}

impl RunSummary {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn all_succeeded(&self) -> bool {
        self.still_failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_serializes_flat() {
        let summary = RunSummary {
            total: 3,
            succeeded: 2,
            first_pass_failed: 1,
            recovered: 0,
            still_failed: vec![2],
            sessions_opened: 2,
        };
        assert!(!summary.all_succeeded());
        assert_eq!(summary.to_value()["still_failed"], json!([2]));
    }
}
