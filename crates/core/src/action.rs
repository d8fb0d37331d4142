use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The command ran; `rc` is `None` when it could not be spawned at all.
    Completed {
        #[serde(default)]
        rc: Option<i32>,
    },
    DryRun,
    Skipped {
        reason: String,
    },
    Info,
}

impl Outcome {
    pub fn completed(rc: Option<i32>) -> Self {
        Outcome::Completed { rc }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Outcome::Completed { rc: Some(0) })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ActionRecord {
    pub fn new(action: impl Into<String>, target: Option<&str>, outcome: Outcome) -> Self {
        Self {
            action: action.into(),
            target: target.map(|t| t.to_string()),
            outcome,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Ordered audit trail for one host run. Records can be appended and read,
/// never edited or removed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ActionLog {
    records: Vec<ActionRecord>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ActionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ActionRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_serializes_flat() {
        let record = ActionRecord::new("wipefs", Some("/dev/sdb"), Outcome::completed(Some(0)));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({"action": "wipefs", "target": "/dev/sdb", "outcome": "completed", "rc": 0})
        );

        let skipped = ActionRecord::new("dd_end", Some("/dev/sdb"), Outcome::skipped("disk_too_small"))
            .with_details(json!({"size_bytes": 1024}));
        let value = serde_json::to_value(&skipped).unwrap();
        assert_eq!(value["outcome"], "skipped");
        assert_eq!(value["reason"], "disk_too_small");
        assert_eq!(value["details"]["size_bytes"], 1024);
    }

    #[test]
    fn record_reads_back_from_agent_output() {
        let value = json!({"action": "umount_dry_run", "target": "/mnt/ceph", "outcome": "dry_run"});
        let record: ActionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.outcome, Outcome::DryRun);
        assert!(!record.outcome.succeeded());
    }

    #[test]
    fn log_keeps_append_order() {
        let mut log = ActionLog::new();
        log.push(ActionRecord::new("first", None, Outcome::Info));
        log.push(ActionRecord::new("second", None, Outcome::Info));
        let names: Vec<&str> = log.records().iter().map(|r| r.action.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
