//! Handoff and blocker records, plus read-only operator feedback.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::info;

use crate::core::types::{SignalOutcome, SignalRecord};
use crate::io::layout::AgentPaths;
use crate::io::record_store::{
    WriteOutcome, read_json, read_optional, remove_if_exists, signal_schema, write_json,
};

/// Publish a success signal for downstream agents.
///
/// Any blocker from an earlier attempt is removed first.
pub fn write_handoff(paths: &AgentPaths, record: &SignalRecord) -> Result<WriteOutcome> {
    debug_assert_eq!(record.outcome, SignalOutcome::Success);
    remove_if_exists(&paths.blocker_path)?;
    let outcome = write_json(&paths.handoff_path, record, Some(signal_schema()))?;
    info!(agent = %record.agent, cycle = record.cycle, rate = record.test_pass_rate, "handoff written");
    Ok(outcome)
}

/// Publish a failure signal for operators.
pub fn write_blocker(paths: &AgentPaths, record: &SignalRecord) -> Result<WriteOutcome> {
    debug_assert_eq!(record.outcome, SignalOutcome::Failure);
    remove_if_exists(&paths.handoff_path)?;
    let outcome = write_json(&paths.blocker_path, record, Some(signal_schema()))?;
    info!(agent = %record.agent, cycle = record.cycle, rate = record.test_pass_rate, "blocker written");
    Ok(outcome)
}

pub fn read_signal(path: &Path) -> Result<Option<SignalRecord>> {
    read_json(path)
}

/// Operator feedback for the next worker invocation; blank files count as absent.
pub fn read_feedback(path: &Path) -> Result<Option<String>> {
    Ok(read_optional(path)?
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty()))
}

/// Modification time of a record, if present.
pub fn modified_at(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta
                .modified()
                .with_context(|| format!("read mtime {}", path.display()))?;
            Ok(Some(modified))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("stat record {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::layout::StateLayout;
    use chrono::Utc;

    fn record(outcome: SignalOutcome) -> SignalRecord {
        SignalRecord {
            agent: "api".to_string(),
            outcome,
            cycle: 2,
            tests_pass: 9,
            tests_fail: 1,
            test_pass_rate: 90,
            target_pass_rate: 85,
            summary: "cycle 2".to_string(),
            written_at: Utc::now(),
        }
    }

    #[test]
    fn handoff_and_blocker_are_exclusive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StateLayout::new(temp.path()).agent("api");

        write_blocker(&paths, &record(SignalOutcome::Failure)).expect("blocker");
        assert!(paths.blocker_path.exists());

        let outcome = write_handoff(&paths, &record(SignalOutcome::Success)).expect("handoff");
        assert_eq!(outcome, WriteOutcome::Committed);
        assert!(paths.handoff_path.exists());
        assert!(!paths.blocker_path.exists());

        let loaded = read_signal(&paths.handoff_path).expect("read").expect("present");
        assert_eq!(loaded.outcome, SignalOutcome::Success);
        assert_eq!(loaded.test_pass_rate, 90);
    }

    #[test]
    fn blank_feedback_is_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("feedback.md");
        assert_eq!(read_feedback(&path).expect("read"), None);

        fs::write(&path, "  \n").expect("write");
        assert_eq!(read_feedback(&path).expect("read"), None);

        fs::write(&path, "focus on the cart tests\n").expect("write");
        assert_eq!(
            read_feedback(&path).expect("read").as_deref(),
            Some("focus on the cart tests")
        );
    }

    #[test]
    fn modified_at_is_none_when_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(modified_at(&temp.path().join("nope")).expect("stat").is_none());
        let path = temp.path().join("yes");
        fs::write(&path, "x").expect("write");
        assert!(modified_at(&path).expect("stat").is_some());
    }
}
