//! Crash-safe storage for small structured records on shared storage.
//!
//! A write materializes the candidate next to the target, re-reads and
//! validates it, and only then renames it over the target. Readers therefore
//! see either the previous record or the new one, never a partial or
//! malformed file. There is no locking: each key has exactly one writer.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

const STATUS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/agent_status.schema.json"
));
const SIGNAL_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/signal_record.schema.json"
));

static STATUS: LazyLock<RecordSchema> = LazyLock::new(|| {
    RecordSchema::compile("status", STATUS_SCHEMA).expect("status schema should be valid")
});
static SIGNAL: LazyLock<RecordSchema> = LazyLock::new(|| {
    RecordSchema::compile("signal", SIGNAL_SCHEMA).expect("signal schema should be valid")
});

/// Schema for `status/<agent>.json`.
pub fn status_schema() -> &'static RecordSchema {
    &STATUS
}

/// Schema for handoff and blocker records.
pub fn signal_schema() -> &'static RecordSchema {
    &SIGNAL
}

/// Result of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The candidate replaced the target.
    Committed,
    /// The candidate failed validation; the previous record is untouched.
    Discarded,
}

/// Compiled JSON Schema used to validate record candidates.
pub struct RecordSchema {
    name: &'static str,
    validator: jsonschema::Validator,
}

impl RecordSchema {
    pub fn compile(name: &'static str, raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).with_context(|| format!("parse {name} schema"))?;
        let validator = jsonschema::validator_for(&value)
            .map_err(|err| anyhow!("invalid {name} schema: {err}"))?;
        Ok(Self { name, validator })
    }

    pub fn check(&self, instance: &Value) -> Result<()> {
        let messages: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!(
                "{} record failed schema validation: {}",
                self.name,
                messages.join("; ")
            );
        }
        Ok(())
    }
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read record {}", path.display())),
    }
}

/// Read and deserialize a JSON record; `None` when absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(contents) = read_optional(path)? else {
        return Ok(None);
    };
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("parse record {}", path.display()))?;
    Ok(Some(value))
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// The candidate must parse back as JSON and, when `schema` is given, satisfy it.
pub fn write_json<T: Serialize>(
    path: &Path,
    value: &T,
    schema: Option<&RecordSchema>,
) -> Result<WriteOutcome> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize record")?;
    buf.push('\n');
    write_validated(path, &buf, |contents| {
        let parsed: Value = serde_json::from_str(contents).context("candidate is not valid json")?;
        if let Some(schema) = schema {
            schema.check(&parsed)?;
        }
        Ok(())
    })
}

/// Write `contents` to a temp file, validate what landed on disk, then rename.
pub fn write_validated<F>(path: &Path, contents: &str, validate: F) -> Result<WriteOutcome>
where
    F: FnOnce(&str) -> Result<()>,
{
    let parent = path
        .parent()
        .with_context(|| format!("record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let tmp_path = temp_path(path);
    write_synced(&tmp_path, contents)?;
    let landed = fs::read_to_string(&tmp_path)
        .with_context(|| format!("read back candidate {}", tmp_path.display()))?;

    if let Err(err) = validate(&landed) {
        warn!(path = %path.display(), "discarding invalid record candidate: {err:#}");
        fs::remove_file(&tmp_path)
            .with_context(|| format!("remove candidate {}", tmp_path.display()))?;
        return Ok(WriteOutcome::Discarded);
    }

    fs::rename(&tmp_path, path).with_context(|| format!("replace record {}", path.display()))?;
    debug!(path = %path.display(), "record committed");
    Ok(WriteOutcome::Committed)
}

/// Remove a record, returning whether it existed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove record {}", path.display())),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

fn write_synced(path: &Path, contents: &str) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("create candidate {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write candidate {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync candidate {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn leftover_temps(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").path())
            .filter(|p| p.to_string_lossy().ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/sample.json");
        let sample = Sample {
            name: "api".to_string(),
            count: 3,
        };

        let outcome = write_json(&path, &sample, None).expect("write");
        assert_eq!(outcome, WriteOutcome::Committed);
        let loaded: Option<Sample> = read_json(&path).expect("read");
        assert_eq!(loaded, Some(sample));
        assert!(leftover_temps(path.parent().expect("parent")).is_empty());
    }

    #[test]
    fn absent_record_reads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded: Option<Sample> = read_json(&temp.path().join("missing.json")).expect("read");
        assert!(loaded.is_none());
    }

    #[test]
    fn invalid_candidate_keeps_previous_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        let good = Sample {
            name: "api".to_string(),
            count: 1,
        };
        write_json(&path, &good, None).expect("write good");
        let before = fs::read_to_string(&path).expect("read before");

        // A shape the status schema rejects.
        let outcome = write_json(&path, &good, Some(status_schema())).expect("write bad");
        assert_eq!(outcome, WriteOutcome::Discarded);
        assert_eq!(fs::read_to_string(&path).expect("read after"), before);
        assert!(leftover_temps(temp.path()).is_empty());
    }

    #[test]
    fn validator_sees_the_bytes_on_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("restart_count");

        let outcome = write_validated(&path, "7\n", |c| {
            c.trim().parse::<u32>().map(|_| ()).context("not an integer")
        })
        .expect("write");
        assert_eq!(outcome, WriteOutcome::Committed);

        let outcome = write_validated(&path, "seven", |c| {
            c.trim().parse::<u32>().map(|_| ()).context("not an integer")
        })
        .expect("write");
        assert_eq!(outcome, WriteOutcome::Discarded);
        assert_eq!(fs::read_to_string(&path).expect("read"), "7\n");
    }

    #[test]
    fn remove_reports_presence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("handoff.json");
        assert!(!remove_if_exists(&path).expect("remove missing"));
        fs::write(&path, "{}").expect("write");
        assert!(remove_if_exists(&path).expect("remove present"));
        assert!(!path.exists());
    }

    #[test]
    fn embedded_schemas_compile() {
        let _ = status_schema();
        let _ = signal_schema();
    }
}
