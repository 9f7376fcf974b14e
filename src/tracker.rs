/// The failure tracker and its replay side.
///
/// Workers never propagate errors; they append records here. When a run
/// ends with failures, the records are persisted as a JSON-lines file in
/// the repository root (first line `commitid:<hex>`), and a later
/// `--deploy-failures` run reads that file back to narrow the next plan to
/// exactly the hosts and files that failed.
use crate::error::FatalError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

pub const TRACKER_FILE: &str = ".scmp-failtracker.json";

/// Name written by older controller builds; still honored on read.
pub const LEGACY_TRACKER_FILE: &str = ".failtracker.meta";

/// Sentinel file name for a failure that precedes any per-file work.
pub const WHOLE_HOST: &str = "N/A";

static COMMIT_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new("commitid:([0-9a-fA-F]+)").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailRecord {
    #[serde(rename = "endpointName")]
    pub endpoint_name: String,
    #[serde(rename = "files")]
    pub files: Vec<String>,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    /// Restore failures and similar aftermath records: shown on the
    /// console, filtered from the persisted file.
    #[serde(skip)]
    pub non_root_cause: bool,
}

#[derive(Default)]
pub struct FailureTracker {
    records: Mutex<Vec<FailRecord>>,
}

impl FailureTracker {
    pub fn new() -> FailureTracker {
        FailureTracker::default()
    }

    pub fn record(
        &self,
        endpoint: &str,
        files: Vec<String>,
        error: impl std::fmt::Display,
        non_root_cause: bool,
    ) {
        let message = error.to_string().replace(['\n', '\r'], " ");
        let mut records = self.records.lock().expect("failure tracker mutex poisoned");
        records.push(FailRecord {
            endpoint_name: endpoint.to_string(),
            files,
            error_message: message,
            non_root_cause,
        });
    }

    /// Records a failure that took down the whole host before per-file work.
    pub fn record_host(&self, endpoint: &str, error: impl std::fmt::Display) {
        self.record(endpoint, vec![WHOLE_HOST.to_string()], error, false);
    }

    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .expect("failure tracker mutex poisoned")
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .expect("failure tracker mutex poisoned")
            .len()
    }

    pub fn snapshot(&self) -> Vec<FailRecord> {
        self.records
            .lock()
            .expect("failure tracker mutex poisoned")
            .clone()
    }

    /// Overwrites the tracker file with the root-cause records.
    pub fn write_file(&self, repo_root: &Path, commit_id: &str) -> std::io::Result<PathBuf> {
        let path = repo_root.join(TRACKER_FILE);
        let mut out = format!("commitid:{}\n", commit_id);
        for record in self.snapshot() {
            if !record.non_root_cause {
                let line = serde_json::to_string(&record)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                out.push_str(&line);
                out.push('\n');
            }
        }
        std::fs::write(&path, out)?;
        Ok(path)
    }

    /// Human-readable failure cascade: host, files, then the cause chain
    /// indented one level per `: ` segment.
    pub fn console_report(&self) -> String {
        let mut out = String::new();
        for record in self.snapshot() {
            let _ = writeln!(out, "{}:", record.endpoint_name);
            let _ = writeln!(out, "  files: {}", record.files.join(", "));
            for (depth, segment) in record.error_message.split(": ").enumerate() {
                let _ = writeln!(out, "  {}{}", "  ".repeat(depth), segment);
            }
        }
        out
    }
}

/// The scope a `--deploy-failures` run is narrowed to.
#[derive(Debug, Clone)]
pub struct ReplayScope {
    pub commit_id: String,
    /// Host -> failed target paths; `None` means every file of the host.
    pub hosts: BTreeMap<String, Option<Vec<String>>>,
}

pub fn tracker_path(repo_root: &Path) -> PathBuf {
    repo_root.join(TRACKER_FILE)
}

/// The tracker file a replay should read: the current name, or the legacy
/// one when only it exists.
pub fn existing_tracker_path(repo_root: &Path) -> PathBuf {
    let current = repo_root.join(TRACKER_FILE);
    if current.exists() {
        return current;
    }
    let legacy = repo_root.join(LEGACY_TRACKER_FILE);
    if legacy.exists() {
        return legacy;
    }
    current
}

/// Parses the tracker file back into a replay scope.
pub fn read_scope(path: &Path) -> Result<ReplayScope, FatalError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        FatalError::PlanValidation(format!(
            "could not read failure tracker `{}`: {}",
            path.display(),
            e
        ))
    })?;
    let mut lines = raw.lines();
    let first = lines.next().unwrap_or("");
    let commit_id = COMMIT_LINE_RE
        .captures(first)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            FatalError::PlanValidation(format!(
                "failure tracker `{}` does not start with a commitid line",
                path.display()
            ))
        })?;

    let mut hosts: BTreeMap<String, Option<Vec<String>>> = BTreeMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let record: FailRecord = serde_json::from_str(line).map_err(|e| {
            FatalError::PlanValidation(format!(
                "failure tracker `{}` has an unreadable record: {}",
                path.display(),
                e
            ))
        })?;
        let entry = hosts.entry(record.endpoint_name).or_insert_with(|| Some(Vec::new()));
        if record.files.iter().any(|f| f == WHOLE_HOST) {
            *entry = None;
            continue;
        }
        if let Some(files) = entry {
            for file in record.files {
                if !files.contains(&file) {
                    files.push(file);
                }
            }
        }
    }

    Ok(ReplayScope { commit_id, hosts })
}

/// Removes the tracker file after a fully clean replay.
pub fn delete_file(path: &Path) -> std::io::Result<()> {
    info!("removing failure tracker {}", path.display());
    std::fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_collapse_newlines() {
        let tracker = FailureTracker::new();
        tracker.record("webA", vec!["/a".to_string()], "line one\nline two", false);
        let records = tracker.snapshot();
        assert_eq!(records[0].error_message, "line one line two");
    }

    #[test]
    fn write_then_read_reproduces_failed_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FailureTracker::new();
        tracker.record("webA", vec!["/a".to_string()], "upload failed", false);
        tracker.record_host("webB", "connect refused");
        let commit = "c".repeat(40);
        let path = tracker.write_file(dir.path(), &commit).unwrap();
        assert_eq!(path, dir.path().join(TRACKER_FILE));

        let scope = read_scope(&path).unwrap();
        assert_eq!(scope.commit_id, commit);
        assert_eq!(scope.hosts.len(), 2);
        assert_eq!(
            scope.hosts.get("webA"),
            Some(&Some(vec!["/a".to_string()]))
        );
        assert_eq!(scope.hosts.get("webB"), Some(&None));
    }

    #[test]
    fn non_root_cause_records_are_filtered_from_file_but_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FailureTracker::new();
        tracker.record("webA", vec!["/a".to_string()], "verify mismatch", false);
        tracker.record(
            "webA",
            vec!["/a".to_string()],
            "failed old config restoration",
            true,
        );
        let path = tracker.write_file(dir.path(), &"d".repeat(40)).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("verify mismatch"));
        assert!(!raw.contains("restoration"));

        let report = tracker.console_report();
        assert!(report.contains("verify mismatch"));
        assert!(report.contains("restoration"));
    }

    #[test]
    fn whole_host_sentinel_wins_over_file_lists() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FailureTracker::new();
        tracker.record("webB", vec!["/x".to_string()], "one file", false);
        tracker.record_host("webB", "later the connection died");
        let path = tracker.write_file(dir.path(), &"e".repeat(40)).unwrap();
        let scope = read_scope(&path).unwrap();
        assert_eq!(scope.hosts.get("webB"), Some(&None));
    }

    #[test]
    fn legacy_tracker_name_is_honored_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join(LEGACY_TRACKER_FILE);
        std::fs::write(
            &legacy,
            format!(
                "commitid:{}\n{}\n",
                "f".repeat(40),
                "{\"endpointName\":\"webA\",\"files\":[\"/a\"],\"errorMessage\":\"x\"}"
            ),
        )
        .unwrap();
        assert_eq!(existing_tracker_path(dir.path()), legacy);
        let scope = read_scope(&existing_tracker_path(dir.path())).unwrap();
        assert_eq!(scope.commit_id, "f".repeat(40));

        // The current name wins once it exists.
        std::fs::write(dir.path().join(TRACKER_FILE), "commitid:abc\n").unwrap();
        assert_eq!(
            existing_tracker_path(dir.path()),
            dir.path().join(TRACKER_FILE)
        );
    }

    #[test]
    fn missing_commit_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TRACKER_FILE);
        std::fs::write(&path, "{\"endpointName\":\"a\",\"files\":[],\"errorMessage\":\"x\"}\n")
            .unwrap();
        assert!(matches!(
            read_scope(&path),
            Err(FatalError::PlanValidation(_))
        ));
    }

    #[test]
    fn console_report_indents_cause_chain() {
        let tracker = FailureTracker::new();
        tracker.record(
            "webA",
            vec!["/etc/nginx/nginx.conf".to_string()],
            "deploy failed: verify step: hash mismatch",
            false,
        );
        let report = tracker.console_report();
        assert!(report.contains("webA:"));
        assert!(report.contains("  deploy failed"));
        assert!(report.contains("    verify step"));
        assert!(report.contains("      hash mismatch"));
    }
}
