//! Append-only audit log for gated network calls

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome of a gate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Allow,
    Deny,
}

/// Structured record for one gated call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAuditRecord {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub purpose: String,
    pub caller: String,
    pub mode: String,
    pub decision: AuditDecision,
}

/// Append-only audit log. Records are kept in memory and, when a sink file
/// is configured, mirrored to JSONL. Records are never rewritten.
pub struct AuditLog {
    records: Mutex<Vec<NetworkAuditRecord>>,
    sink: Option<PathBuf>,
}

impl AuditLog {
    /// In-memory log with no file sink
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    /// Log mirrored to a JSONL file
    pub fn with_sink(path: PathBuf) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            sink: Some(path),
        }
    }

    /// Append a record
    pub fn record(&self, record: NetworkAuditRecord) {
        match record.decision {
            AuditDecision::Allow => tracing::debug!(
                url = %record.url,
                purpose = %record.purpose,
                caller = %record.caller,
                mode = %record.mode,
                "network call allowed"
            ),
            AuditDecision::Deny => tracing::warn!(
                url = %record.url,
                purpose = %record.purpose,
                caller = %record.caller,
                mode = %record.mode,
                "network call denied"
            ),
        }

        if let Some(path) = &self.sink {
            if let Ok(line) = serde_json::to_string(&record) {
                let appended = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut f| writeln!(f, "{}", line));
                if let Err(e) = appended {
                    tracing::warn!("failed to append audit record: {}", e);
                }
            }
        }

        self.records.lock().push(record);
    }

    /// Snapshot of all records, oldest first
    pub fn records(&self) -> Vec<NetworkAuditRecord> {
        self.records.lock().clone()
    }

    /// Number of records with the given decision
    pub fn count(&self, decision: AuditDecision) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.decision == decision)
            .count()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
