use std::path::PathBuf;

use anyhow::Result;
use fsm_eligibility_core::{AuditAction, AuditEntry, CheckId, CheckType};
use fsm_eligibility_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;
use ulid::Ulid;

/// Who is driving an engine operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditContext {
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl AuditContext {
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self { actor: actor.into(), reason: None }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn entry(
        &self,
        check_type: CheckType,
        check_id: CheckId,
        action: AuditAction,
        mut detail: serde_json::Value,
    ) -> AuditEntry {
        if let (Some(reason), Some(object)) = (&self.reason, detail.as_object_mut()) {
            object.insert("reason".to_string(), serde_json::Value::String(reason.clone()));
        }
        AuditEntry {
            audit_id: Ulid::new(),
            check_type,
            check_id,
            action,
            actor: self.actor.clone(),
            detail,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    /// # Errors
    /// Returns an error when the entry could not be stored.
    fn record(&self, entry: &AuditEntry) -> Result<()>;
}

/// Store an audit entry, logging and discarding any failure.
pub(crate) fn record_best_effort(sink: &dyn AuditSink, entry: &AuditEntry) {
    if let Err(err) = sink.record(entry) {
        warn!(
            check_id = %entry.check_id,
            action = entry.action.as_str(),
            error = %format!("{err:#}"),
            "audit write failed; continuing"
        );
    }
}

#[derive(Debug, Clone)]
pub struct SqliteAuditSink {
    db_path: PathBuf,
}

impl SqliteAuditSink {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        store.insert_audit_entry(entry)
    }
}
