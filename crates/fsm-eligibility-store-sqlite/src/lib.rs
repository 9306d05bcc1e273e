use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fsm_eligibility_core::{
    iso_date, AuditAction, AuditEntry, BulkBatchStatus, CheckId, CheckOutcomeHash, CheckPayload,
    normalize_nino, CheckStatus, CheckType, ContentHash, EligibilityCheck, OutcomeHashId,
    OutcomeSource, QueueDestination,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS check_outcome_hashes (
  hash_id TEXT PRIMARY KEY,
  hash TEXT NOT NULL,
  check_type TEXT NOT NULL CHECK (check_type IN ('free_school_meals')),
  outcome TEXT NOT NULL CHECK (outcome IN ('eligible','not_eligible','parent_not_found')),
  source TEXT NOT NULL CHECK (source IN ('tax_authority','immigration_support','benefits_department')),
  recorded_at TEXT NOT NULL,
  recorded_unix_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS eligibility_checks (
  check_id TEXT PRIMARY KEY,
  check_type TEXT NOT NULL CHECK (check_type IN ('free_school_meals')),
  status TEXT NOT NULL CHECK (status IN ('queued_for_processing','eligible','not_eligible','parent_not_found','source_error')),
  payload_json TEXT NOT NULL,
  group_id TEXT,
  sequence INTEGER NOT NULL DEFAULT 0 CHECK (sequence >= 0),
  hash_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (hash_id) REFERENCES check_outcome_hashes(hash_id)
);

CREATE INDEX IF NOT EXISTS idx_check_outcome_hashes_lookup
  ON check_outcome_hashes(hash, check_type, recorded_unix_ms);
CREATE INDEX IF NOT EXISTS idx_eligibility_checks_group
  ON eligibility_checks(group_id, sequence);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tax_authority_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  identifier TEXT NOT NULL,
  surname TEXT NOT NULL,
  date_of_birth TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS immigration_support_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  identifier TEXT NOT NULL,
  surname TEXT NOT NULL,
  date_of_birth TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_messages (
  message_id INTEGER PRIMARY KEY AUTOINCREMENT,
  destination TEXT NOT NULL CHECK (destination IN ('standard','bulk')),
  body_json TEXT NOT NULL,
  enqueued_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_entries (
  audit_id TEXT PRIMARY KEY,
  check_type TEXT NOT NULL,
  check_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('submitted','resolved_from_cache','resolved','source_error','status_overridden')),
  actor TEXT NOT NULL,
  detail_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tax_authority_records_lookup
  ON tax_authority_records(identifier, date_of_birth);
CREATE INDEX IF NOT EXISTS idx_immigration_support_records_lookup
  ON immigration_support_records(identifier, date_of_birth);
CREATE INDEX IF NOT EXISTS idx_queue_messages_destination
  ON queue_messages(destination, message_id);
CREATE INDEX IF NOT EXISTS idx_audit_entries_check ON audit_entries(check_id);
";

const CHECK_COLUMNS: &str = "check_id, status, payload_json, group_id, sequence, hash_id, \
                             created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Result of the guarded "record outcome then resolve" write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveWrite {
    Applied,
    NotQueued(CheckStatus),
    Missing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceDataset {
    TaxAuthority,
    ImmigrationSupport,
}

impl ReferenceDataset {
    fn table(self) -> &'static str {
        match self {
            Self::TaxAuthority => "tax_authority_records",
            Self::ImmigrationSupport => "immigration_support_records",
        }
    }

    fn normalize_identifier(self, raw: &str) -> String {
        match self {
            Self::TaxAuthority => normalize_nino(raw),
            Self::ImmigrationSupport => raw.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceRecord {
    pub identifier: String,
    pub surname: String,
    #[serde(with = "iso_date")]
    pub date_of_birth: Date,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message_id: i64,
    pub destination: QueueDestination,
    pub body: String,
    pub enqueued_at: OffsetDateTime,
}

struct CheckRow {
    check_id: String,
    status: String,
    payload_json: String,
    group_id: Option<String>,
    sequence: i64,
    hash_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CheckRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            check_id: row.get(0)?,
            status: row.get(1)?,
            payload_json: row.get(2)?,
            group_id: row.get(3)?,
            sequence: row.get(4)?,
            hash_id: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_check(self) -> Result<EligibilityCheck> {
        let payload: CheckPayload = serde_json::from_str(&self.payload_json)
            .with_context(|| format!("failed to decode payload of check {}", self.check_id))?;
        Ok(EligibilityCheck {
            check_id: parse_check_id(&self.check_id)?,
            status: parse_status(&self.status)?,
            payload,
            group_id: self.group_id,
            sequence: u32::try_from(self.sequence)
                .with_context(|| format!("sequence out of range: {}", self.sequence))?,
            hash_id: self.hash_id.as_deref().map(parse_hash_id).transpose()?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed check store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected <= {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1_i64, MIGRATION_001_SQL), (2_i64, MIGRATION_002_SQL)] {
            if version < target {
                self.apply_migration(target, sql)?;
            }
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        Ok(())
    }

    /// Persist a newly submitted check.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_check(&mut self, check: &EligibilityCheck) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO eligibility_checks(
                check_id, check_type, status, payload_json, group_id, sequence, hash_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                check.check_id.to_string(),
                check.check_type().as_str(),
                check.status.as_str(),
                serde_json::to_string(&check.payload).context("failed to serialize payload")?,
                check.group_id,
                i64::from(check.sequence),
                check.hash_id.map(|id| id.to_string()),
                rfc3339(check.created_at)?,
                rfc3339(check.updated_at)?,
            ],
        )
        .context("failed to insert eligibility check")?;
        tx.commit().context("failed to commit check insert")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_check(&self, check_id: CheckId) -> Result<Option<EligibilityCheck>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CHECK_COLUMNS} FROM eligibility_checks WHERE check_id = ?1"),
                params![check_id.to_string()],
                CheckRow::from_row,
            )
            .optional()
            .context("failed to load eligibility check")?;
        row.map(CheckRow::into_check).transpose()
    }

    /// Load every check of a batch in submission order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_group_checks(&self, group_id: &str) -> Result<Vec<EligibilityCheck>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHECK_COLUMNS} FROM eligibility_checks
             WHERE group_id = ?1
             ORDER BY sequence ASC, check_id ASC"
        ))?;
        let rows = stmt.query_map(params![group_id], CheckRow::from_row)?;

        let mut checks = Vec::new();
        for row in rows {
            checks.push(row?.into_check()?);
        }
        Ok(checks)
    }

    /// Count all and non-queued checks of a batch.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn group_status(&self, group_id: &str) -> Result<BulkBatchStatus> {
        let (total, complete) = self
            .conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN status != 'queued_for_processing' THEN 1 ELSE 0 END), 0)
                 FROM eligibility_checks
                 WHERE group_id = ?1",
                params![group_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .context("failed to aggregate batch status")?;

        Ok(BulkBatchStatus {
            total: u64::try_from(total).context("negative batch total")?,
            complete: u64::try_from(complete).context("negative batch complete count")?,
        })
    }

    /// Most recent outcome for `hash` recorded at or after `not_before`.
    ///
    /// # Errors
    /// Returns an error when the lookup or decoding fails.
    pub fn find_fresh_outcome(
        &self,
        hash: &ContentHash,
        check_type: CheckType,
        not_before: OffsetDateTime,
    ) -> Result<Option<CheckOutcomeHash>> {
        let row = self
            .conn
            .query_row(
                "SELECT hash_id, hash, check_type, outcome, source, recorded_at
                 FROM check_outcome_hashes
                 WHERE hash = ?1 AND check_type = ?2 AND recorded_unix_ms >= ?3
                 ORDER BY recorded_unix_ms DESC, hash_id DESC
                 LIMIT 1",
                params![hash.as_str(), check_type.as_str(), unix_ms(not_before)?],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("failed to look up outcome hash")?;

        let Some((hash_id, hash, check_type, outcome, source, recorded_at)) = row else {
            return Ok(None);
        };

        Ok(Some(CheckOutcomeHash {
            hash_id: parse_hash_id(&hash_id)?,
            hash: ContentHash(hash),
            check_type: CheckType::parse(&check_type)
                .ok_or_else(|| anyhow!("unknown check_type: {check_type}"))?,
            outcome: parse_status(&outcome)?,
            source: OutcomeSource::parse(&source)
                .ok_or_else(|| anyhow!("unknown outcome source: {source}"))?,
            recorded_at: parse_rfc3339(&recorded_at)?,
        }))
    }

    /// Insert an outcome row unconditionally. Duplicate hashes are expected.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_outcome_hash(&mut self, outcome: &CheckOutcomeHash) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        insert_outcome_hash_row(&tx, outcome)?;
        tx.commit().context("failed to commit outcome hash")?;
        Ok(())
    }

    /// Record `outcome` and move the check from `queued_for_processing` to the
    /// outcome status in one immediate transaction. Nothing is written unless the
    /// check is still queued.
    ///
    /// # Errors
    /// Returns an error when any statement in the transaction fails.
    pub fn resolve_check(
        &mut self,
        check_id: CheckId,
        outcome: &CheckOutcomeHash,
        updated_at: OffsetDateTime,
    ) -> Result<ResolveWrite> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start resolve transaction")?;

        let current = tx
            .query_row(
                "SELECT status FROM eligibility_checks WHERE check_id = ?1",
                params![check_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read check status")?;
        let Some(current) = current else {
            return Ok(ResolveWrite::Missing);
        };
        let current = parse_status(&current)?;
        if current != CheckStatus::QueuedForProcessing {
            return Ok(ResolveWrite::NotQueued(current));
        }

        insert_outcome_hash_row(&tx, outcome)?;
        let updated = tx
            .execute(
                "UPDATE eligibility_checks
                 SET status = ?1, hash_id = ?2, updated_at = ?3
                 WHERE check_id = ?4 AND status = 'queued_for_processing'",
                params![
                    outcome.outcome.as_str(),
                    outcome.hash_id.to_string(),
                    rfc3339(updated_at)?,
                    check_id.to_string(),
                ],
            )
            .context("failed to update check status")?;
        if updated != 1 {
            return Ok(ResolveWrite::NotQueued(current));
        }

        tx.commit().context("failed to commit resolve transaction")?;
        Ok(ResolveWrite::Applied)
    }

    /// Overwrite the status of an existing check. Returns `false` when no check matched.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn override_status(
        &mut self,
        check_id: CheckId,
        status: CheckStatus,
        updated_at: OffsetDateTime,
    ) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let updated = tx
            .execute(
                "UPDATE eligibility_checks SET status = ?1, updated_at = ?2 WHERE check_id = ?3",
                params![status.as_str(), rfc3339(updated_at)?, check_id.to_string()],
            )
            .context("failed to override check status")?;
        tx.commit().context("failed to commit status override")?;
        Ok(updated == 1)
    }

    /// # Errors
    /// Returns an error when any insert fails; the batch is written atomically.
    pub fn insert_reference_records(
        &mut self,
        dataset: ReferenceDataset,
        records: &[ReferenceRecord],
    ) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {}(identifier, surname, date_of_birth) VALUES (?1, ?2, ?3)",
                dataset.table()
            ))?;
            for record in records {
                stmt.execute(params![
                    dataset.normalize_identifier(&record.identifier),
                    record.surname.trim().to_uppercase(),
                    iso_date::format(record.date_of_birth),
                ])
                .with_context(|| format!("failed to insert {} record", dataset.table()))?;
            }
        }
        tx.commit().context("failed to commit reference records")?;
        Ok(records.len())
    }

    /// Surnames of every record matching `identifier` and `date_of_birth` exactly.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn reference_surnames(
        &self,
        dataset: ReferenceDataset,
        identifier: &str,
        date_of_birth: Date,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT surname FROM {} WHERE identifier = ?1 AND date_of_birth = ?2 ORDER BY id ASC",
            dataset.table()
        ))?;
        let rows = stmt.query_map(
            params![dataset.normalize_identifier(identifier), iso_date::format(date_of_birth)],
            |row| row.get::<_, String>(0),
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to query {}", dataset.table()))
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn enqueue_message(&mut self, destination: QueueDestination, body: &str) -> Result<i64> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO queue_messages(destination, body_json, enqueued_at) VALUES (?1, ?2, ?3)",
            params![destination.as_str(), body, now_rfc3339()?],
        )
        .context("failed to enqueue message")?;
        let message_id = tx.last_insert_rowid();
        tx.commit().context("failed to commit queue message")?;
        Ok(message_id)
    }

    /// Up to `limit` pending messages in FIFO order. Messages stay in the outbox
    /// until acknowledged with [`SqliteStore::ack_message`].
    ///
    /// # Errors
    /// Returns an error when the select fails.
    pub fn peek_messages(
        &self,
        destination: QueueDestination,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>> {
        let limit = i64::try_from(limit).context("receive limit out of range")?;
        let mut stmt = self.conn.prepare(
            "SELECT message_id, body_json, enqueued_at FROM queue_messages
             WHERE destination = ?1
             ORDER BY message_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![destination.as_str(), limit], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        let raw =
            rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read queue messages")?;

        raw.into_iter()
            .map(|(message_id, body, enqueued_at)| {
                Ok(QueuedMessage {
                    message_id,
                    destination,
                    body,
                    enqueued_at: parse_rfc3339(&enqueued_at)?,
                })
            })
            .collect()
    }

    /// Delete a handled message. Returns `false` when it was already gone.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn ack_message(&mut self, message_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM queue_messages WHERE message_id = ?1", params![message_id])
            .with_context(|| format!("failed to acknowledge queue message {message_id}"))?;
        Ok(deleted > 0)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn queue_depth(&self, destination: QueueDestination) -> Result<u64> {
        let depth = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE destination = ?1",
                params![destination.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count queue messages")?;
        u64::try_from(depth).context("negative queue depth")
    }

    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_audit_entry(&mut self, entry: &AuditEntry) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO audit_entries(
                audit_id, check_type, check_id, action, actor, detail_json, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.audit_id.to_string(),
                entry.check_type.as_str(),
                entry.check_id.to_string(),
                entry.action.as_str(),
                entry.actor,
                serde_json::to_string(&entry.detail).context("failed to serialize audit detail")?,
                rfc3339(entry.recorded_at)?,
            ],
        )
        .context("failed to insert audit entry")?;
        tx.commit().context("failed to commit audit entry")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_audit_entries(&self, check_id: CheckId) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT audit_id, check_type, action, actor, detail_json, recorded_at
             FROM audit_entries
             WHERE check_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![check_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (audit_id, check_type, action, actor, detail_json, recorded_at) = row?;
            entries.push(AuditEntry {
                audit_id: Ulid::from_string(&audit_id)
                    .with_context(|| format!("invalid ULID: {audit_id}"))?,
                check_type: CheckType::parse(&check_type)
                    .ok_or_else(|| anyhow!("unknown check_type: {check_type}"))?,
                check_id,
                action: AuditAction::parse(&action)
                    .ok_or_else(|| anyhow!("unknown audit action: {action}"))?,
                actor,
                detail: serde_json::from_str(&detail_json)
                    .context("failed to deserialize audit detail")?,
                recorded_at: parse_rfc3339(&recorded_at)?,
            });
        }
        Ok(entries)
    }
}

fn insert_outcome_hash_row(conn: &Connection, outcome: &CheckOutcomeHash) -> Result<()> {
    conn.execute(
        "INSERT INTO check_outcome_hashes(
            hash_id, hash, check_type, outcome, source, recorded_at, recorded_unix_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            outcome.hash_id.to_string(),
            outcome.hash.as_str(),
            outcome.check_type.as_str(),
            outcome.outcome.as_str(),
            outcome.source.as_str(),
            rfc3339(outcome.recorded_at)?,
            unix_ms(outcome.recorded_at)?,
        ],
    )
    .context("failed to insert outcome hash")?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn unix_ms(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000)
        .with_context(|| format!("timestamp out of range: {value}"))
}

fn parse_status(raw: &str) -> Result<CheckStatus> {
    CheckStatus::parse(raw).ok_or_else(|| anyhow!("unknown check status: {raw}"))
}

fn parse_check_id(raw: &str) -> Result<CheckId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(CheckId(parsed))
}

fn parse_hash_id(raw: &str) -> Result<OutcomeHashId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(OutcomeHashId(parsed))
}

#[cfg(test)]
mod tests {
    use fsm_eligibility_core::{canonicalize, RawIdentity};
    use time::{Duration, Month};

    use super::*;

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn dob() -> Date {
        match Date::from_calendar_date(1985, Month::July, 14) {
            Ok(date) => date,
            Err(err) => panic!("fixture date should be valid: {err}"),
        }
    }

    fn payload(surname: &str, nino: &str) -> CheckPayload {
        let raw = RawIdentity {
            surname: surname.to_string(),
            date_of_birth: dob(),
            national_insurance_number: Some(nino.to_string()),
            asylum_support_reference: None,
        };
        match canonicalize(&raw) {
            Ok(identity) => CheckPayload::FreeSchoolMeals(identity),
            Err(err) => panic!("fixture identity should canonicalize: {err}"),
        }
    }

    fn queued_check(group_id: Option<&str>, sequence: u32) -> EligibilityCheck {
        let now = OffsetDateTime::now_utc();
        EligibilityCheck {
            check_id: CheckId::new(),
            status: CheckStatus::QueuedForProcessing,
            payload: payload("Smith", "AB123456C"),
            group_id: group_id.map(ToString::to_string),
            sequence,
            hash_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn outcome_at(recorded_at: OffsetDateTime, status: CheckStatus) -> Result<CheckOutcomeHash> {
        CheckOutcomeHash::new(
            &payload("Smith", "AB123456C"),
            status,
            OutcomeSource::TaxAuthority,
            recorded_at,
        )
        .map_err(|err| anyhow!("{err}"))
    }

    #[test]
    fn migrate_is_idempotent_and_reports_up_to_date() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn check_constraints_reject_unknown_status() -> Result<()> {
        let store = migrated_store()?;
        let result = store.conn.execute(
            "INSERT INTO eligibility_checks(
                check_id, check_type, status, payload_json, group_id, sequence, hash_id,
                created_at, updated_at
            ) VALUES (?1, 'free_school_meals', 'maybe', '{}', NULL, 0, NULL, ?2, ?2)",
            params![CheckId::new().to_string(), "2026-01-01T00:00:00Z"],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn inserted_check_round_trips() -> Result<()> {
        let mut store = migrated_store()?;
        let check = queued_check(Some("batch-1"), 4);
        store.insert_check(&check)?;

        let loaded = store.get_check(check.check_id)?.ok_or_else(|| anyhow!("check missing"))?;
        assert_eq!(loaded.check_id, check.check_id);
        assert_eq!(loaded.payload, check.payload);
        assert_eq!(loaded.group_id.as_deref(), Some("batch-1"));
        assert_eq!(loaded.sequence, 4);
        assert!(store.get_check(CheckId::new())?.is_none());
        Ok(())
    }

    #[test]
    fn group_checks_are_ordered_by_sequence_not_insertion() -> Result<()> {
        let mut store = migrated_store()?;
        for sequence in [3_u32, 1, 2] {
            store.insert_check(&queued_check(Some("batch-2"), sequence))?;
        }
        store.insert_check(&queued_check(Some("other"), 0))?;

        let sequences = store
            .list_group_checks("batch-2")?
            .iter()
            .map(|check| check.sequence)
            .collect::<Vec<_>>();
        assert_eq!(sequences, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn group_status_counts_resolved_members() -> Result<()> {
        let mut store = migrated_store()?;
        let mut checks = Vec::new();
        for sequence in 1..=5 {
            let check = queued_check(Some("batch-3"), sequence);
            store.insert_check(&check)?;
            checks.push(check);
        }
        for check in checks.iter().take(3) {
            let outcome = outcome_at(OffsetDateTime::now_utc(), CheckStatus::Eligible)?;
            assert_eq!(
                store.resolve_check(check.check_id, &outcome, OffsetDateTime::now_utc())?,
                ResolveWrite::Applied
            );
        }

        assert_eq!(store.group_status("batch-3")?, BulkBatchStatus { total: 5, complete: 3 });
        assert_eq!(store.group_status("missing")?, BulkBatchStatus { total: 0, complete: 0 });
        Ok(())
    }

    #[test]
    fn fresh_outcome_lookup_honours_window_and_recency() -> Result<()> {
        let mut store = migrated_store()?;
        let now = OffsetDateTime::now_utc();
        let old = outcome_at(now - Duration::days(40), CheckStatus::NotEligible)?;
        let recent = outcome_at(now - Duration::days(2), CheckStatus::Eligible)?;
        store.insert_outcome_hash(&old)?;
        store.insert_outcome_hash(&recent)?;

        let found = store
            .find_fresh_outcome(&recent.hash, CheckType::FreeSchoolMeals, now - Duration::days(30))?
            .ok_or_else(|| anyhow!("fresh outcome should be found"))?;
        assert_eq!(found.hash_id, recent.hash_id);
        assert_eq!(found.outcome, CheckStatus::Eligible);

        let none = store.find_fresh_outcome(
            &recent.hash,
            CheckType::FreeSchoolMeals,
            now - Duration::days(1),
        )?;
        assert!(none.is_none());
        Ok(())
    }

    #[test]
    fn resolve_check_writes_nothing_when_not_queued() -> Result<()> {
        let mut store = migrated_store()?;
        let check = queued_check(None, 0);
        store.insert_check(&check)?;

        let first = outcome_at(OffsetDateTime::now_utc(), CheckStatus::Eligible)?;
        assert_eq!(
            store.resolve_check(check.check_id, &first, OffsetDateTime::now_utc())?,
            ResolveWrite::Applied
        );

        let second = outcome_at(OffsetDateTime::now_utc(), CheckStatus::NotEligible)?;
        assert_eq!(
            store.resolve_check(check.check_id, &second, OffsetDateTime::now_utc())?,
            ResolveWrite::NotQueued(CheckStatus::Eligible)
        );

        let hashes: i64 =
            store.conn.query_row("SELECT COUNT(*) FROM check_outcome_hashes", [], |row| {
                row.get(0)
            })?;
        assert_eq!(hashes, 1);

        let loaded = store.get_check(check.check_id)?.ok_or_else(|| anyhow!("check missing"))?;
        assert_eq!(loaded.status, CheckStatus::Eligible);
        assert_eq!(loaded.hash_id, Some(first.hash_id));

        assert_eq!(
            store.resolve_check(CheckId::new(), &second, OffsetDateTime::now_utc())?,
            ResolveWrite::Missing
        );
        Ok(())
    }

    #[test]
    fn reference_lookup_matches_identifier_and_date_exactly() -> Result<()> {
        let mut store = migrated_store()?;
        store.insert_reference_records(
            ReferenceDataset::TaxAuthority,
            &[
                ReferenceRecord {
                    identifier: "ab 12 34 56 c".to_string(),
                    surname: "Smithson".to_string(),
                    date_of_birth: dob(),
                },
                ReferenceRecord {
                    identifier: "AB123456C".to_string(),
                    surname: "Jones".to_string(),
                    date_of_birth: dob() + Duration::days(1),
                },
            ],
        )?;

        let surnames =
            store.reference_surnames(ReferenceDataset::TaxAuthority, "AB123456C", dob())?;
        assert_eq!(surnames, vec!["SMITHSON".to_string()]);
        let other =
            store.reference_surnames(ReferenceDataset::ImmigrationSupport, "AB123456C", dob())?;
        assert!(other.is_empty());
        Ok(())
    }

    #[test]
    fn queue_is_fifo_per_destination_and_keeps_messages_until_acked() -> Result<()> {
        let mut store = migrated_store()?;
        store.enqueue_message(QueueDestination::Standard, "{\"n\":1}")?;
        store.enqueue_message(QueueDestination::Bulk, "{\"n\":2}")?;
        store.enqueue_message(QueueDestination::Standard, "{\"n\":3}")?;

        assert_eq!(store.queue_depth(QueueDestination::Standard)?, 2);
        let first = store.peek_messages(QueueDestination::Standard, 1)?;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].body, "{\"n\":1}");
        assert_eq!(store.queue_depth(QueueDestination::Standard)?, 2);

        assert!(store.ack_message(first[0].message_id)?);
        assert!(!store.ack_message(first[0].message_id)?);
        let rest = store.peek_messages(QueueDestination::Standard, 10)?;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].body, "{\"n\":3}");
        assert!(store.ack_message(rest[0].message_id)?);
        assert_eq!(store.queue_depth(QueueDestination::Standard)?, 0);
        assert_eq!(store.queue_depth(QueueDestination::Bulk)?, 1);
        Ok(())
    }

    #[test]
    fn audit_entries_round_trip_per_check() -> Result<()> {
        let mut store = migrated_store()?;
        let check_id = CheckId::new();
        store.insert_audit_entry(&AuditEntry {
            audit_id: Ulid::new(),
            check_type: CheckType::FreeSchoolMeals,
            check_id,
            action: AuditAction::Submitted,
            actor: "tester".to_string(),
            detail: serde_json::json!({ "status": "queued_for_processing" }),
            recorded_at: OffsetDateTime::now_utc(),
        })?;

        let entries = store.list_audit_entries(check_id)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Submitted);
        assert!(store.list_audit_entries(CheckId::new())?.is_empty());
        Ok(())
    }
}
