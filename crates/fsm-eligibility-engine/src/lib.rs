use std::path::{Path, PathBuf};

use fsm_eligibility_core::{
    canonicalize, AuditAction, AuditEntry, BulkBatchStatus, BulkCheckResult, CanonicalIdentity,
    CheckError, CheckId, CheckPayload, CheckStatus, EligibilityCheck, Identifier, OutcomeSource,
    RawIdentity,
};
use fsm_eligibility_store_sqlite::{
    ReferenceDataset, ReferenceRecord, ResolveWrite, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

pub mod audit;
pub mod benefits_http;
pub mod cache;
pub mod config;
pub mod queue;
pub mod sources;
pub mod worker;

pub use audit::{AuditContext, AuditSink, SqliteAuditSink};
pub use benefits_http::HttpBenefitsClient;
pub use cache::OutcomeCache;
pub use config::{BenefitsClientConfig, EngineConfig, LinkTemplates};
pub use queue::{CheckLinks, QueueMessage, QueuePublisher, SqliteQueue};
pub use sources::{
    BenefitsClient, CitizenMatch, RecordSource, SqliteRecordSource, UnavailableBenefitsClient,
};
pub use worker::{drain, DrainReport};

use crate::audit::record_best_effort;
use crate::queue::destination_for;
use crate::sources::{match_benefits, match_records};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Check(#[from] CheckError),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
    #[error("queue failure: {0:#}")]
    Queue(anyhow::Error),
}

/// External systems the engine reads from and writes to.
pub struct Collaborators {
    pub tax_authority: Box<dyn RecordSource>,
    pub immigration_support: Box<dyn RecordSource>,
    pub benefits: Box<dyn BenefitsClient>,
    pub queue: Box<dyn QueuePublisher>,
    pub audit: Box<dyn AuditSink>,
}

impl Collaborators {
    /// Collaborators backed by the local database, with the benefits client taken
    /// from `config`.
    #[must_use]
    pub fn sqlite(db_path: &Path, config: &EngineConfig) -> Self {
        let benefits: Box<dyn BenefitsClient> = match &config.benefits {
            Some(benefits) => Box::new(HttpBenefitsClient::new(benefits)),
            None => Box::new(UnavailableBenefitsClient),
        };
        Self {
            tax_authority: Box::new(SqliteRecordSource::new(
                db_path.to_path_buf(),
                ReferenceDataset::TaxAuthority,
            )),
            immigration_support: Box::new(SqliteRecordSource::new(
                db_path.to_path_buf(),
                ReferenceDataset::ImmigrationSupport,
            )),
            benefits,
            queue: Box::new(SqliteQueue::new(db_path.to_path_buf())),
            audit: Box::new(SqliteAuditSink::new(db_path.to_path_buf())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub check_id: CheckId,
    pub status: CheckStatus,
    pub links: CheckLinks,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReceipt {
    pub group_id: String,
    pub checks: Vec<SubmitReceipt>,
}

/// Lifecycle owner for eligibility checks.
pub struct EligibilityEngine {
    db_path: PathBuf,
    config: EngineConfig,
    cache: OutcomeCache,
    collaborators: Collaborators,
}

impl EligibilityEngine {
    /// # Errors
    /// Returns [`CheckError::Validation`] when `config` is invalid.
    pub fn new(
        db_path: PathBuf,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = OutcomeCache::new(config.freshness_window());
        Ok(Self { db_path, config, cache, collaborators })
    }

    /// # Errors
    /// Returns [`CheckError::Validation`] when `config` is invalid.
    pub fn with_sqlite_collaborators(
        db_path: PathBuf,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let collaborators = Collaborators::sqlite(&db_path, &config);
        Self::new(db_path, config, collaborators)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore, EngineError> {
        let mut store = SqliteStore::open(&self.db_path).map_err(EngineError::Storage)?;
        store.migrate().map_err(EngineError::Storage)?;
        Ok(store)
    }

    /// Inspect schema status without applying migrations.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, EngineError> {
        let store = SqliteStore::open(&self.db_path).map_err(EngineError::Storage)?;
        store.schema_status().map_err(EngineError::Storage)
    }

    /// # Errors
    /// Returns an error when a migration step fails.
    pub fn migrate(&self) -> Result<SchemaStatus, EngineError> {
        self.open_store()?.schema_status().map_err(EngineError::Storage)
    }

    /// Submit one identity. A fresh prior outcome resolves the check immediately;
    /// otherwise the check is queued and a work message published.
    ///
    /// # Errors
    /// Returns [`CheckError::Validation`] for malformed identities, and storage or
    /// queue errors when persistence or publishing fails.
    pub fn submit(
        &self,
        identity: &RawIdentity,
        audit: &AuditContext,
    ) -> Result<SubmitReceipt, EngineError> {
        let canonical = canonicalize(identity)?;
        let mut store = self.open_store()?;
        self.submit_canonical(&mut store, canonical, None, 0, audit)
    }

    /// Submit a batch sharing one group id. Members get sequence numbers `1..=n`
    /// in submission order. Every identity is validated before anything is written.
    ///
    /// # Errors
    /// Returns [`CheckError::Validation`] for an empty batch or any malformed identity,
    /// and storage or queue errors when persistence or publishing fails.
    pub fn submit_batch(
        &self,
        identities: &[RawIdentity],
        group_id: Option<String>,
        audit: &AuditContext,
    ) -> Result<BatchReceipt, EngineError> {
        if identities.is_empty() {
            return Err(CheckError::Validation(
                "batch MUST contain at least one identity".to_string(),
            )
            .into());
        }
        let canonical = identities
            .iter()
            .enumerate()
            .map(|(index, identity)| {
                canonicalize(identity).map_err(|err| {
                    CheckError::Validation(format!("batch item {}: {err}", index + 1))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let group_id = group_id
            .map(|group| group.trim().to_string())
            .filter(|group| !group.is_empty())
            .unwrap_or_else(|| ulid::Ulid::new().to_string());

        let mut store = self.open_store()?;
        let mut checks = Vec::with_capacity(canonical.len());
        for (sequence, identity) in (1_u32..).zip(canonical) {
            checks.push(self.submit_canonical(
                &mut store,
                identity,
                Some(&group_id),
                sequence,
                audit,
            )?);
        }
        info!(group_id = %group_id, checks = checks.len(), "batch submitted");
        Ok(BatchReceipt { group_id, checks })
    }

    fn submit_canonical(
        &self,
        store: &mut SqliteStore,
        identity: CanonicalIdentity,
        group_id: Option<&str>,
        sequence: u32,
        audit: &AuditContext,
    ) -> Result<SubmitReceipt, EngineError> {
        let payload = CheckPayload::FreeSchoolMeals(identity);
        let now = OffsetDateTime::now_utc();
        let cached =
            self.cache.lookup(store, &payload, now).map_err(EngineError::Storage)?;

        let check = EligibilityCheck {
            check_id: CheckId::new(),
            status: cached.as_ref().map_or(CheckStatus::QueuedForProcessing, |hit| hit.outcome),
            payload,
            group_id: group_id.map(ToString::to_string),
            sequence,
            hash_id: cached.as_ref().map(|hit| hit.hash_id),
            created_at: now,
            updated_at: now,
        };
        store.insert_check(&check).map_err(EngineError::Storage)?;
        let links = self.config.links.check_links(check.check_id, group_id);

        if let Some(hit) = cached {
            info!(
                check_id = %check.check_id,
                status = check.status.as_str(),
                hash = hit.hash.short(),
                "check resolved from recent outcome"
            );
            record_best_effort(
                self.collaborators.audit.as_ref(),
                &audit.entry(
                    check.check_type(),
                    check.check_id,
                    AuditAction::ResolvedFromCache,
                    serde_json::json!({
                        "status": check.status,
                        "source": hit.source,
                        "hash_id": hit.hash_id,
                    }),
                ),
            );
        } else {
            let message = QueueMessage {
                check_type: check.check_type(),
                check_id: check.check_id,
                links: links.clone(),
            };
            let destination = destination_for(group_id);
            self.collaborators
                .queue
                .publish(destination, &message)
                .map_err(EngineError::Queue)?;
            info!(
                check_id = %check.check_id,
                group_id = group_id.unwrap_or_default(),
                destination = destination.as_str(),
                "check queued for processing"
            );
            record_best_effort(
                self.collaborators.audit.as_ref(),
                &audit.entry(
                    check.check_type(),
                    check.check_id,
                    AuditAction::Submitted,
                    serde_json::json!({
                        "status": check.status,
                        "group_id": check.group_id,
                        "sequence": check.sequence,
                    }),
                ),
            );
        }

        Ok(SubmitReceipt { check_id: check.check_id, status: check.status, links })
    }

    /// Advance a queued check by consulting its sources in precedence order.
    ///
    /// A source outage returns [`CheckStatus::SourceError`] and leaves the check
    /// queued so it can be resolved again later.
    ///
    /// # Errors
    /// Returns [`CheckError::NotFound`] for unknown checks,
    /// [`CheckError::InvalidState`] when the check is no longer queued (nothing is
    /// written), [`CheckError::DuplicateMatch`] for ambiguous citizen matches, and
    /// storage errors.
    pub fn resolve(
        &self,
        check_id: CheckId,
        audit: &AuditContext,
    ) -> Result<CheckStatus, EngineError> {
        let mut store = self.open_store()?;
        let check = store
            .get_check(check_id)
            .map_err(EngineError::Storage)?
            .ok_or_else(|| CheckError::NotFound(format!("check {check_id}")))?;
        if check.status != CheckStatus::QueuedForProcessing {
            return Err(CheckError::InvalidState { check_id, status: check.status }.into());
        }

        let (status, source) = match self.determine(check.payload.identity()) {
            Ok(determined) => determined,
            Err(CheckError::SourceUnavailable(reason)) => {
                warn!(%check_id, reason = %reason, "source unavailable; check left queued");
                record_best_effort(
                    self.collaborators.audit.as_ref(),
                    &audit.entry(
                        check.check_type(),
                        check_id,
                        AuditAction::SourceError,
                        serde_json::json!({ "reason": reason }),
                    ),
                );
                return Ok(CheckStatus::SourceError);
            }
            Err(err) => {
                warn!(%check_id, error = %err, "check resolution failed");
                return Err(err.into());
            }
        };

        let now = OffsetDateTime::now_utc();
        let outcome = OutcomeCache::prepare(&check.payload, status, source, now)?;
        match store.resolve_check(check_id, &outcome, now).map_err(EngineError::Storage)? {
            ResolveWrite::Applied => {}
            ResolveWrite::NotQueued(current) => {
                return Err(CheckError::InvalidState { check_id, status: current }.into());
            }
            ResolveWrite::Missing => {
                return Err(CheckError::NotFound(format!("check {check_id}")).into());
            }
        }

        info!(
            %check_id,
            status = status.as_str(),
            source = source.as_str(),
            hash = outcome.hash.short(),
            "check resolved"
        );
        record_best_effort(
            self.collaborators.audit.as_ref(),
            &audit.entry(
                check.check_type(),
                check_id,
                AuditAction::Resolved,
                serde_json::json!({
                    "status": status,
                    "source": source,
                    "hash_id": outcome.hash_id,
                }),
            ),
        );
        Ok(status)
    }

    fn determine(
        &self,
        identity: &CanonicalIdentity,
    ) -> Result<(CheckStatus, OutcomeSource), CheckError> {
        match identity.identifier {
            Identifier::NationalInsurance(_) => {
                let tax = self.collaborators.tax_authority.as_ref();
                if match_records(tax, identity)? {
                    return Ok((CheckStatus::Eligible, tax.source()));
                }
                debug!("tax authority inconclusive; consulting benefits department");
                let (from, to) = self.claims_range();
                let status = match_benefits(
                    self.collaborators.benefits.as_ref(),
                    identity,
                    &self.config.universal_credit_thresholds,
                    from,
                    to,
                )?;
                Ok((status, OutcomeSource::BenefitsDepartment))
            }
            Identifier::AsylumSupport(_) => {
                let immigration = self.collaborators.immigration_support.as_ref();
                let status = if match_records(immigration, identity)? {
                    CheckStatus::Eligible
                } else {
                    CheckStatus::ParentNotFound
                };
                Ok((status, immigration.source()))
            }
        }
    }

    fn claims_range(&self) -> (Date, Date) {
        let to = OffsetDateTime::now_utc().date();
        let from = to.checked_sub(self.config.claims_lookback()).unwrap_or(Date::MIN);
        (from, to)
    }

    /// # Errors
    /// Returns [`CheckError::NotFound`] for unknown checks and storage errors.
    pub fn status(&self, check_id: CheckId) -> Result<CheckStatus, EngineError> {
        Ok(self.get_check(check_id)?.status)
    }

    /// # Errors
    /// Returns [`CheckError::NotFound`] for unknown checks and storage errors.
    pub fn get_check(&self, check_id: CheckId) -> Result<EligibilityCheck, EngineError> {
        let store = self.open_store()?;
        store
            .get_check(check_id)
            .map_err(EngineError::Storage)?
            .ok_or_else(|| CheckError::NotFound(format!("check {check_id}")).into())
    }

    /// # Errors
    /// Returns [`CheckError::NotFound`] when the group has no checks, and storage errors.
    pub fn bulk_status(&self, group_id: &str) -> Result<BulkBatchStatus, EngineError> {
        let store = self.open_store()?;
        let status = store.group_status(group_id).map_err(EngineError::Storage)?;
        if status.total == 0 {
            return Err(CheckError::NotFound(format!("group {group_id}")).into());
        }
        Ok(status)
    }

    /// Results for every check of a group, in submission order.
    ///
    /// # Errors
    /// Returns [`CheckError::NotFound`] when the group has no checks, and storage errors.
    pub fn bulk_results(&self, group_id: &str) -> Result<Vec<BulkCheckResult>, EngineError> {
        let store = self.open_store()?;
        let checks = store.list_group_checks(group_id).map_err(EngineError::Storage)?;
        if checks.is_empty() {
            return Err(CheckError::NotFound(format!("group {group_id}")).into());
        }
        Ok(checks.iter().map(BulkCheckResult::from).collect())
    }

    /// Administrative correction of a check's status. Bypasses the lifecycle and
    /// never records an outcome for reuse.
    ///
    /// # Errors
    /// Returns [`CheckError::Validation`] unless `status` is a determined outcome
    /// (`source_error` is never stored), [`CheckError::NotFound`] for unknown
    /// checks, and storage errors.
    pub fn override_status(
        &self,
        check_id: CheckId,
        status: CheckStatus,
        audit: &AuditContext,
    ) -> Result<EligibilityCheck, EngineError> {
        if !status.is_determined() {
            return Err(CheckError::Validation(format!(
                "override status MUST be eligible, not_eligible or parent_not_found, got {status}"
            ))
            .into());
        }
        let mut store = self.open_store()?;
        let previous = store
            .get_check(check_id)
            .map_err(EngineError::Storage)?
            .ok_or_else(|| CheckError::NotFound(format!("check {check_id}")))?;
        let now = OffsetDateTime::now_utc();
        if !store.override_status(check_id, status, now).map_err(EngineError::Storage)? {
            return Err(CheckError::NotFound(format!("check {check_id}")).into());
        }

        info!(
            %check_id,
            from = previous.status.as_str(),
            to = status.as_str(),
            "status overridden"
        );
        record_best_effort(
            self.collaborators.audit.as_ref(),
            &audit.entry(
                previous.check_type(),
                check_id,
                AuditAction::StatusOverridden,
                serde_json::json!({ "from": previous.status, "to": status }),
            ),
        );

        store
            .get_check(check_id)
            .map_err(EngineError::Storage)?
            .ok_or_else(|| CheckError::NotFound(format!("check {check_id}")).into())
    }

    /// # Errors
    /// Returns storage errors.
    pub fn audit_trail(&self, check_id: CheckId) -> Result<Vec<AuditEntry>, EngineError> {
        self.open_store()?.list_audit_entries(check_id).map_err(EngineError::Storage)
    }

    /// # Errors
    /// Returns storage errors; the records are written atomically.
    pub fn load_reference_records(
        &self,
        dataset: ReferenceDataset,
        records: &[ReferenceRecord],
    ) -> Result<usize, EngineError> {
        let mut store = self.open_store()?;
        let loaded =
            store.insert_reference_records(dataset, records).map_err(EngineError::Storage)?;
        info!(dataset = ?dataset, loaded, "reference records loaded");
        Ok(loaded)
    }
}
