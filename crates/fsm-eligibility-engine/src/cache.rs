//! Reuse of recent outcomes for the same canonical identity.

use anyhow::Result;
use fsm_eligibility_core::{
    content_hash, CheckError, CheckOutcomeHash, CheckPayload, CheckStatus, ContentHash,
    OutcomeHashId, OutcomeSource,
};
use fsm_eligibility_store_sqlite::SqliteStore;
use time::{Duration, OffsetDateTime};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeCache {
    freshness_window: Duration,
}

impl OutcomeCache {
    #[must_use]
    pub fn new(freshness_window: Duration) -> Self {
        Self { freshness_window }
    }

    #[must_use]
    pub fn hash(payload: &CheckPayload) -> ContentHash {
        content_hash(payload)
    }

    /// Most recent outcome for `payload` recorded no earlier than `now - window`.
    ///
    /// # Errors
    /// Returns an error when the store lookup fails.
    pub fn lookup(
        &self,
        store: &SqliteStore,
        payload: &CheckPayload,
        now: OffsetDateTime,
    ) -> Result<Option<CheckOutcomeHash>> {
        let hash = Self::hash(payload);
        let found =
            store.find_fresh_outcome(&hash, payload.check_type(), now - self.freshness_window)?;
        match &found {
            Some(outcome) => debug!(
                hash = hash.short(),
                outcome = outcome.outcome.as_str(),
                recorded_at = %outcome.recorded_at,
                "outcome cache hit"
            ),
            None => debug!(hash = hash.short(), "outcome cache miss"),
        }
        Ok(found)
    }

    /// Build the outcome row for a resolution without persisting it. The caller
    /// writes it together with the status update.
    ///
    /// # Errors
    /// Returns [`CheckError::Validation`] when `outcome` is not a determined status.
    pub fn prepare(
        payload: &CheckPayload,
        outcome: CheckStatus,
        source: OutcomeSource,
        now: OffsetDateTime,
    ) -> Result<CheckOutcomeHash, CheckError> {
        CheckOutcomeHash::new(payload, outcome, source, now)
    }

    /// Insert a standalone outcome row. Every call adds a row, so the freshness
    /// window is anchored to the newest resolution.
    ///
    /// # Errors
    /// Returns an error for undetermined outcomes or when the insert fails.
    pub fn record(
        store: &mut SqliteStore,
        payload: &CheckPayload,
        outcome: CheckStatus,
        source: OutcomeSource,
        now: OffsetDateTime,
    ) -> Result<OutcomeHashId> {
        let row = Self::prepare(payload, outcome, source, now)?;
        store.insert_outcome_hash(&row)?;
        Ok(row.hash_id)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use fsm_eligibility_core::{canonicalize, RawIdentity};
    use time::{Date, Month};

    use super::*;

    fn payload(surname: &str) -> Result<CheckPayload> {
        let identity = canonicalize(&RawIdentity {
            surname: surname.to_string(),
            date_of_birth: Date::from_calendar_date(1979, Month::March, 3)?,
            national_insurance_number: Some("nn123456c".to_string()),
            asylum_support_reference: None,
        })?;
        Ok(CheckPayload::FreeSchoolMeals(identity))
    }

    fn store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn lookup_misses_outside_window_and_hits_inside() -> Result<()> {
        let mut store = store()?;
        let cache = OutcomeCache::new(Duration::days(30));
        let now = OffsetDateTime::now_utc();
        let payload = payload("Okafor")?;

        OutcomeCache::record(
            &mut store,
            &payload,
            CheckStatus::NotEligible,
            OutcomeSource::BenefitsDepartment,
            now - Duration::days(31),
        )?;
        assert!(cache.lookup(&store, &payload, now)?.is_none());

        let fresh = OutcomeCache::record(
            &mut store,
            &payload,
            CheckStatus::Eligible,
            OutcomeSource::TaxAuthority,
            now - Duration::days(1),
        )?;
        let hit = cache.lookup(&store, &payload, now)?;
        assert_eq!(hit.map(|row| row.hash_id), Some(fresh));
        Ok(())
    }

    #[test]
    fn lookup_ignores_case_differences_in_the_submitted_identity() -> Result<()> {
        let mut store = store()?;
        let cache = OutcomeCache::new(Duration::days(30));
        let now = OffsetDateTime::now_utc();
        OutcomeCache::record(
            &mut store,
            &payload("okafor")?,
            CheckStatus::ParentNotFound,
            OutcomeSource::BenefitsDepartment,
            now,
        )?;
        let hit = cache.lookup(&store, &payload("OKAFOR")?, now)?;
        assert_eq!(hit.map(|row| row.outcome), Some(CheckStatus::ParentNotFound));
        Ok(())
    }

    #[test]
    fn source_error_is_never_recorded() -> Result<()> {
        let mut store = store()?;
        let result = OutcomeCache::record(
            &mut store,
            &payload("Okafor")?,
            CheckStatus::SourceError,
            OutcomeSource::BenefitsDepartment,
            OffsetDateTime::now_utc(),
        );
        assert!(result.is_err());
        Ok(())
    }
}
