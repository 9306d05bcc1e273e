//! Data sources consulted while resolving a check, and the matching rule for each.

use std::path::PathBuf;

use fsm_eligibility_core::{
    any_surname_matches, evaluate_claims, BenefitClaim, CanonicalIdentity, CheckError,
    CheckStatus, OutcomeSource, UniversalCreditThresholds,
};
use fsm_eligibility_store_sqlite::{ReferenceDataset, SqliteStore};
use time::Date;
use tracing::debug;

/// Exact-match lookup by identifier and date of birth, returning candidate surnames.
pub trait RecordSource: Send + Sync {
    fn source(&self) -> OutcomeSource;

    /// # Errors
    /// Returns [`CheckError::SourceUnavailable`] when the dataset cannot be queried.
    fn find_surnames(
        &self,
        identifier: &str,
        date_of_birth: Date,
    ) -> Result<Vec<String>, CheckError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CitizenMatch {
    Found(String),
    NotFound,
    Duplicate,
}

pub trait BenefitsClient: Send + Sync {
    /// # Errors
    /// Returns [`CheckError::SourceUnavailable`] on transport failures or unrecognized responses.
    fn match_citizen(&self, identity: &CanonicalIdentity) -> Result<CitizenMatch, CheckError>;

    /// # Errors
    /// Returns [`CheckError::SourceUnavailable`] on transport failures or unrecognized responses.
    fn fetch_claims(
        &self,
        citizen_reference: &str,
        from: Date,
        to: Date,
    ) -> Result<Vec<BenefitClaim>, CheckError>;
}

/// Reference records loaded into the local `SQLite` database.
#[derive(Debug, Clone)]
pub struct SqliteRecordSource {
    db_path: PathBuf,
    dataset: ReferenceDataset,
}

impl SqliteRecordSource {
    #[must_use]
    pub fn new(db_path: PathBuf, dataset: ReferenceDataset) -> Self {
        Self { db_path, dataset }
    }

    fn lookup(&self, identifier: &str, date_of_birth: Date) -> anyhow::Result<Vec<String>> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        store.reference_surnames(self.dataset, identifier, date_of_birth)
    }
}

impl RecordSource for SqliteRecordSource {
    fn source(&self) -> OutcomeSource {
        match self.dataset {
            ReferenceDataset::TaxAuthority => OutcomeSource::TaxAuthority,
            ReferenceDataset::ImmigrationSupport => OutcomeSource::ImmigrationSupport,
        }
    }

    fn find_surnames(
        &self,
        identifier: &str,
        date_of_birth: Date,
    ) -> Result<Vec<String>, CheckError> {
        self.lookup(identifier, date_of_birth).map_err(|err| {
            CheckError::SourceUnavailable(format!("{}: {err:#}", self.source().as_str()))
        })
    }
}

/// Benefits client used when no benefits-department endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableBenefitsClient;

const NOT_CONFIGURED: &str = "benefits department client is not configured";

impl BenefitsClient for UnavailableBenefitsClient {
    fn match_citizen(&self, _identity: &CanonicalIdentity) -> Result<CitizenMatch, CheckError> {
        Err(CheckError::SourceUnavailable(NOT_CONFIGURED.to_string()))
    }

    fn fetch_claims(
        &self,
        _citizen_reference: &str,
        _from: Date,
        _to: Date,
    ) -> Result<Vec<BenefitClaim>, CheckError> {
        Err(CheckError::SourceUnavailable(NOT_CONFIGURED.to_string()))
    }
}

/// `true` when any candidate record shares the submitted surname prefix.
///
/// # Errors
/// Propagates source failures.
pub fn match_records(
    source: &dyn RecordSource,
    identity: &CanonicalIdentity,
) -> Result<bool, CheckError> {
    let candidates = source.find_surnames(identity.identifier.value(), identity.date_of_birth)?;
    let matched = any_surname_matches(&identity.surname, &candidates);
    debug!(
        source = source.source().as_str(),
        candidates = candidates.len(),
        matched,
        "reference record lookup"
    );
    Ok(matched)
}

/// Citizen match followed by claims evaluation over `[from, to]`.
///
/// # Errors
/// Returns [`CheckError::DuplicateMatch`] when the citizen match is ambiguous and
/// propagates source failures.
pub fn match_benefits(
    client: &dyn BenefitsClient,
    identity: &CanonicalIdentity,
    thresholds: &UniversalCreditThresholds,
    from: Date,
    to: Date,
) -> Result<CheckStatus, CheckError> {
    let reference = match client.match_citizen(identity)? {
        CitizenMatch::Found(reference) => reference,
        CitizenMatch::NotFound => return Ok(CheckStatus::ParentNotFound),
        CitizenMatch::Duplicate => {
            return Err(CheckError::DuplicateMatch(
                "benefits department returned more than one citizen".to_string(),
            ));
        }
    };
    let claims = client.fetch_claims(&reference, from, to)?;
    let entitlement = evaluate_claims(&claims, thresholds);
    debug!(claims = claims.len(), entitlement = ?entitlement, "benefits claims evaluated");
    Ok(entitlement.status())
}
