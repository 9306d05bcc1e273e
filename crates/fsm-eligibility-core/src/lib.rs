use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

pub mod entitlement;

pub use entitlement::{
    evaluate_claim, evaluate_claims, BenefitAward, BenefitClaim, BenefitType, Entitlement,
    UniversalCreditThresholds,
};

/// Number of leading surname characters compared when matching against
/// tax-authority and immigration-support records.
pub const SURNAME_MATCH_PREFIX_CHARS: usize = 3;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CheckError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("check {check_id} is {status}; only queued_for_processing checks can be resolved")]
    InvalidState { check_id: CheckId, status: CheckStatus },
    #[error("citizen match returned more than one candidate: {0}")]
    DuplicateMatch(String),
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CheckId(pub Ulid);

impl CheckId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a check identifier from its canonical ULID text.
    ///
    /// # Errors
    /// Returns [`CheckError::Validation`] when the text is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, CheckError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| CheckError::Validation(format!("invalid check id {raw}: {err}")))
    }
}

impl Default for CheckId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CheckId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OutcomeHashId(pub Ulid);

impl OutcomeHashId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OutcomeHashId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OutcomeHashId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    FreeSchoolMeals,
}

impl CheckType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FreeSchoolMeals => "free_school_meals",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free_school_meals" => Some(Self::FreeSchoolMeals),
            _ => None,
        }
    }
}

impl Display for CheckType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    QueuedForProcessing,
    Eligible,
    NotEligible,
    ParentNotFound,
    SourceError,
}

impl CheckStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueuedForProcessing => "queued_for_processing",
            Self::Eligible => "eligible",
            Self::NotEligible => "not_eligible",
            Self::ParentNotFound => "parent_not_found",
            Self::SourceError => "source_error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued_for_processing" => Some(Self::QueuedForProcessing),
            "eligible" => Some(Self::Eligible),
            "not_eligible" => Some(Self::NotEligible),
            "parent_not_found" => Some(Self::ParentNotFound),
            "source_error" => Some(Self::SourceError),
            _ => None,
        }
    }

    /// Outcomes that may be cached and reused within the freshness window.
    /// `source_error` is never cached.
    #[must_use]
    pub fn is_determined(self) -> bool {
        matches!(self, Self::Eligible | Self::NotEligible | Self::ParentNotFound)
    }
}

impl Display for CheckStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    TaxAuthority,
    ImmigrationSupport,
    BenefitsDepartment,
}

impl OutcomeSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaxAuthority => "tax_authority",
            Self::ImmigrationSupport => "immigration_support",
            Self::BenefitsDepartment => "benefits_department",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tax_authority" => Some(Self::TaxAuthority),
            "immigration_support" => Some(Self::ImmigrationSupport),
            "benefits_department" => Some(Self::BenefitsDepartment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueDestination {
    Standard,
    Bulk,
}

impl QueueDestination {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Bulk => "bulk",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(Self::Standard),
            "bulk" => Some(Self::Bulk),
            _ => None,
        }
    }
}

/// `YYYY-MM-DD` serde adapter for [`Date`] fields.
pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::macros::format_description;
    use time::Date;

    /// Render a date as `YYYY-MM-DD`.
    #[must_use]
    pub fn format(value: Date) -> String {
        value
            .format(format_description!("[year]-[month]-[day]"))
            .unwrap_or_else(|_| value.to_string())
    }

    /// Parse a zero-padded `YYYY-MM-DD` date. Signed years are rejected.
    ///
    /// # Errors
    /// Returns a message naming the expected format.
    pub fn parse(raw: &str) -> Result<Date, String> {
        let raw = raw.trim();
        if !raw.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(format!("date must be YYYY-MM-DD: {raw}"));
        }
        Date::parse(raw, format_description!("[year]-[month]-[day]"))
            .map_err(|err| format!("date must be YYYY-MM-DD: {raw}: {err}"))
    }

    /// # Errors
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    /// # Errors
    /// Returns a deserializer error for malformed dates.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        /// # Errors
        /// Propagates serializer failures.
        pub fn serialize<S: Serializer>(
            value: &Option<Date>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(date) => serializer.serialize_some(&super::format(*date)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Returns a deserializer error for malformed dates.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Date>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| super::parse(&value).map_err(serde::de::Error::custom)).transpose()
        }
    }
}

/// Identity fields as submitted, before canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawIdentity {
    pub surname: String,
    #[serde(with = "iso_date")]
    pub date_of_birth: Date,
    #[serde(default)]
    pub national_insurance_number: Option<String>,
    #[serde(default)]
    pub asylum_support_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Identifier {
    NationalInsurance(String),
    AsylumSupport(String),
}

impl Identifier {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NationalInsurance(_) => "national_insurance",
            Self::AsylumSupport(_) => "asylum_support",
        }
    }

    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::NationalInsurance(value) | Self::AsylumSupport(value) => value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct CanonicalIdentity {
    pub surname: String,
    #[serde(with = "iso_date")]
    pub date_of_birth: Date,
    pub identifier: Identifier,
}

/// Upper-case a national-insurance number and drop any whitespace inside it.
#[must_use]
pub fn normalize_nino(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase()
}

/// Normalize submitted identity fields into the tuple used for matching and hashing.
///
/// The surname and national-insurance number are upper-cased; a national-insurance
/// number takes precedence over an asylum-support reference when both are present.
///
/// # Errors
/// Returns [`CheckError::Validation`] when the surname is blank or neither identifier
/// carries a value.
pub fn canonicalize(raw: &RawIdentity) -> Result<CanonicalIdentity, CheckError> {
    let surname = raw.surname.trim().to_uppercase();
    if surname.is_empty() {
        return Err(CheckError::Validation("surname MUST be provided".to_string()));
    }

    let national_insurance = raw
        .national_insurance_number
        .as_deref()
        .map(normalize_nino)
        .filter(|value| !value.is_empty());
    let asylum_support = raw
        .asylum_support_reference
        .as_deref()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let identifier = match (national_insurance, asylum_support) {
        (Some(nino), _) => Identifier::NationalInsurance(nino),
        (None, Some(reference)) => Identifier::AsylumSupport(reference),
        (None, None) => {
            return Err(CheckError::Validation(
                "one of national_insurance_number or asylum_support_reference MUST be provided"
                    .to_string(),
            ));
        }
    };

    Ok(CanonicalIdentity { surname, date_of_birth: raw.date_of_birth, identifier })
}

/// Type-tagged identity payload stored with every check.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "check_type", content = "identity", rename_all = "snake_case")]
pub enum CheckPayload {
    FreeSchoolMeals(CanonicalIdentity),
}

impl CheckPayload {
    #[must_use]
    pub fn check_type(&self) -> CheckType {
        match self {
            Self::FreeSchoolMeals(_) => CheckType::FreeSchoolMeals,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &CanonicalIdentity {
        match self {
            Self::FreeSchoolMeals(identity) => identity,
        }
    }
}

/// Hex-encoded SHA-256 digest of a canonical payload.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContentHash(pub String);

impl ContentHash {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix safe to put in log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest over surname, identifier kind and value, date of birth, and check type.
///
/// Inputs are canonical, so casing differences in the submitted fields never
/// change the digest.
#[must_use]
pub fn content_hash(payload: &CheckPayload) -> ContentHash {
    let identity = payload.identity();
    let mut hasher = Sha256::new();
    for part in [
        identity.surname.as_str(),
        identity.identifier.kind(),
        identity.identifier.value(),
        iso_date::format(identity.date_of_birth).as_str(),
        payload.check_type().as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    ContentHash(hex::encode(hasher.finalize()))
}

/// Case-insensitive comparison of the leading surname characters.
///
/// Surnames shorter than the prefix length are compared in full.
#[must_use]
pub fn surname_prefix_matches(submitted: &str, candidate: &str) -> bool {
    let submitted = submitted.trim().to_uppercase();
    let candidate = candidate.trim().to_uppercase();
    if submitted.is_empty() {
        return false;
    }
    let prefix: String = submitted.chars().take(SURNAME_MATCH_PREFIX_CHARS).collect();
    candidate.starts_with(&prefix)
}

#[must_use]
pub fn any_surname_matches(submitted: &str, candidates: &[String]) -> bool {
    candidates.iter().any(|candidate| surname_prefix_matches(submitted, candidate))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EligibilityCheck {
    pub check_id: CheckId,
    pub status: CheckStatus,
    pub payload: CheckPayload,
    pub group_id: Option<String>,
    pub sequence: u32,
    pub hash_id: Option<OutcomeHashId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl EligibilityCheck {
    #[must_use]
    pub fn check_type(&self) -> CheckType {
        self.payload.check_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckOutcomeHash {
    pub hash_id: OutcomeHashId,
    pub hash: ContentHash,
    pub check_type: CheckType,
    pub outcome: CheckStatus,
    pub source: OutcomeSource,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl CheckOutcomeHash {
    /// Build a new outcome row for a determined status.
    ///
    /// # Errors
    /// Returns [`CheckError::Validation`] when `outcome` is not a determined status.
    pub fn new(
        payload: &CheckPayload,
        outcome: CheckStatus,
        source: OutcomeSource,
        recorded_at: OffsetDateTime,
    ) -> Result<Self, CheckError> {
        if !outcome.is_determined() {
            return Err(CheckError::Validation(format!(
                "only determined outcomes can be recorded, got {outcome}"
            )));
        }
        Ok(Self {
            hash_id: OutcomeHashId::new(),
            hash: content_hash(payload),
            check_type: payload.check_type(),
            outcome,
            source,
            recorded_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BulkBatchStatus {
    pub total: u64,
    pub complete: u64,
}

impl BulkBatchStatus {
    #[must_use]
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = CheckStatus>,
    {
        statuses.into_iter().fold(Self::default(), |mut acc, status| {
            acc.total += 1;
            if status != CheckStatus::QueuedForProcessing {
                acc.complete += 1;
            }
            acc
        })
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.total == self.complete
    }
}

/// One member of a batch as presented to result consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkCheckResult {
    pub check_id: CheckId,
    pub sequence: u32,
    pub surname: String,
    #[serde(with = "iso_date")]
    pub date_of_birth: Date,
    pub identifier: Identifier,
    pub status: CheckStatus,
}

impl From<&EligibilityCheck> for BulkCheckResult {
    fn from(check: &EligibilityCheck) -> Self {
        let identity = check.payload.identity();
        Self {
            check_id: check.check_id,
            sequence: check.sequence,
            surname: identity.surname.clone(),
            date_of_birth: identity.date_of_birth,
            identifier: identity.identifier.clone(),
            status: check.status,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Submitted,
    ResolvedFromCache,
    Resolved,
    SourceError,
    StatusOverridden,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::ResolvedFromCache => "resolved_from_cache",
            Self::Resolved => "resolved",
            Self::SourceError => "source_error",
            Self::StatusOverridden => "status_overridden",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "submitted" => Some(Self::Submitted),
            "resolved_from_cache" => Some(Self::ResolvedFromCache),
            "resolved" => Some(Self::Resolved),
            "source_error" => Some(Self::SourceError),
            "status_overridden" => Some(Self::StatusOverridden),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub audit_id: Ulid,
    pub check_type: CheckType,
    pub check_id: CheckId,
    pub action: AuditAction,
    pub actor: String,
    pub detail: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}
