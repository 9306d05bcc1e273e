//! Benefit entitlement rules applied to claims returned by the benefits department.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::{iso_date, CheckError, CheckStatus};

/// Claim status marking a positive entitlement decision.
pub const DECISION_ENTITLED: &str = "decision_entitled";

/// Award status for an award currently in payment.
pub const AWARD_STATUS_LIVE: &str = "live";

/// Highest assessment-period tier with a configured threshold.
pub const MAX_THRESHOLD_TIER: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BenefitType {
    #[serde(rename = "pensions_credit")]
    PensionCredit,
    #[serde(rename = "jsa_income_based")]
    JobseekersAllowanceIncomeBased,
    IncomeSupport,
    #[serde(rename = "esa_income_based")]
    EmploymentSupportAllowanceIncomeBased,
    UniversalCredit,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenefitAward {
    #[serde(with = "iso_date")]
    pub start_date: Date,
    #[serde(default, with = "iso_date::option")]
    pub end_date: Option<Date>,
    pub status: String,
    pub take_home_pay: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenefitClaim {
    pub benefit_type: BenefitType,
    pub status: String,
    #[serde(default)]
    pub awards: Vec<BenefitAward>,
}

/// Monthly take-home-pay ceilings for one, two, and three live assessment periods.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UniversalCreditThresholds {
    pub one_period: Decimal,
    pub two_periods: Decimal,
    pub three_periods: Decimal,
}

impl Default for UniversalCreditThresholds {
    fn default() -> Self {
        Self {
            one_period: Decimal::new(61_667, 2),
            two_periods: Decimal::new(123_333, 2),
            three_periods: Decimal::new(184_999, 2),
        }
    }
}

impl UniversalCreditThresholds {
    /// # Errors
    /// Returns [`CheckError::Validation`] unless the thresholds are positive and
    /// strictly increasing with the tier.
    pub fn validate(&self) -> Result<(), CheckError> {
        if self.one_period <= Decimal::ZERO {
            return Err(CheckError::Validation(
                "universal credit thresholds MUST be positive".to_string(),
            ));
        }
        if !(self.one_period < self.two_periods && self.two_periods < self.three_periods) {
            return Err(CheckError::Validation(
                "universal credit thresholds MUST increase with the number of periods".to_string(),
            ));
        }
        Ok(())
    }

    /// Threshold for `live_awards` periods. More than three periods use the
    /// three-period threshold; zero periods have none.
    #[must_use]
    pub fn for_periods(&self, live_awards: usize) -> Option<Decimal> {
        match live_awards.min(MAX_THRESHOLD_TIER) {
            0 => None,
            1 => Some(self.one_period),
            2 => Some(self.two_periods),
            _ => Some(self.three_periods),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Entitlement {
    Entitled,
    NotEntitled,
}

impl Entitlement {
    #[must_use]
    pub fn status(self) -> CheckStatus {
        match self {
            Self::Entitled => CheckStatus::Eligible,
            Self::NotEntitled => CheckStatus::NotEligible,
        }
    }
}

impl From<bool> for Entitlement {
    fn from(entitled: bool) -> Self {
        if entitled {
            Self::Entitled
        } else {
            Self::NotEntitled
        }
    }
}

#[must_use]
pub fn evaluate_claim(claim: &BenefitClaim, thresholds: &UniversalCreditThresholds) -> Entitlement {
    match claim.benefit_type {
        BenefitType::PensionCredit
        | BenefitType::JobseekersAllowanceIncomeBased
        | BenefitType::IncomeSupport
        | BenefitType::EmploymentSupportAllowanceIncomeBased => {
            Entitlement::from(claim.status == DECISION_ENTITLED)
        }
        BenefitType::UniversalCredit => evaluate_universal_credit(claim, thresholds),
        BenefitType::Unsupported => Entitlement::NotEntitled,
    }
}

fn evaluate_universal_credit(
    claim: &BenefitClaim,
    thresholds: &UniversalCreditThresholds,
) -> Entitlement {
    let live: Vec<&BenefitAward> =
        claim.awards.iter().filter(|award| award.status == AWARD_STATUS_LIVE).collect();
    let Some(threshold) = thresholds.for_periods(live.len()) else {
        return Entitlement::NotEntitled;
    };
    // Overflowing totals fail closed.
    let Some(take_home_pay) = live
        .iter()
        .try_fold(Decimal::ZERO, |total, award| total.checked_add(award.take_home_pay))
    else {
        return Entitlement::NotEntitled;
    };
    Entitlement::from(take_home_pay < threshold)
}

/// Entitled when any claim qualifies; no claims is not entitled.
#[must_use]
pub fn evaluate_claims(
    claims: &[BenefitClaim],
    thresholds: &UniversalCreditThresholds,
) -> Entitlement {
    Entitlement::from(
        claims.iter().any(|claim| evaluate_claim(claim, thresholds) == Entitlement::Entitled),
    )
}
