use std::path::Path;

use anyhow::{Context, Result};
use fsm_eligibility_core::{CheckError, CheckId, UniversalCreditThresholds};
use serde::{Deserialize, Serialize};

use crate::queue::CheckLinks;

pub const DEFAULT_FRESHNESS_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_CLAIMS_LOOKBACK_DAYS: u32 = 90;
pub const DEFAULT_BENEFITS_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub freshness_window_days: u32,
    pub universal_credit_thresholds: UniversalCreditThresholds,
    pub claims_lookback_days: u32,
    pub links: LinkTemplates,
    pub benefits: Option<BenefitsClientConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            freshness_window_days: DEFAULT_FRESHNESS_WINDOW_DAYS,
            universal_credit_thresholds: UniversalCreditThresholds::default(),
            claims_lookback_days: DEFAULT_CLAIMS_LOOKBACK_DAYS,
            links: LinkTemplates::default(),
            benefits: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional YAML file, falling back to defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`CheckError::Validation`] for out-of-range settings.
    pub fn validate(&self) -> Result<(), CheckError> {
        if self.freshness_window_days == 0 {
            return Err(CheckError::Validation(
                "freshness_window_days MUST be at least 1".to_string(),
            ));
        }
        if self.claims_lookback_days == 0 {
            return Err(CheckError::Validation(
                "claims_lookback_days MUST be at least 1".to_string(),
            ));
        }
        self.universal_credit_thresholds.validate()?;
        if let Some(benefits) = &self.benefits {
            if benefits.base_url.trim().is_empty() {
                return Err(CheckError::Validation("benefits.base_url MUST be set".to_string()));
            }
            if benefits.timeout_secs == 0 {
                return Err(CheckError::Validation(
                    "benefits.timeout_secs MUST be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn freshness_window(&self) -> time::Duration {
        time::Duration::days(i64::from(self.freshness_window_days))
    }

    #[must_use]
    pub fn claims_lookback(&self) -> time::Duration {
        time::Duration::days(i64::from(self.claims_lookback_days))
    }
}

/// Path prefixes used to build the endpoints carried in queue messages and receipts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LinkTemplates {
    pub check_base: String,
    pub process_base: String,
    pub bulk_base: String,
}

impl Default for LinkTemplates {
    fn default() -> Self {
        Self {
            check_base: "/check/".to_string(),
            process_base: "/engine/process/".to_string(),
            bulk_base: "/bulk-check/".to_string(),
        }
    }
}

impl LinkTemplates {
    #[must_use]
    pub fn check_links(&self, check_id: CheckId, group_id: Option<&str>) -> CheckLinks {
        CheckLinks {
            get_check: format!("{}{check_id}", self.check_base),
            process: format!("{}{check_id}", self.process_base),
            bulk_progress: group_id.map(|group| format!("{}{group}/progress", self.bulk_base)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BenefitsClientConfig {
    pub base_url: String,
    #[serde(default = "default_benefits_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_benefits_timeout_secs() -> u64 {
    DEFAULT_BENEFITS_TIMEOUT_SECS
}
