//! Benefits-department HTTP client.

use std::time::Duration;

use fsm_eligibility_core::{
    iso_date, BenefitAward, BenefitClaim, BenefitType, CanonicalIdentity, CheckError, Identifier,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use time::Date;
use tracing::{debug, error};

use crate::config::BenefitsClientConfig;
use crate::sources::{BenefitsClient, CitizenMatch};

const MATCH_PATH: &str = "/v2/citizens/match";

pub struct HttpBenefitsClient {
    agent: ureq::Agent,
    base_url: String,
    access_token: Option<String>,
}

impl HttpBenefitsClient {
    #[must_use]
    pub fn new(config: &BenefitsClientConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        }
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        let request = request.set("accept", "application/json");
        match self.access_token.as_ref() {
            Some(token) => request.set("authorization", &format!("Bearer {token}")),
            None => request,
        }
    }
}

impl BenefitsClient for HttpBenefitsClient {
    fn match_citizen(&self, identity: &CanonicalIdentity) -> Result<CitizenMatch, CheckError> {
        let Identifier::NationalInsurance(nino) = &identity.identifier else {
            return Err(CheckError::Validation(
                "benefits citizen match requires a national insurance number".to_string(),
            ));
        };
        let body = serde_json::json!({
            "data": {
                "type": "Match",
                "attributes": {
                    "lastName": identity.surname,
                    "dateOfBirth": iso_date::format(identity.date_of_birth),
                    "ninoFragment": nino_fragment(nino),
                }
            }
        });
        let request = self.authorize(self.agent.post(&format!("{}{MATCH_PATH}", self.base_url)));

        match request.send_json(body) {
            Ok(response) => {
                let raw = read_body(response)?;
                decode_citizen_reference(&raw).map(CitizenMatch::Found)
            }
            Err(ureq::Error::Status(404, _)) => Ok(CitizenMatch::NotFound),
            Err(ureq::Error::Status(422, _)) => Ok(CitizenMatch::Duplicate),
            Err(ureq::Error::Status(code, response)) => {
                let raw = response.into_string().unwrap_or_default();
                error!(status = code, body = %raw, "benefits citizen match failed");
                Err(CheckError::SourceUnavailable(format!("citizen match returned http {code}")))
            }
            Err(ureq::Error::Transport(err)) => {
                error!(error = %err, "benefits citizen match transport error");
                Err(CheckError::SourceUnavailable(format!("citizen match transport error: {err}")))
            }
        }
    }

    fn fetch_claims(
        &self,
        citizen_reference: &str,
        from: Date,
        to: Date,
    ) -> Result<Vec<BenefitClaim>, CheckError> {
        let url = format!("{}/v2/citizens/{citizen_reference}/claims", self.base_url);
        let request = self
            .authorize(self.agent.get(&url))
            .query("effectiveFromDate", &iso_date::format(from))
            .query("effectiveToDate", &iso_date::format(to));

        match request.call() {
            Ok(response) => {
                let raw = read_body(response)?;
                let claims = decode_claims(&raw)?;
                debug!(claims = claims.len(), "benefits claims fetched");
                Ok(claims)
            }
            Err(ureq::Error::Status(404, _)) => Ok(Vec::new()),
            Err(ureq::Error::Status(code, response)) => {
                let raw = response.into_string().unwrap_or_default();
                error!(status = code, body = %raw, "benefits claims fetch failed");
                Err(CheckError::SourceUnavailable(format!("claims fetch returned http {code}")))
            }
            Err(ureq::Error::Transport(err)) => {
                error!(error = %err, "benefits claims transport error");
                Err(CheckError::SourceUnavailable(format!("claims fetch transport error: {err}")))
            }
        }
    }
}

fn read_body(response: ureq::Response) -> Result<String, CheckError> {
    response.into_string().map_err(|err| {
        CheckError::SourceUnavailable(format!("failed to read response body: {err}"))
    })
}

fn nino_fragment(nino: &str) -> String {
    let chars = nino.chars().collect::<Vec<_>>();
    let start = chars.len().saturating_sub(5);
    chars.get(start..chars.len().saturating_sub(1)).unwrap_or_default().iter().collect()
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    data: MatchData,
}

#[derive(Debug, Deserialize)]
struct MatchData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ClaimsResponse {
    #[serde(default)]
    data: Vec<ClaimData>,
}

#[derive(Debug, Deserialize)]
struct ClaimData {
    attributes: ClaimAttributes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimAttributes {
    benefit_type: BenefitType,
    status: String,
    #[serde(default)]
    awards: Vec<AwardAttributes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwardAttributes {
    #[serde(with = "iso_date")]
    start_date: Date,
    #[serde(default, with = "iso_date::option")]
    end_date: Option<Date>,
    status: String,
    #[serde(default)]
    assessment_attributes: Option<AssessmentAttributes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssessmentAttributes {
    take_home_pay: Decimal,
}

fn decode_citizen_reference(raw: &str) -> Result<String, CheckError> {
    let response: MatchResponse = serde_json::from_str(raw).map_err(|err| {
        error!(body = %raw, error = %err, "unrecognized citizen match response");
        CheckError::SourceUnavailable(format!("unrecognized citizen match response: {err}"))
    })?;
    if response.data.id.trim().is_empty() {
        return Err(CheckError::SourceUnavailable(
            "citizen match returned an empty id".to_string(),
        ));
    }
    Ok(response.data.id)
}

/// Decode a claims response body into domain claims. Awards without an
/// assessment carry zero take-home pay.
///
/// # Errors
/// Returns [`CheckError::SourceUnavailable`] when the body is not a claims document.
pub fn decode_claims(raw: &str) -> Result<Vec<BenefitClaim>, CheckError> {
    let response: ClaimsResponse = serde_json::from_str(raw).map_err(|err| {
        error!(body = %raw, error = %err, "unrecognized benefits claims response");
        CheckError::SourceUnavailable(format!("unrecognized claims response: {err}"))
    })?;
    Ok(response
        .data
        .into_iter()
        .map(|claim| BenefitClaim {
            benefit_type: claim.attributes.benefit_type,
            status: claim.attributes.status,
            awards: claim
                .attributes
                .awards
                .into_iter()
                .map(|award| BenefitAward {
                    start_date: award.start_date,
                    end_date: award.end_date,
                    status: award.status,
                    take_home_pay: award
                        .assessment_attributes
                        .map_or(Decimal::ZERO, |assessment| assessment.take_home_pay),
                })
                .collect(),
        })
        .collect())
}
