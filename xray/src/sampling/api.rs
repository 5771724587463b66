//! Control-plane documents and the daemon-proxied client.
//!
//! The daemon exposes the service API over plain HTTP; requests go out
//! unsigned with no credentials, and the daemon signs and forwards them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ControlPlaneError, XrayError};

/// Deadline for a single control-plane round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct GetSamplingRulesInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct GetSamplingRulesOutput {
    pub next_token: Option<String>,
    pub sampling_rule_records: Vec<SamplingRuleRecord>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct SamplingRuleRecord {
    pub sampling_rule: SamplingRule,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct SamplingRule {
    pub rule_name: String,
    pub priority: i64,
    pub fixed_rate: f64,
    pub reservoir_size: i64,
    pub host: String,
    #[serde(rename = "HTTPMethod")]
    pub http_method: String,
    #[serde(rename = "URLPath")]
    pub url_path: String,
    pub service_name: String,
    pub service_type: String,
    #[serde(rename = "ResourceARN")]
    pub resource_arn: String,
    #[serde(rename = "RuleARN")]
    pub rule_arn: String,
    pub attributes: HashMap<String, String>,
    pub version: i64,
}

#[derive(Serialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct GetSamplingTargetsInput {
    pub sampling_statistics_documents: Vec<SamplingStatisticsDocument>,
}

/// Per-rule counters for one reporting interval.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SamplingStatisticsDocument {
    #[serde(rename = "ClientID")]
    pub client_id: String,
    pub rule_name: String,
    pub request_count: i64,
    pub sampled_count: i64,
    pub borrow_count: i64,
    /// Epoch seconds.
    pub timestamp: f64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct GetSamplingTargetsOutput {
    /// Epoch seconds of the last rule configuration change.
    pub last_rule_modification: f64,
    pub sampling_target_documents: Vec<SamplingTargetDocument>,
    pub unprocessed_statistics: Vec<UnprocessedStatistics>,
}

/// A refreshed quota allocation for one rule.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct SamplingTargetDocument {
    pub rule_name: String,
    pub fixed_rate: f64,
    pub reservoir_quota: Option<i64>,
    /// Epoch seconds at which the quota expires.
    #[serde(rename = "ReservoirQuotaTTL")]
    pub reservoir_quota_ttl: Option<f64>,
    /// Seconds to wait before reporting statistics again.
    pub interval: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct UnprocessedStatistics {
    pub rule_name: String,
    pub error_code: String,
    pub message: String,
}

/// The two control-plane calls the sampler needs. Trait-shaped so tests can
/// swap in a mock.
pub(crate) trait SamplingApi: Send + Sync {
    fn get_sampling_rules(
        &self,
        input: &GetSamplingRulesInput,
    ) -> Result<GetSamplingRulesOutput, ControlPlaneError>;

    fn get_sampling_targets(
        &self,
        input: &GetSamplingTargetsInput,
    ) -> Result<GetSamplingTargetsOutput, ControlPlaneError>;
}

/// Talks to the control plane through the daemon's HTTP proxy.
pub(crate) struct DaemonApi {
    base: String,
    client: reqwest::blocking::Client,
}

impl DaemonApi {
    pub(crate) fn new(addr: SocketAddr) -> Result<DaemonApi, XrayError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| XrayError::Config(format!("cannot build daemon client: {err}")))?;
        Ok(DaemonApi {
            base: format!("http://{addr}"),
            client,
        })
    }

    fn post<I, O>(&self, operation: &str, input: &I) -> Result<O, ControlPlaneError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}/{}", self.base, operation))
            .json(input)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ControlPlaneError::Status(status.as_u16()));
        }
        Ok(response.json()?)
    }
}

impl SamplingApi for DaemonApi {
    fn get_sampling_rules(
        &self,
        input: &GetSamplingRulesInput,
    ) -> Result<GetSamplingRulesOutput, ControlPlaneError> {
        self.post("GetSamplingRules", input)
    }

    fn get_sampling_targets(
        &self,
        input: &GetSamplingTargetsInput,
    ) -> Result<GetSamplingTargetsOutput, ControlPlaneError> {
        self.post("GetSamplingTargets", input)
    }
}
