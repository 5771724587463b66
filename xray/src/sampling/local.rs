//! Local sampling rules.
//!
//! A manifest is a small JSON document of matching rules, each with a
//! per-second reservoir and a fixed rate for the overflow. The first rule to
//! match wins; the mandatory default rule matches everything.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::XrayError;
use crate::sampling::pattern::wildcard_match;
use crate::sampling::{SamplingDecision, SamplingRequest, SamplingStrategy};

/// A sampling rule document, either the default or a matching rule.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ManifestRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Matched against the request host (version 2 manifests).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Matched against the request host (version 1 manifests).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    /// Guaranteed samples per second before the rate applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_target: Option<u64>,
    pub rate: f64,
}

/// The local rule manifest as loaded from JSON.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Manifest {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ManifestRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ManifestRule>,
}

impl Manifest {
    /// Reads and validates a manifest from a JSON stream.
    pub fn from_reader(reader: impl Read) -> Result<Manifest, XrayError> {
        let manifest: Manifest = serde_json::from_reader(reader)
            .map_err(|err| XrayError::Manifest(format!("cannot parse manifest: {err}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reads and validates a manifest from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Manifest, XrayError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            XrayError::Manifest(format!("cannot open manifest {}: {err}", path.display()))
        })?;
        Manifest::from_reader(file)
    }

    pub fn validate(&self) -> Result<(), XrayError> {
        if self.version != 1 && self.version != 2 {
            return Err(XrayError::Manifest(format!(
                "unsupported version {}",
                self.version
            )));
        }
        let default = self
            .default
            .as_ref()
            .ok_or_else(|| XrayError::Manifest("missing default rule".to_string()))?;
        validate_rate(default.rate)?;
        if default.host.is_some()
            || default.service_name.is_some()
            || default.http_method.is_some()
            || default.url_path.is_some()
        {
            return Err(XrayError::Manifest(
                "the default rule must not have matchers".to_string(),
            ));
        }
        for rule in &self.rules {
            validate_rate(rule.rate)?;
            let host = match self.version {
                1 => rule.service_name.as_deref(),
                _ => rule.host.as_deref(),
            };
            for (field, value) in [
                ("host", host),
                ("http_method", rule.http_method.as_deref()),
                ("url_path", rule.url_path.as_deref()),
            ] {
                match value {
                    Some(v) if !v.is_empty() => {}
                    _ => {
                        return Err(XrayError::Manifest(format!(
                            "rule {:?} is missing {field}",
                            rule.description.as_deref().unwrap_or("")
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// The built-in manifest: one guaranteed trace per second plus five
    /// percent of the overflow.
    pub fn default_manifest() -> Manifest {
        Manifest {
            version: 2,
            default: Some(ManifestRule {
                fixed_target: Some(1),
                rate: 0.05,
                ..ManifestRule::default()
            }),
            rules: Vec::new(),
        }
    }
}

fn validate_rate(rate: f64) -> Result<(), XrayError> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(XrayError::Manifest(format!("rate {rate} is out of [0, 1]")));
    }
    Ok(())
}

/// A per-second token bucket. Tokens refill on wall-second boundaries.
pub(crate) struct Reservoir {
    capacity: u64,
    state: Mutex<ReservoirState>,
}

#[derive(Default)]
struct ReservoirState {
    current_sec: u64,
    used: u64,
}

impl Reservoir {
    pub(crate) fn new(capacity: u64) -> Reservoir {
        Reservoir {
            capacity,
            state: Mutex::new(ReservoirState::default()),
        }
    }

    pub(crate) fn take(&self, now_sec: u64) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.current_sec != now_sec {
            state.current_sec = now_sec;
            state.used = 0;
        }
        if state.used < self.capacity {
            state.used += 1;
            true
        } else {
            false
        }
    }
}

struct LocalRule {
    name: String,
    host: String,
    http_method: String,
    url_path: String,
    reservoir: Reservoir,
    rate: f64,
}

impl LocalRule {
    fn build(doc: &ManifestRule, version: u32, index: usize) -> LocalRule {
        let host = match version {
            1 => doc.service_name.clone(),
            _ => doc.host.clone(),
        };
        LocalRule {
            name: doc
                .description
                .clone()
                .unwrap_or_else(|| format!("rule[{index}]")),
            host: host.unwrap_or_else(|| "*".to_string()),
            http_method: doc.http_method.clone().unwrap_or_else(|| "*".to_string()),
            url_path: doc.url_path.clone().unwrap_or_else(|| "*".to_string()),
            reservoir: Reservoir::new(doc.fixed_target.unwrap_or(0)),
            rate: doc.rate,
        }
    }

    fn matches(&self, request: &SamplingRequest) -> bool {
        wildcard_match(&self.host, &request.host, true)
            && wildcard_match(&self.http_method, &request.method, true)
            && wildcard_match(&self.url_path, &request.url_path, false)
    }

    fn sample(&self, now_sec: u64) -> SamplingDecision {
        if self.reservoir.take(now_sec) {
            return SamplingDecision::new(true, Some(self.name.clone()));
        }
        let sampled = rand::thread_rng().gen::<f64>() < self.rate;
        SamplingDecision::new(sampled, Some(self.name.clone()))
    }
}

/// Samples from in-process rules only.
pub struct LocalStrategy {
    rules: Vec<LocalRule>,
    default_rule: LocalRule,
}

impl LocalStrategy {
    /// Builds a strategy from the given manifest, or the built-in default
    /// manifest when `None`.
    pub fn new(manifest: Option<Manifest>) -> Result<LocalStrategy, XrayError> {
        let manifest = manifest.unwrap_or_else(Manifest::default_manifest);
        manifest.validate()?;
        let default_doc = manifest
            .default
            .as_ref()
            .ok_or_else(|| XrayError::Manifest("missing default rule".to_string()))?;
        let mut default_rule = LocalRule::build(default_doc, manifest.version, 0);
        default_rule.name = "default".to_string();
        Ok(LocalStrategy {
            rules: manifest
                .rules
                .iter()
                .enumerate()
                .map(|(index, doc)| LocalRule::build(doc, manifest.version, index))
                .collect(),
            default_rule,
        })
    }

    fn sample_at(&self, request: &SamplingRequest, now_sec: u64) -> SamplingDecision {
        for rule in &self.rules {
            if rule.matches(request) {
                debug!(rule = %rule.name, "local sampling rule matched");
                return rule.sample(now_sec);
            }
        }
        self.default_rule.sample(now_sec)
    }
}

impl SamplingStrategy for LocalStrategy {
    fn should_trace(&self, request: &SamplingRequest) -> SamplingDecision {
        let now_sec = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.sample_at(request, now_sec)
    }
}

impl fmt::Debug for LocalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStrategy")
            .field("rules", &self.rules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: &str) -> Result<Manifest, XrayError> {
        Manifest::from_reader(json.as_bytes())
    }

    #[test]
    fn default_manifest_is_valid() {
        assert!(Manifest::default_manifest().validate().is_ok());
        assert!(LocalStrategy::new(None).is_ok());
    }

    #[test]
    fn rejects_bad_version() {
        let err = manifest(r#"{"version": 3, "default": {"rate": 0.1}}"#).unwrap_err();
        assert!(matches!(err, XrayError::Manifest(_)), "{err}");
    }

    #[test]
    fn rejects_missing_default() {
        assert!(manifest(r#"{"version": 2, "rules": []}"#).is_err());
    }

    #[test]
    fn rejects_out_of_range_rate() {
        assert!(manifest(r#"{"version": 2, "default": {"rate": 1.5}}"#).is_err());
        assert!(manifest(r#"{"version": 2, "default": {"rate": -0.1}}"#).is_err());
    }

    #[test]
    fn rejects_rule_without_matchers() {
        let err = manifest(
            r#"{"version": 2, "default": {"rate": 0.1},
                "rules": [{"http_method": "GET", "url_path": "/", "rate": 0.5}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("host"), "{err}");
    }

    #[test]
    fn accepts_version_1_service_name() {
        let m = manifest(
            r#"{"version": 1, "default": {"rate": 0.1, "fixed_target": 1},
                "rules": [{"service_name": "example.com", "http_method": "*", "url_path": "*",
                           "fixed_target": 0, "rate": 1.0}]}"#,
        )
        .unwrap();
        let strategy = LocalStrategy::new(Some(m)).unwrap();
        let request = SamplingRequest {
            host: "example.com".to_string(),
            ..SamplingRequest::default()
        };
        assert!(strategy.sample_at(&request, 0).sampled);
    }

    #[test]
    fn first_matching_rule_wins() {
        let m = manifest(
            r#"{"version": 2, "default": {"rate": 0.0, "fixed_target": 0},
                "rules": [
                    {"description": "never", "host": "example.com", "http_method": "*",
                     "url_path": "*", "fixed_target": 0, "rate": 0.0},
                    {"description": "always", "host": "*", "http_method": "*",
                     "url_path": "*", "fixed_target": 0, "rate": 1.0}
                ]}"#,
        )
        .unwrap();
        let strategy = LocalStrategy::new(Some(m)).unwrap();

        let matched = strategy.sample_at(
            &SamplingRequest {
                host: "example.com".to_string(),
                ..SamplingRequest::default()
            },
            0,
        );
        assert!(!matched.sampled);
        assert_eq!(matched.rule.as_deref(), Some("never"));

        let fallthrough = strategy.sample_at(
            &SamplingRequest {
                host: "other.example.org".to_string(),
                ..SamplingRequest::default()
            },
            0,
        );
        assert!(fallthrough.sampled);
        assert_eq!(fallthrough.rule.as_deref(), Some("always"));
    }

    #[test]
    fn default_rule_always_matches() {
        let strategy = LocalStrategy::new(None).unwrap();
        let decision = strategy.sample_at(&SamplingRequest::default(), 42);
        assert_eq!(decision.rule.as_deref(), Some("default"));
        // first take in a fresh second comes from the reservoir
        assert!(decision.sampled);
    }

    #[test]
    fn reservoir_bounds_samples_per_second() {
        let reservoir = Reservoir::new(3);
        let taken = (0..10).filter(|_| reservoir.take(100)).count();
        assert_eq!(taken, 3);
        // next wall second refills
        assert!(reservoir.take(101));
    }

    #[test]
    fn empty_reservoir_never_takes() {
        let reservoir = Reservoir::new(0);
        assert!(!reservoir.take(0));
        assert!(!reservoir.take(1));
    }

    #[test]
    fn rate_zero_and_one_are_deterministic() {
        let m = manifest(
            r#"{"version": 2, "default": {"rate": 0.0, "fixed_target": 0},
                "rules": [{"description": "all", "host": "*", "http_method": "*",
                           "url_path": "*", "fixed_target": 0, "rate": 1.0}]}"#,
        )
        .unwrap();
        let strategy = LocalStrategy::new(Some(m)).unwrap();
        for _ in 0..100 {
            assert!(strategy.sample_at(&SamplingRequest::default(), 0).sampled);
        }

        let never = LocalStrategy::new(Some(manifest(
            r#"{"version": 2, "default": {"rate": 0.0, "fixed_target": 0}}"#,
        ).unwrap()))
        .unwrap();
        for _ in 0..100 {
            assert!(!never.sample_at(&SamplingRequest::default(), 0).sampled);
        }
    }

    #[test]
    fn manifest_loads_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"version": 2, "default": {{"rate": 0.05, "fixed_target": 1}}}}"#
        )
        .unwrap();
        let manifest = Manifest::from_file(file.path()).unwrap();
        assert_eq!(manifest.version, 2);
        assert!(Manifest::from_file("/nonexistent/sampling.json").is_err());
    }
}
