//! Origin plugins.
//!
//! A plugin identifies the platform the process runs on and contributes an
//! origin string plus a block for the root segment's `aws` map. Plugins are
//! probed once, at registration, with a short deadline; a platform that does
//! not answer contributes nothing.

use std::env;
use std::fs;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use tracing::debug;

/// How long a metadata probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const EC2_TOKEN_URL: &str = "http://169.254.169.254/latest/api/token";
const EC2_IDENTITY_URL: &str = "http://169.254.169.254/latest/dynamic/instance-identity/document";

/// A platform probe. `resolve` runs once at registration and returns the
/// `aws` map entry for this platform, or `None` when the platform is absent.
pub trait Plugin: Send + Sync {
    /// Origin recorded on root segments, e.g. `AWS::EC2::Instance`.
    fn origin(&self) -> &'static str;

    fn resolve(&self, timeout: Duration) -> Option<(String, Value)>;
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PluginData {
    pub(crate) origin: Option<String>,
    pub(crate) aws: Map<String, Value>,
}

static REGISTRY: Lazy<RwLock<Vec<(String, Map<String, Value>)>>> =
    Lazy::new(|| RwLock::new(Vec::new()));

/// Probes a plugin and, when the platform answers, records its contribution.
/// Call during process init, before the first segment begins.
pub fn register(plugin: &dyn Plugin) {
    match plugin.resolve(PROBE_TIMEOUT) {
        Some((key, value)) => {
            let mut aws = Map::new();
            aws.insert(key, value);
            REGISTRY
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push((plugin.origin().to_string(), aws));
        }
        None => debug!(origin = plugin.origin(), "plugin did not resolve"),
    }
}

/// Clears all registered plugins. Intended for tests and re-initialization.
pub fn reset() {
    REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// The first successfully registered origin plus every plugin's `aws`
/// entries, merged in registration order.
pub(crate) fn snapshot() -> PluginData {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    let mut data = PluginData::default();
    for (origin, aws) in registry.iter() {
        if data.origin.is_none() {
            data.origin = Some(origin.clone());
        }
        for (key, value) in aws {
            data.aws.insert(key.clone(), value.clone());
        }
    }
    data
}

/// Reads instance identity from the EC2 metadata service (IMDSv2).
#[derive(Debug, Default)]
pub struct Ec2Plugin;

impl Plugin for Ec2Plugin {
    fn origin(&self) -> &'static str {
        "AWS::EC2::Instance"
    }

    fn resolve(&self, timeout: Duration) -> Option<(String, Value)> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .ok()?;
        let token = client
            .put(EC2_TOKEN_URL)
            .header("X-aws-ec2-metadata-token-ttl-seconds", "60")
            .send()
            .ok()?
            .text()
            .ok()?;
        let identity: Value = client
            .get(EC2_IDENTITY_URL)
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .ok()?
            .json()
            .ok()?;
        Some((
            "ec2".to_string(),
            json!({
                "instance_id": identity.get("instanceId").cloned().unwrap_or(Value::Null),
                "availability_zone": identity.get("availabilityZone").cloned().unwrap_or(Value::Null),
            }),
        ))
    }
}

/// Records the container identity on ECS. The container hostname is the
/// short container id.
#[derive(Debug, Default)]
pub struct EcsPlugin;

impl Plugin for EcsPlugin {
    fn origin(&self) -> &'static str {
        "AWS::ECS::Container"
    }

    fn resolve(&self, _timeout: Duration) -> Option<(String, Value)> {
        // only claim ECS when the agent injected its metadata endpoint
        if env::var("ECS_CONTAINER_METADATA_URI_V4").is_err()
            && env::var("ECS_CONTAINER_METADATA_URI").is_err()
        {
            return None;
        }
        let container = env::var("HOSTNAME")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| {
                fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            })?;
        Some(("ecs".to_string(), json!({ "container": container })))
    }
}

/// Reads the Elastic Beanstalk environment description dropped by the
/// platform into its well-known path.
#[derive(Debug)]
pub struct BeanstalkPlugin {
    conf_path: &'static str,
}

impl Default for BeanstalkPlugin {
    fn default() -> Self {
        BeanstalkPlugin {
            conf_path: "/var/elasticbeanstalk/xray/environment.conf",
        }
    }
}

impl Plugin for BeanstalkPlugin {
    fn origin(&self) -> &'static str {
        "AWS::ElasticBeanstalk::Environment"
    }

    fn resolve(&self, _timeout: Duration) -> Option<(String, Value)> {
        let raw = fs::read_to_string(self.conf_path).ok()?;
        let conf: Value = serde_json::from_str(&raw).ok()?;
        Some(("elastic_beanstalk".to_string(), conf))
    }
}
