//! One-time capture of SDK and runtime identity.

use std::env;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::schema::Service;

static SERVICE: Lazy<Service> = Lazy::new(detect);

/// The service record attached to every emitted root segment. Captured once
/// per process.
pub(crate) fn service_record() -> &'static Service {
    &SERVICE
}

fn detect() -> Service {
    Service {
        sdk: "X-Ray YA-SDK-for-Rust".to_string(),
        sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        runtime: "rust".to_string(),
        runtime_version: env!("XRAY_RUSTC_VERSION").to_string(),
        compiler: Some(env!("XRAY_TOOLCHAIN").to_string()),
        hostname: detect_hostname(),
        startup: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    }
}

fn detect_hostname() -> Option<String> {
    if let Ok(name) = env::var("HOSTNAME") {
        if !name.is_empty() {
            return Some(name);
        }
    }
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
