//! Environment and endpoint configuration.
//!
//! The daemon listens on one UDP port for trace datagrams and proxies
//! control-plane HTTP on a TCP port. Both default to `127.0.0.1:2000` and may
//! be set together or independently through `AWS_XRAY_DAEMON_ADDRESS`.

use std::env;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::XrayError;

/// `host:port`, `:port`, or `tcp:host:port udp:host:port` for split channels.
pub const ENV_DAEMON_ADDRESS: &str = "AWS_XRAY_DAEMON_ADDRESS";
/// `RUNTIME_ERROR` | `LOG_ERROR` | `IGNORE_ERROR`.
pub const ENV_CONTEXT_MISSING: &str = "AWS_XRAY_CONTEXT_MISSING";
/// Default segment name for HTTP server middleware.
pub const ENV_TRACING_NAME: &str = "AWS_XRAY_TRACING_NAME";
/// `true`/`false`, default true.
pub const ENV_SDK_ENABLED: &str = "AWS_XRAY_SDK_ENABLED";

const DEFAULT_ADDRESS: &str = "127.0.0.1:2000";
const DEFAULT_HOST: &str = "127.0.0.1";

/// Resolved daemon addresses for the two channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DaemonEndpoints {
    /// Control-plane HTTP proxy.
    pub tcp: SocketAddr,
    /// Segment datagrams.
    pub udp: SocketAddr,
}

impl DaemonEndpoints {
    /// Resolution order: explicit configuration, then the environment
    /// variable, then `127.0.0.1:2000` for both channels.
    pub fn resolve(explicit: Option<&str>) -> Result<DaemonEndpoints, XrayError> {
        let source = explicit
            .map(str::to_string)
            .or_else(|| env::var(ENV_DAEMON_ADDRESS).ok())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        Self::parse(&source)
    }

    /// Parses a daemon address. Whitespace-separated `tcp:` / `udp:` prefixed
    /// entries bind a single channel; a bare `host:port` binds both.
    pub fn parse(value: &str) -> Result<DaemonEndpoints, XrayError> {
        let mut tcp = None;
        let mut udp = None;
        for entry in value.split_whitespace() {
            if let Some(rest) = entry.strip_prefix("tcp:") {
                tcp = Some(parse_addr(rest)?);
            } else if let Some(rest) = entry.strip_prefix("udp:") {
                udp = Some(parse_addr(rest)?);
            } else {
                let addr = parse_addr(entry)?;
                tcp = Some(addr);
                udp = Some(addr);
            }
        }
        let default = parse_addr(DEFAULT_ADDRESS)?;
        Ok(DaemonEndpoints {
            tcp: tcp.unwrap_or(default),
            udp: udp.unwrap_or(default),
        })
    }
}

impl Default for DaemonEndpoints {
    fn default() -> Self {
        let addr = parse_addr(DEFAULT_ADDRESS).expect("default address is valid");
        DaemonEndpoints { tcp: addr, udp: addr }
    }
}

fn parse_addr(value: &str) -> Result<SocketAddr, XrayError> {
    // ":PORT" keeps the default host
    let full;
    let value = if value.starts_with(':') {
        full = format!("{DEFAULT_HOST}{value}");
        full.as_str()
    } else {
        value
    };
    value
        .to_socket_addrs()
        .map_err(|err| XrayError::Config(format!("cannot resolve daemon address {value:?}: {err}")))?
        .next()
        .ok_or_else(|| XrayError::Config(format!("daemon address {value:?} resolves to nothing")))
}

/// What to do when a subsegment is begun without an open parent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContextMissingStrategy {
    /// Panic. The default, so broken instrumentation is loud in development.
    #[default]
    RuntimeError,
    /// Log at error level and continue with a no-op segment.
    LogError,
    /// Continue silently with a no-op segment.
    IgnoreError,
}

impl ContextMissingStrategy {
    /// Reads `AWS_XRAY_CONTEXT_MISSING`; unrecognized values keep the default.
    pub fn from_env() -> ContextMissingStrategy {
        match env::var(ENV_CONTEXT_MISSING).as_deref() {
            Ok("LOG_ERROR") => ContextMissingStrategy::LogError,
            Ok("IGNORE_ERROR") => ContextMissingStrategy::IgnoreError,
            _ => ContextMissingStrategy::RuntimeError,
        }
    }
}

/// Whether the SDK is enabled at all. Anything but `false` means enabled.
pub(crate) fn sdk_enabled() -> bool {
    !matches!(
        env::var(ENV_SDK_ENABLED).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Ok("false")
    )
}

/// Default segment name for server middleware, if configured.
pub fn tracing_name() -> Option<String> {
    env::var(ENV_TRACING_NAME).ok().filter(|v| !v.is_empty())
}
