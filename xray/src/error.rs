use thiserror::Error;

/// A specialized `Result` type for constructor-time failures.
pub type Result<T> = std::result::Result<T, XrayError>;

/// Errors surfaced to the application.
///
/// Only constructors return these. Once a recorder or strategy is built, the
/// hot path never propagates errors back to instrumented code: failures are
/// logged and traced work degrades (dropped datagrams, fallback sampling).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum XrayError {
    /// Invalid configuration: bad environment value or unresolvable endpoint.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A sampling rule manifest failed validation.
    #[error("invalid sampling manifest: {0}")]
    Manifest(String),

    /// A control-plane call failed. Pollers log these and keep going; it only
    /// surfaces from constructors that talk to the daemon eagerly.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    /// Other errors that don't fit the categories above.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<String> for XrayError {
    fn from(msg: String) -> Self {
        XrayError::Config(msg)
    }
}

/// Failure talking to the control plane through the daemon proxy.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ControlPlaneError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response status {0}")]
    Status(u16),

    #[error("cannot decode response: {0}")]
    Decode(#[from] serde_json::Error),
}
