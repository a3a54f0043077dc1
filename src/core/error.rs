use thiserror::Error;

/// Classified failures that are surfaced to the user verbatim.
///
/// Kernel-level failures (mount, clone, netlink) stay as plain `anyhow`
/// errors carrying errno context; best-effort teardown failures are logged
/// and never returned.
#[derive(Debug, Error)]
pub enum XdockerError {
    /// Bad flags or malformed arguments. No compensation runs.
    #[error("{0}")]
    Usage(String),

    /// A referenced container, image, or network does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A name or tag is already taken.
    #[error("{0}")]
    ResourceConflict(String),
}

impl XdockerError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ResourceConflict(msg.into())
    }
}
