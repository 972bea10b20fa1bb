use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Missing required configuration section: [{0}]")]
    MissingSection(String),

    #[error("Invalid value {value:?} for option {key} in section [{section}]")]
    InvalidOption {
        section: String,
        key: String,
        value: String,
    },

    #[error("Configuration parse error on line {line}: {reason}")]
    ConfigParse { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out while {what}")]
    Timeout { what: String },

    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Failed to provision node {node}: {reason}")]
    Provision { node: String, reason: String },

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Manager is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Returns true for transport-level failures that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout { .. } | ClusterError::ConnectionFailed { .. } | ClusterError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ClusterError::Timeout {
            what: "connecting".to_string()
        }
        .is_retryable());
        assert!(ClusterError::ConnectionFailed {
            endpoint: "127.0.0.1:1".to_string(),
            reason: "refused".to_string()
        }
        .is_retryable());
        assert!(!ClusterError::MissingSection("cluster".to_string()).is_retryable());
        assert!(!ClusterError::Rejected("unknown node".to_string()).is_retryable());
    }

    #[test]
    fn missing_section_names_the_section() {
        let err = ClusterError::MissingSection("sink".to_string());
        assert_eq!(
            err.to_string(),
            "Missing required configuration section: [sink]"
        );
    }
}
