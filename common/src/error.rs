use thiserror::Error;

use crate::types::Dependency;

/// Failure of a single call to the bus daemon or the hub.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("{dependency} unreachable: {reason}")]
    Unreachable {
        dependency: Dependency,
        reason: String,
    },
    #[error("{dependency} sent a malformed payload ({reason}): {payload:?}")]
    Parse {
        dependency: Dependency,
        payload: String,
        reason: String,
    },
    #[error("{dependency} rejected the command: {reason}")]
    Rejected {
        dependency: Dependency,
        reason: String,
    },
}

impl ClientError {
    pub fn unreachable(dependency: Dependency, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            dependency,
            reason: reason.into(),
        }
    }

    pub fn parse(
        dependency: Dependency,
        payload: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Parse {
            dependency,
            payload: payload.into(),
            reason: reason.into(),
        }
    }

    pub fn rejected(dependency: Dependency, reason: impl Into<String>) -> Self {
        Self::Rejected {
            dependency,
            reason: reason.into(),
        }
    }

    pub fn dependency(&self) -> Dependency {
        match self {
            Self::Unreachable { dependency, .. }
            | Self::Parse { dependency, .. }
            | Self::Rejected { dependency, .. } => *dependency,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Invalid startup configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("failed to parse config file {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
