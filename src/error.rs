// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Error types for the downsync control plane.
//!
//! Every error carries enough context to be logged on its own. Callers decide
//! what to do with an error by its [`ErrorClass`], not by matching variants.

use std::time::Duration;

use thiserror::Error;

/// How a failure should be handled by the loop that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried on the next scheduled cycle; never escalated synchronously.
    Transient,
    /// The offending rule or catalogue entry is skipped and logged.
    Configuration,
    /// Fatal for a single object's projection only.
    Structural,
    /// Aborts the current cycle; existing state is left untouched.
    Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("discovery failed: {0}")]
    Discovery(#[source] kube::Error),

    #[error("invalid group/version '{0}'")]
    InvalidGroupVersion(String),

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("field ownership metadata missing for {object}")]
    MissingOwnership { object: String },

    #[error("field ownership metadata malformed for {object}: {reason}")]
    MalformedOwnership { object: String, reason: String },

    #[error("watch for {0} has not completed its initial list")]
    NotSynced(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("K8s API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Classify this error against the handling taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidGroupVersion(_) | Error::InvalidSelector(_) => ErrorClass::Configuration,
            Error::MissingOwnership { .. } | Error::MalformedOwnership { .. } => {
                ErrorClass::Structural
            }
            Error::NotSynced(_) | Error::Timeout { .. } | Error::Cancelled => ErrorClass::Transient,
            Error::Kube(e) if is_retryable(e) => ErrorClass::Transient,
            Error::Transport(_) => ErrorClass::Transient,
            Error::Discovery(_) | Error::Kube(_) | Error::Serialization(_) => ErrorClass::Fatal,
        }
    }
}

/// Check if a kube error is transient (worth retrying)
pub fn is_retryable(err: &kube::Error) -> bool {
    match err {
        // Network/connection errors are retryable
        kube::Error::HyperError(_) => true,
        // API errors: retry on 429 (rate limit), 503 (unavailable), 504 (timeout)
        kube::Error::Api(api_err) => matches!(api_err.code, 429 | 503 | 504),
        _ => false,
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors() {
        assert_eq!(
            Error::InvalidSelector("bad".into()).class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            Error::InvalidGroupVersion("a/b/c".into()).class(),
            ErrorClass::Configuration
        );
    }

    #[test]
    fn test_structural_errors() {
        let err = Error::MissingOwnership {
            object: "ns1/cm-a".into(),
        };
        assert_eq!(err.class(), ErrorClass::Structural);
        assert!(err.to_string().contains("ns1/cm-a"));
    }

    #[test]
    fn test_transient_errors() {
        let err = Error::Timeout {
            operation: "resolve",
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(Error::NotSynced("v1/Pod".into()).class(), ErrorClass::Transient);
    }

    #[test]
    fn test_api_error_classification() {
        let unavailable = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "unavailable".into(),
            reason: "ServiceUnavailable".into(),
            code: 503,
        });
        assert_eq!(Error::Kube(unavailable).class(), ErrorClass::Transient);

        let forbidden = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert_eq!(Error::Kube(forbidden).class(), ErrorClass::Fatal);
    }
}
