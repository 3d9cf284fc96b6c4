use thiserror::Error;

use crate::tuple::{Precondition, PreconditionKind};

/// Failures reported by the permission graph service.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// Transport failure or timeout. Safe to retry for reads only.
    #[error("permission graph unavailable: {0}")]
    Unavailable(String),

    /// The graph understood the request and refused it (bad schema, bad tuple).
    #[error("permission graph rejected request: {0}")]
    Rejected(String),
}

/// Failures reported by the backend resource store.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with a non-success status (conflict, not found, invalid).
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl BackendError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::Rejected { status: 404, message: format!("{what} not found") }
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        Self::Rejected { status: 409, message: format!("{what} already exists") }
    }
}

/// Top-level error type for request handling in the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    #[error("no rule matches {0}")]
    RuleNotMatched(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("precondition failed: {precondition}")]
    PreconditionFailed { precondition: Precondition },

    #[error("{0}")]
    GraphUnavailable(GraphError),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend rejected request ({status}): {message}")]
    BackendRejected { status: u16, message: String },

    /// Second-phase rollback could not be applied; graph and backend diverge.
    #[error("transaction {txn} left graph and backend inconsistent: {reason}")]
    CompensationFailed { txn: String, reason: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated(_) => 401,
            Self::RuleNotMatched(_) | Self::PermissionDenied(_) => 403,
            Self::PreconditionFailed { precondition } => match precondition.kind {
                PreconditionKind::MustExist => 404,
                PreconditionKind::MustNotExist => 409,
            },
            Self::GraphUnavailable(GraphError::Unavailable(_)) => 503,
            Self::GraphUnavailable(GraphError::Rejected(_)) => 500,
            Self::BackendUnavailable(_) => 502,
            Self::BackendRejected { status, .. } => *status,
            Self::BadRequest(_) => 400,
            Self::CompensationFailed { .. } | Self::Template(_) | Self::Config(_) | Self::Other(_) => 500,
        }
    }

    /// Kubernetes-style `reason` string for status bodies.
    pub fn reason(&self) -> &'static str {
        match self.status_code() {
            400 => "BadRequest",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "NotFound",
            409 => "AlreadyExists",
            502 | 503 => "ServiceUnavailable",
            _ => "InternalError",
        }
    }
}

impl From<GraphError> for ProxyError {
    fn from(err: GraphError) -> Self {
        Self::GraphUnavailable(err)
    }
}

impl From<BackendError> for ProxyError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => Self::BackendUnavailable(msg),
            BackendError::Rejected { status, message } => Self::BackendRejected { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::RelationshipTuple;

    #[test]
    fn status_codes_follow_taxonomy() {
        let t: RelationshipTuple = "pod:a#creator@user:u".parse().unwrap();
        assert_eq!(ProxyError::RuleNotMatched("v1/pods get".into()).status_code(), 403);
        assert_eq!(ProxyError::PermissionDenied("x".into()).status_code(), 403);
        assert_eq!(
            ProxyError::PreconditionFailed { precondition: Precondition::must_not_exist(&t) }.status_code(),
            409
        );
        assert_eq!(
            ProxyError::PreconditionFailed { precondition: Precondition::must_exist(&t) }.status_code(),
            404
        );
        assert_eq!(ProxyError::from(GraphError::Unavailable("timeout".into())).status_code(), 503);
        assert_eq!(ProxyError::from(BackendError::Unavailable("down".into())).status_code(), 502);
        assert_eq!(ProxyError::from(BackendError::already_exists("pod nginx")).status_code(), 409);
    }
}
