//! The error taxonomy of §7. `CatalogError` covers every kind raised by the
//! Catalog Gateway, including rule-creation outcomes; `classify` turns
//! exception-driven retry control flow into a plain match over a
//! `Classification` — callers never match on the concrete error kind.

/// Errors surfaced by the Catalog Gateway (§4.1) and by rule creation (§4.6).
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("DID {scope}:{name} not found")]
    DataIdentifierNotFound { scope: String, name: String },

    #[error("transient database failure: {0}")]
    DatabaseException(String),

    #[error("invalid replication rule: {0}")]
    InvalidReplicationRule(String),

    #[error("invalid rule weight: {0}")]
    InvalidRuleWeight(String),

    #[error("invalid RSE expression: {0}")]
    InvalidRseExpression(String),

    #[error("staging area rule requires a lifetime")]
    StagingAreaRuleRequiresLifetime,

    #[error("rule already exists for this (DID, subscription, RSE)")]
    DuplicateRule,

    #[error("replication rule creation temporarily failed: {0}")]
    ReplicationRuleCreationTemporaryFailed(String),

    #[error("insufficient target RSEs: need {needed}, have {available}")]
    InsufficientTargetRSEs { needed: u32, available: u32 },

    #[error("insufficient account limit for account {account}")]
    InsufficientAccountLimit { account: String },

    #[error("RSE {rse} is blacklisted")]
    RSEBlacklisted { rse: String },

    #[error("activity {0:?} failed schema validation")]
    InputValidationError(Option<String>),

    /// A generic catalog/storage fault that doesn't fit a more specific
    /// variant; the catch-all row.
    #[error("gateway error: {0}")]
    GatewayException(String),

    #[error("unclassified error: {0}")]
    Unknown(String),
}

/// Errors surfaced by the Storage Protocol Driver (§4.4, §6).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("destination not accessible: {0}")]
    DestinationNotAccessible(String),

    #[error("storage service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("RSE file name not supported: {0}")]
    RSEFileNameNotSupported(String),

    #[error("driver error: {0}")]
    GatewayException(String),
}

/// How a worker's retry loop should react to a `CatalogError` (§7, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Try again, up to the caller's attempt budget.
    Retryable,
    /// Stop retrying; treat the attempt as having succeeded (e.g. the rule
    /// already exists, or the request was never going to succeed no matter
    /// how many times it's retried).
    TerminalSuccess,
    /// Stop retrying; the attempt failed definitively.
    TerminalFailure,
    /// Not part of the known taxonomy; log and move on without consuming an
    /// attempt slot.
    Unknown,
}

pub fn classify(error: &CatalogError) -> Classification {
    use CatalogError::*;
    match error {
        ReplicationRuleCreationTemporaryFailed(_)
        | InsufficientTargetRSEs { .. }
        | InsufficientAccountLimit { .. }
        | RSEBlacklisted { .. }
        | DatabaseException(_) => Classification::Retryable,

        InvalidReplicationRule(_)
        | InvalidRuleWeight(_)
        | InvalidRseExpression(_)
        | StagingAreaRuleRequiresLifetime
        | DuplicateRule => Classification::TerminalSuccess,

        DataIdentifierNotFound { .. } | InputValidationError(_) | GatewayException(_) => {
            Classification::TerminalFailure
        }

        Unknown(_) => Classification::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_classify_as_retryable() {
        assert_eq!(
            classify(&CatalogError::ReplicationRuleCreationTemporaryFailed(
                "try again".into()
            )),
            Classification::Retryable
        );
        assert_eq!(
            classify(&CatalogError::InsufficientTargetRSEs {
                needed: 2,
                available: 1
            }),
            Classification::Retryable
        );
    }

    #[test]
    fn non_retryable_rule_errors_are_terminal_success() {
        assert_eq!(classify(&CatalogError::DuplicateRule), Classification::TerminalSuccess);
        assert_eq!(
            classify(&CatalogError::InvalidRseExpression("bad".into())),
            Classification::TerminalSuccess
        );
    }

    #[test]
    fn unknown_does_not_consume_attempt_budget_semantics() {
        assert_eq!(
            classify(&CatalogError::Unknown("boom".into())),
            Classification::Unknown
        );
    }
}
