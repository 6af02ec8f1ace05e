//! Error taxonomy (§7). Every host-facing `Engine` method returns
//! `Result<T, EngineError>`. `UserStepThrew` and `UnknownTicket` never reach the
//! host — they are wrapped into an `ERROR_PEND` by `worker`/`ticket` and surface only
//! as `ExecPath::pend_error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("journey definition invalid: {0}")]
    DefinitionInvalid(String),

    #[error("case already exists: {0}")]
    CaseAlreadyExists(String),

    #[error("case not found: {0}")]
    CaseNotFound(String),

    #[error("case already complete: {0}")]
    CaseAlreadyComplete(String),

    #[error("worker pool saturated")]
    ExecutorSaturated,

    #[error("persistence failed: {0}")]
    PersistFailed(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Raised only where the spec allows it to reach a host-facing call directly
    /// (e.g. `change_work_basket` on a case that isn't pended, or pended on more
    /// than one path). Everything user-step-originated becomes an `ERROR_PEND`
    /// instead (see `ErrorInfo`).
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable numeric code surfaced to hosts (§7: "numeric code, message, optional
    /// stack-tail, and retryable flag").
    pub fn code(&self) -> u32 {
        match self {
            EngineError::DefinitionInvalid(_) => 1,
            EngineError::CaseAlreadyExists(_) => 2,
            EngineError::CaseNotFound(_) => 3,
            EngineError::CaseAlreadyComplete(_) => 4,
            EngineError::ExecutorSaturated => 5,
            EngineError::PersistFailed(_) => 6,
            EngineError::InvariantViolation(_) => 7,
            EngineError::Other(_) => 99,
        }
    }

    /// Whether a host may usefully retry the exact same call.
    pub fn retryable(&self) -> bool {
        matches!(self, EngineError::ExecutorSaturated)
    }
}

/// The error record attached to a pended path (§3 `ErrorInfo`, §7 `ERROR_PEND`).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn user_step_threw(message: impl Into<String>) -> Self {
        Self {
            code: "USER_STEP_THREW".to_string(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn unknown_ticket(ticket: &str) -> Self {
        Self {
            code: "UNKNOWN_TICKET".to_string(),
            message: format!("ticket '{ticket}' is not defined on this journey"),
            details: None,
            retryable: false,
        }
    }
}
