//! Domain errors for the billing engine.

use service_core::error::AppError;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Expected outcome of a debit against a balance that does not strictly exceed the fee.
    #[error("insufficient funds on account {account}")]
    InsufficientFunds { account: String },

    #[error("account {account} already has an active subscription")]
    AlreadyActive { account: String },

    #[error("account {account} has no active subscription")]
    NotFound { account: String },

    #[error("account {account} has no balance operations on page {page}")]
    NoHistory { account: String, page: u64 },

    #[error("account {account} has no balance")]
    NoBalance { account: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(anyhow::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("price lookup failed: {0}")]
    Catalog(String),
}

impl BillingError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::InsufficientFunds { .. } => "insufficient_funds",
            BillingError::AlreadyActive { .. } => "already_active",
            BillingError::NotFound { .. } => "not_found",
            BillingError::NoHistory { .. } => "no_history",
            BillingError::NoBalance { .. } => "no_balance",
            BillingError::InvalidArgument(_) => "invalid_argument",
            BillingError::StoreUnavailable(_) => "store_unavailable",
            BillingError::Configuration(_) => "configuration",
            BillingError::Catalog(_) => "catalog",
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        let message = err.to_string();
        match err {
            BillingError::AlreadyActive { .. } => AppError::Conflict(anyhow::anyhow!(message)),
            BillingError::NotFound { .. }
            | BillingError::NoHistory { .. }
            | BillingError::NoBalance { .. } => AppError::NotFound(anyhow::anyhow!(message)),
            BillingError::InvalidArgument(_) => AppError::BadRequest(anyhow::anyhow!(message)),
            BillingError::InsufficientFunds { .. } => {
                AppError::FailedPrecondition(anyhow::anyhow!(message))
            }
            BillingError::StoreUnavailable(source) => AppError::DatabaseError(source),
            BillingError::Configuration(_) => AppError::ConfigError(anyhow::anyhow!(message)),
            BillingError::Catalog(_) => AppError::InternalError(anyhow::anyhow!(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::grpc::{Code, IntoStatus};

    fn code_of(err: BillingError) -> Code {
        AppError::from(err).into_status().code()
    }

    #[test]
    fn client_errors_map_to_grpc_codes() {
        let account = "a@example.com".to_string();
        assert_eq!(
            code_of(BillingError::AlreadyActive {
                account: account.clone()
            }),
            Code::AlreadyExists
        );
        assert_eq!(
            code_of(BillingError::NotFound {
                account: account.clone()
            }),
            Code::NotFound
        );
        assert_eq!(
            code_of(BillingError::NoHistory {
                account: account.clone(),
                page: 3
            }),
            Code::NotFound
        );
        assert_eq!(
            code_of(BillingError::InsufficientFunds { account }),
            Code::FailedPrecondition
        );
        assert_eq!(
            code_of(BillingError::InvalidArgument("page must be >= 1".into())),
            Code::InvalidArgument
        );
    }

    #[test]
    fn store_faults_are_unavailable() {
        let err = BillingError::StoreUnavailable(anyhow::anyhow!("connection reset"));
        assert_eq!(err.kind(), "store_unavailable");
        assert_eq!(code_of(err), Code::Unavailable);
    }

    #[test]
    fn history_message_names_the_page() {
        let err = BillingError::NoHistory {
            account: "a@example.com".into(),
            page: 2,
        };
        assert_eq!(
            err.to_string(),
            "account a@example.com has no balance operations on page 2"
        );
    }
}
