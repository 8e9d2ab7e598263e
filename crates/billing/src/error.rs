//! Billing error types

use rust_decimal::Decimal;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed or contradictory request; never retried
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Deduction would require overage on an entitlement that disallows it
    #[error("Insufficient balance for feature {feature_id}: required {required}, available {available}")]
    InsufficientBalance {
        feature_id: String,
        required: Decimal,
        available: Decimal,
    },

    /// Another balance-mutating operation holds the customer lock; retryable
    #[error("Another operation is in progress for customer {customer_id}, please retry")]
    OperationInProgress { customer_id: String },

    /// Card declined by the provider, with the provider's decline reason
    #[error("Card declined: {reason}")]
    CardDeclined { reason: String },

    /// Provider API failure; code/message preserved for diagnostics
    #[error("Payment provider error: {message}")]
    ProviderApi {
        code: Option<String>,
        message: String,
    },

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Logic defect, not bad input; fatal for the current request
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller may safely retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::OperationInProgress { .. })
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        if let stripe::StripeError::Stripe(ref request_err) = err {
            if request_err.error_type == stripe::ErrorType::Card {
                return BillingError::CardDeclined {
                    reason: request_err
                        .message
                        .clone()
                        .unwrap_or_else(|| "card declined".to_string()),
                };
            }
            return BillingError::ProviderApi {
                code: request_err.code.clone().map(|c| format!("{:?}", c)),
                message: request_err
                    .message
                    .clone()
                    .unwrap_or_else(|| err.to_string()),
            };
        }
        BillingError::ProviderApi {
            code: None,
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("serialization failed: {}", err))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_lock_held_is_retryable() {
        let err = BillingError::OperationInProgress {
            customer_id: "cus_1".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_insufficient_balance_is_distinct() {
        let err = BillingError::InsufficientBalance {
            feature_id: "messages".to_string(),
            required: dec!(150),
            available: dec!(100),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("messages"));
    }
}
