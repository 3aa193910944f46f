use thiserror::Error;
use crate::checkout::StoreError;
use crate::domain::aggregates::OrderError;
use crate::domain::value_objects::{OrderId, UnitId};
use crate::holds::{HoldError, LineShortage};
use crate::ledger::LedgerError;

// =============================================================================
// Checkout boundary errors
// =============================================================================

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("Requested quantity unavailable")]
    QuantityUnavailable(Vec<LineShortage>),

    #[error("Hold expired, cart must be re-validated")]
    HoldExpired(Vec<UnitId>),

    #[error("Order could not be placed, please retry")]
    OrderCommitFailure(#[source] StoreError),

    #[error("Payment failed: {reason}")]
    PaymentFailure { order_id: OrderId, reason: String },

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Order not found")]
    OrderNotFound(OrderId),

    #[error("Order {order_id} cannot take this transition: {source}")]
    InvalidTransition { order_id: OrderId, #[source] source: OrderError },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[source] StoreError),
}

impl From<HoldError> for CheckoutError {
    fn from(e: HoldError) -> Self {
        match e {
            HoldError::Unavailable(lines) => Self::QuantityUnavailable(lines),
            HoldError::Ledger(e) => Self::Ledger(e),
        }
    }
}

impl From<validator::ValidationErrors> for CheckoutError {
    fn from(e: validator::ValidationErrors) -> Self { Self::InvalidRequest(e.to_string()) }
}

impl CheckoutError {
    /// Stable machine-readable code for API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuantityUnavailable(_) => "quantity_unavailable",
            Self::HoldExpired(_) => "hold_expired",
            Self::OrderCommitFailure(_) => "order_commit_failure",
            Self::PaymentFailure { .. } => "payment_failure",
            Self::EmptyCart => "empty_cart",
            Self::InvalidRequest(_) => "invalid_request",
            Self::OrderNotFound(_) => "order_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Ledger(LedgerError::UnknownUnit(_)) => "unknown_unit",
            Self::Ledger(LedgerError::BelowHeld { .. }) => "below_held",
            Self::Ledger(_) | Self::Storage(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckoutError>;
