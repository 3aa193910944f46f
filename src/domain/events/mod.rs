//! Domain events
use crate::domain::value_objects::{BuyerId, OrderId, OrderNumber};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Signals raised by a checkout attempt. Delivery is best effort.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckoutEvent {
    CheckoutStarted { buyer_id: BuyerId, line_count: usize },
    OrderCompleted { order_id: OrderId, order_number: OrderNumber, buyer_id: BuyerId, total: Decimal },
    PaymentFailed { order_id: OrderId, order_number: OrderNumber, buyer_id: BuyerId, reason: String },
    /// Paid order whose stock could not be secured.
    RefundRequired { order_id: OrderId, order_number: OrderNumber, buyer_id: BuyerId, total: Decimal },
}

impl CheckoutEvent {
    /// NATS subject the event is published on.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::CheckoutStarted { .. } => "checkout.started",
            Self::OrderCompleted { .. } => "checkout.order_completed",
            Self::PaymentFailed { .. } => "checkout.payment_failed",
            Self::RefundRequired { .. } => "checkout.refund_required",
        }
    }
}
