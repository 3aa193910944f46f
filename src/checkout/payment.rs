//! Hand-off to the external payment collaborator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tracing::{info, instrument};
use crate::domain::value_objects::{OrderId, OrderNumber};
use super::ContactInfo;

/// What the payment collaborator needs to start collecting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub order_number: OrderNumber,
    pub amount: Decimal,
    pub currency: String,
    pub contact: ContactInfo,
}

/// Returned to the buyer so the client can continue in the payment flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentHandoff {
    pub reference: String,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum PaymentGatewayError {
    #[error("payment gateway unavailable")]
    Unavailable,
    #[error("payment rejected: {0}")]
    Rejected(String),
    #[error("payment hand-off failed: {0}")]
    Publish(String),
}

pub trait PaymentGateway: Send + Sync + 'static {
    /// Start collection. The outcome arrives later through the coordinator's payment callbacks.
    fn begin(&self, request: &PaymentRequest) -> impl Future<Output = Result<PaymentHandoff, PaymentGatewayError>> + Send;
}

/// Publishes payment requests for the payments service to pick up.
pub struct NatsPaymentGateway {
    client: Option<async_nats::Client>,
    subject: String,
}

impl NatsPaymentGateway {
    pub const SUBJECT: &'static str = "payments.requested";

    pub fn new(client: Option<async_nats::Client>) -> Self {
        Self { client, subject: Self::SUBJECT.to_string() }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }
}

impl PaymentGateway for NatsPaymentGateway {
    #[instrument(skip_all, fields(order = %request.order_id))]
    async fn begin(&self, request: &PaymentRequest) -> Result<PaymentHandoff, PaymentGatewayError> {
        let client = self.client.as_ref().ok_or(PaymentGatewayError::Unavailable)?;
        let payload = serde_json::to_vec(request).map_err(|e| PaymentGatewayError::Publish(e.to_string()))?;
        client.publish(self.subject.clone(), payload.into()).await.map_err(|e| PaymentGatewayError::Publish(e.to_string()))?;
        client.flush().await.map_err(|e| PaymentGatewayError::Publish(e.to_string()))?;
        info!(subject = %self.subject, "Payment requested");
        Ok(PaymentHandoff { reference: request.order_number.to_string(), redirect_url: None })
    }
}
