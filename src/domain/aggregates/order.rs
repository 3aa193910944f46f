//! Order Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;
use crate::domain::aggregates::cart::CartLine;
use crate::domain::events::CheckoutEvent;
use crate::domain::value_objects::{BundleId, BuyerId, OrderId, OrderNumber, ProductId, UnitId, VariantId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: OrderNumber,
    pub buyer_id: BuyerId,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub shipping_charge: Decimal,
    pub total: Decimal,
    pub shipping_address: AddressSnapshot,
    pub coupon: Option<CouponSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    events: Vec<CheckoutEvent>,
}

/// Line snapshot; prices are frozen at commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub order_id: OrderId,
    pub unit_id: UnitId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub name: String,
    pub sku: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub line_total: Decimal,
    pub discount: Decimal,
    pub bundle_id: Option<BundleId>,
    pub bundle_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AddressSnapshot {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[validate(length(min = 6, max = 20))]
    pub phone: String,
    #[validate(length(min = 1, max = 200))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 80))]
    pub city: String,
    #[validate(length(min = 1, max = 80))]
    pub state: String,
    #[validate(length(min = 3, max = 12))]
    pub postal_code: String,
}

/// Coupon as applied; not a live reference to the coupon record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponSnapshot {
    pub code: String,
    pub kind: String,
    pub value: Decimal,
    pub discount: Decimal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { #[default] Pending, Confirmed, PaymentFailed, Unfulfillable }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { #[default] Pending, Paid, Failed }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { CashOnDelivery, Online }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus { #[default] Pending, Shipped, Delivered, Returned }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub order_id: OrderId,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub order_id: OrderId,
    pub status: DeliveryStatus,
    /// Amount the courier collects; only set for cash on delivery.
    pub cod_amount: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// Asynchronous outcome reported by the payment collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid { reference: Option<String> },
    Failed { reason: String },
}

/// An order with its dependents. Commits write one whole or not at all.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order: Order,
    pub items: Vec<OrderLineItem>,
    pub delivery: DeliveryRecord,
    pub payment: Option<PaymentRecord>,
}

/// Totals the order is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub shipping_charge: Decimal,
    pub total: Decimal,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        order_number: OrderNumber,
        buyer_id: BuyerId,
        payment_method: PaymentMethod,
        currency: &str,
        totals: OrderTotals,
        shipping_address: AddressSnapshot,
        coupon: Option<CouponSnapshot>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrderId::new(), order_number, buyer_id,
            status: OrderStatus::Pending, payment_status: PaymentStatus::Pending, payment_method,
            currency: currency.to_string(),
            subtotal: totals.subtotal, discount_total: totals.discount_total,
            shipping_charge: totals.shipping_charge, total: totals.total,
            shipping_address, coupon, created_at: now, updated_at: now, events: vec![],
        }
    }

    /// Pair the order with its line items and initial shadow records.
    pub fn into_record(self, lines: &[CartLine], line_discounts: &[Decimal]) -> OrderRecord {
        let items = lines.iter().enumerate().map(|(i, line)| OrderLineItem {
            order_id: self.id,
            unit_id: line.unit_id,
            product_id: line.product_id,
            variant_id: line.variant_id,
            name: line.name.clone(),
            sku: line.sku.clone(),
            unit_price: line.unit_price,
            quantity: line.quantity,
            line_total: line.line_total(),
            discount: line_discounts.get(i).copied().unwrap_or(Decimal::ZERO),
            bundle_id: line.bundle.as_ref().map(|b| b.id),
            bundle_name: line.bundle.as_ref().map(|b| b.name.clone()),
        }).collect();
        let cod = self.payment_method == PaymentMethod::CashOnDelivery;
        let delivery = DeliveryRecord {
            order_id: self.id,
            status: DeliveryStatus::Pending,
            cod_amount: cod.then_some(self.total),
            updated_at: self.created_at,
        };
        let payment = cod.then(|| PaymentRecord {
            order_id: self.id,
            method: PaymentMethod::CashOnDelivery,
            amount: self.total,
            status: PaymentStatus::Pending,
            reference: None,
            failure_reason: None,
            updated_at: self.created_at,
        });
        OrderRecord { order: self, items, delivery, payment }
    }

    /// Cash on delivery: confirmed now, collected by the courier later.
    pub fn accept_cod(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        if self.payment_method != PaymentMethod::CashOnDelivery { return Err(OrderError::WrongMethod); }
        if self.status != OrderStatus::Pending { return Err(OrderError::AlreadyResolved(self.payment_status)); }
        self.status = OrderStatus::Confirmed;
        self.touch(now);
        self.raise_completed();
        Ok(())
    }

    /// Apply an online payment outcome. Only the first outcome sticks; the returned
    /// record is the payment row to upsert. A success leaves the order `pending` until
    /// its stock is secured by [`Order::confirm_paid`] or [`Order::mark_unfulfillable`].
    pub fn resolve_payment(&mut self, outcome: &PaymentOutcome, now: DateTime<Utc>) -> Result<PaymentRecord, OrderError> {
        if self.payment_method != PaymentMethod::Online { return Err(OrderError::WrongMethod); }
        if self.payment_status != PaymentStatus::Pending { return Err(OrderError::AlreadyResolved(self.payment_status)); }
        let (reference, failure_reason) = match outcome {
            PaymentOutcome::Paid { reference } => {
                self.payment_status = PaymentStatus::Paid;
                (reference.clone(), None)
            }
            PaymentOutcome::Failed { reason } => {
                self.payment_status = PaymentStatus::Failed;
                self.status = OrderStatus::PaymentFailed;
                self.events.push(CheckoutEvent::PaymentFailed {
                    order_id: self.id, order_number: self.order_number.clone(),
                    buyer_id: self.buyer_id, reason: reason.clone(),
                });
                (None, Some(reason.clone()))
            }
        };
        self.touch(now);
        Ok(PaymentRecord {
            order_id: self.id, method: PaymentMethod::Online, amount: self.total,
            status: self.payment_status, reference, failure_reason, updated_at: now,
        })
    }

    /// Paid and its stock finalized.
    pub fn confirm_paid(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.check_awaiting_stock()?;
        self.status = OrderStatus::Confirmed;
        self.touch(now);
        self.raise_completed();
        Ok(())
    }

    /// Paid, but the stock went to another buyer after the holds lapsed. The money
    /// has to go back.
    pub fn mark_unfulfillable(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.check_awaiting_stock()?;
        self.status = OrderStatus::Unfulfillable;
        self.touch(now);
        self.events.push(CheckoutEvent::RefundRequired {
            order_id: self.id, order_number: self.order_number.clone(), buyer_id: self.buyer_id, total: self.total,
        });
        Ok(())
    }

    fn check_awaiting_stock(&self) -> Result<(), OrderError> {
        if self.payment_method != PaymentMethod::Online { return Err(OrderError::WrongMethod); }
        if self.payment_status != PaymentStatus::Paid || self.status != OrderStatus::Pending {
            return Err(OrderError::NotAwaitingStock(self.status));
        }
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<CheckoutEvent> { std::mem::take(&mut self.events) }

    fn raise_completed(&mut self) {
        self.events.push(CheckoutEvent::OrderCompleted {
            order_id: self.id, order_number: self.order_number.clone(), buyer_id: self.buyer_id, total: self.total,
        });
    }

    fn touch(&mut self, now: DateTime<Utc>) { self.updated_at = now; }
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending", Self::Confirmed => "confirmed",
            Self::PaymentFailed => "payment_failed", Self::Unfulfillable => "unfulfillable",
        }
    }
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending), "confirmed" => Some(Self::Confirmed),
            "payment_failed" => Some(Self::PaymentFailed), "unfulfillable" => Some(Self::Unfulfillable), _ => None,
        }
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Paid => "paid", Self::Failed => "failed" }
    }
    pub fn parse(value: &str) -> Option<Self> {
        match value { "pending" => Some(Self::Pending), "paid" => Some(Self::Paid), "failed" => Some(Self::Failed), _ => None }
    }
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self { Self::CashOnDelivery => "cash_on_delivery", Self::Online => "online" }
    }
    pub fn parse(value: &str) -> Option<Self> {
        match value { "cash_on_delivery" => Some(Self::CashOnDelivery), "online" => Some(Self::Online), _ => None }
    }
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Shipped => "shipped", Self::Delivered => "delivered", Self::Returned => "returned" }
    }
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending), "shipped" => Some(Self::Shipped),
            "delivered" => Some(Self::Delivered), "returned" => Some(Self::Returned), _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("payment method does not allow this transition")]
    WrongMethod,
    #[error("payment already resolved as {0:?}")]
    AlreadyResolved(PaymentStatus),
    #[error("order is {0:?}, not a paid order awaiting stock")]
    NotAwaitingStock(OrderStatus),
}
