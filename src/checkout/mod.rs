//! Checkout Commit Coordinator
//!
//! Drives one checkout attempt from a validated cart to a committed order:
//!
//! ```text
//! cart_validated -> holds_confirmed -> order_created -> cod_accepted
//!                                                    -> payment_pending -> payment_succeeded
//!                                                                       -> payment_failed
//! ```
//!
//! Holds stay `active` until the payment outcome is known. Nothing is locked
//! while an online payment is pending; the order is committed and visible
//! before the hand-off, and the hold window is the only timeout.

mod payment;
mod postgres;
mod store;

pub use payment::{NatsPaymentGateway, PaymentGateway, PaymentGatewayError, PaymentHandoff, PaymentRequest};
pub use postgres::PgCheckoutStore;
pub use store::{CheckoutStore, MemoryStore, StoreError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;
use crate::clock::Clock;
use crate::config::CheckoutConfig;
use crate::discount::{self, Coupon, PromotionalOffer, Quote};
use crate::domain::aggregates::{
    AddressSnapshot, CartLine, Hold, HoldRequest, Order, OrderError, OrderRecord, OrderStatus, PaymentMethod,
    PaymentOutcome, PaymentStatus,
};
use crate::domain::events::CheckoutEvent;
use crate::domain::value_objects::{BuyerId, OrderId, OrderNumber, UnitId};
use crate::error::{CheckoutError, Result};
use crate::holds::HoldManager;
use crate::ledger::{LedgerError, StockLedger};
use crate::notify::Signals;

/// Fresh order numbers tried before a commit gives up on collisions.
const ORDER_NUMBER_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ContactInfo {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 6, max = 20))]
    pub phone: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CheckoutRequest {
    pub buyer_id: BuyerId,
    #[validate]
    pub contact: ContactInfo,
    #[validate]
    pub lines: Vec<CartLine>,
    #[validate]
    pub shipping_address: AddressSnapshot,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub offers: Vec<PromotionalOffer>,
    #[serde(default)]
    pub coupon: Option<Coupon>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// Terminal success without waiting (cash on delivery).
    Completed { order: Order },
    /// Order committed; the buyer continues in the payment flow.
    AwaitingPayment { order: Order, handoff: PaymentHandoff },
}

impl CheckoutOutcome {
    pub fn order(&self) -> &Order {
        match self {
            Self::Completed { order } | Self::AwaitingPayment { order, .. } => order,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutState {
    CartValidated,
    HoldsConfirmed,
    OrderCreated,
    PaymentPending,
    PaymentSucceeded,
    PaymentFailed,
    CodAccepted,
}

impl CheckoutState {
    pub fn can_advance_to(self, next: Self) -> bool {
        use CheckoutState::*;
        matches!(
            (self, next),
            (CartValidated, HoldsConfirmed)
                | (HoldsConfirmed, OrderCreated)
                | (OrderCreated, CodAccepted)
                | (OrderCreated, PaymentPending)
                | (PaymentPending, PaymentSucceeded)
                | (PaymentPending, PaymentFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::PaymentSucceeded | Self::PaymentFailed | Self::CodAccepted)
    }

    /// State of an attempt whose order has been persisted.
    pub fn of(order: &Order) -> Self {
        match (order.payment_method, order.status, order.payment_status) {
            (PaymentMethod::CashOnDelivery, OrderStatus::Confirmed, _) => Self::CodAccepted,
            (PaymentMethod::CashOnDelivery, _, _) => Self::OrderCreated,
            (PaymentMethod::Online, _, PaymentStatus::Paid) => Self::PaymentSucceeded,
            (PaymentMethod::Online, _, PaymentStatus::Failed) => Self::PaymentFailed,
            (PaymentMethod::Online, _, PaymentStatus::Pending) => Self::PaymentPending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CartValidated => "cart_validated",
            Self::HoldsConfirmed => "holds_confirmed",
            Self::OrderCreated => "order_created",
            Self::PaymentPending => "payment_pending",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::CodAccepted => "cod_accepted",
        }
    }
}

impl fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Tracks one in-flight attempt through the transition table.
struct Attempt {
    state: CheckoutState,
}

impl Attempt {
    fn start() -> Self { Self { state: CheckoutState::CartValidated } }

    fn advance(&mut self, next: CheckoutState) {
        debug_assert!(self.state.can_advance_to(next), "{} -> {}", self.state, next);
        info!(from = %self.state, to = %next, "Checkout advanced");
        self.state = next;
    }
}

pub struct CheckoutCoordinator<L, S, P> {
    holds: HoldManager<L>,
    store: Arc<S>,
    payments: Arc<P>,
    signals: Signals,
    clock: Arc<dyn Clock>,
    config: CheckoutConfig,
}

impl<L: StockLedger, S: CheckoutStore, P: PaymentGateway> CheckoutCoordinator<L, S, P> {
    pub fn new(
        ledger: Arc<L>,
        store: Arc<S>,
        payments: Arc<P>,
        signals: Signals,
        clock: Arc<dyn Clock>,
        config: CheckoutConfig,
    ) -> Self {
        Self { holds: HoldManager::new(ledger), store, payments, signals, clock, config }
    }

    pub fn ledger(&self) -> &L { self.holds.ledger() }

    pub fn store(&self) -> &S { &self.store }

    pub fn signals(&self) -> &Signals { &self.signals }

    pub fn config(&self) -> &CheckoutConfig { &self.config }

    /// Re-validate the buyer's holds after a cart change.
    pub async fn ensure_holds(&self, buyer: &BuyerId, lines: &[CartLine]) -> Result<Vec<Hold>> {
        for line in lines {
            line.validate()?;
        }
        Ok(self.holds.ensure_holds(buyer, lines).await?)
    }

    /// Price preview; identical inputs give the commit's totals exactly.
    pub fn quote(&self, lines: &[CartLine], offers: &[PromotionalOffer], coupon: Option<&Coupon>) -> Quote {
        discount::quote(lines, offers, coupon, &self.config)
    }

    /// Run an attempt to its first resting point: terminal for cash on delivery,
    /// awaiting the payment callback for online payment.
    #[instrument(skip_all, fields(buyer = %request.buyer_id, method = request.payment_method.as_str()))]
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutOutcome> {
        if request.lines.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        request.validate()?;
        let buyer = request.buyer_id;
        let mut attempt = Attempt::start();
        self.signals.emit(CheckoutEvent::CheckoutStarted { buyer_id: buyer, line_count: request.lines.len() });

        let holds = self.holds.ensure_holds(&buyer, &request.lines).await?;
        let now = self.clock.now();
        let lapsed: Vec<UnitId> = holds.iter().filter(|h| h.expires_at <= now).map(|h| h.unit_id).collect();
        if !lapsed.is_empty() {
            info!(lapsed = lapsed.len(), "Holds lapsed before order creation");
            return Err(CheckoutError::HoldExpired(lapsed));
        }
        attempt.advance(CheckoutState::HoldsConfirmed);

        let quote = self.quote(&request.lines, &request.offers, request.coupon.as_ref());
        let coupon = request.coupon.as_ref().map(|c| c.snapshot(quote.discount.coupon_discount));
        let order = Order::create(
            OrderNumber::generate(now), buyer, request.payment_method, &self.config.currency,
            quote.totals(), request.shipping_address.clone(), coupon, now,
        );
        let mut record = order.into_record(&request.lines, &quote.line_discounts());
        self.commit(&mut record, now).await?;
        attempt.advance(CheckoutState::OrderCreated);
        let order_id = record.order.id;

        match request.payment_method {
            PaymentMethod::CashOnDelivery => {
                let mut order = self.settle(order_id, |o| o.accept_cod(now)).await?;
                let finalized = self.ledger().finalize(&buyer, &order_id).await.map_err(|e| {
                    error!(order = %order_id, error = %e, "Confirmed cash on delivery order could not finalize its holds");
                    e
                })?;
                self.clear_cart(&buyer).await;
                self.publish(&mut order);
                attempt.advance(CheckoutState::CodAccepted);
                info!(order = %order_id, number = %order.order_number, finalized, "Cash on delivery order accepted");
                Ok(CheckoutOutcome::Completed { order })
            }
            PaymentMethod::Online => {
                attempt.advance(CheckoutState::PaymentPending);
                let payment = PaymentRequest {
                    order_id,
                    order_number: record.order.order_number.clone(),
                    amount: record.order.total,
                    currency: record.order.currency.clone(),
                    contact: request.contact.clone(),
                };
                match self.payments.begin(&payment).await {
                    Ok(handoff) => {
                        info!(order = %order_id, reference = %handoff.reference, "Awaiting payment");
                        Ok(CheckoutOutcome::AwaitingPayment { order: record.order, handoff })
                    }
                    Err(e) => {
                        warn!(order = %order_id, error = %e, "Payment hand-off failed");
                        let reason = e.to_string();
                        if let Err(resolve) = self.payment_failed(order_id, reason.clone()).await {
                            warn!(order = %order_id, error = %resolve, "Could not record failed payment, releasing holds");
                            self.ledger().release(&buyer, Some(&order_id)).await?;
                        }
                        Err(CheckoutError::PaymentFailure { order_id, reason })
                    }
                }
            }
        }
    }

    /// Success callback. The first outcome for an order wins; repeats return the order unchanged.
    ///
    /// The order is only confirmed once its lines are finalized in the ledger. When the
    /// holds lapsed and the stock has since gone to another buyer, the paid order is marked
    /// `unfulfillable` and a refund is signalled instead.
    #[instrument(skip_all, fields(order = %order_id))]
    pub async fn payment_succeeded(&self, order_id: OrderId, reference: Option<String>) -> Result<Order> {
        let now = self.clock.now();
        let outcome = PaymentOutcome::Paid { reference };
        let Some(paid) = self.resolve(order_id, &outcome, now).await? else {
            return self.current(order_id).await;
        };
        let mut order = match self.secure_stock(&paid).await? {
            Some(finalized) => {
                let order = self.settle(order_id, |o| o.confirm_paid(now)).await?;
                self.clear_cart(&order.buyer_id).await;
                info!(from = %CheckoutState::PaymentPending, to = %CheckoutState::of(&order), finalized, "Checkout advanced");
                order
            }
            None => {
                warn!(number = %paid.order_number, "Paid after holds lapsed and stock was sold, refund required");
                self.settle(order_id, |o| o.mark_unfulfillable(now)).await?
            }
        };
        self.publish(&mut order);
        Ok(order)
    }

    /// Failure callback, including an abandoned payment flow. The order is kept as a
    /// failed-payment record and the holds go back to the pool.
    #[instrument(skip_all, fields(order = %order_id))]
    pub async fn payment_failed(&self, order_id: OrderId, reason: String) -> Result<Order> {
        let now = self.clock.now();
        let outcome = PaymentOutcome::Failed { reason };
        let Some(mut order) = self.resolve(order_id, &outcome, now).await? else {
            return self.current(order_id).await;
        };
        let released = self.ledger().release(&order.buyer_id, Some(&order_id)).await?;
        self.publish(&mut order);
        info!(from = %CheckoutState::PaymentPending, to = %CheckoutState::of(&order), released, "Checkout advanced");
        Ok(order)
    }

    pub async fn order(&self, order_id: OrderId) -> Result<OrderRecord> {
        self.store
            .load(&order_id)
            .await
            .map_err(CheckoutError::Storage)?
            .ok_or(CheckoutError::OrderNotFound(order_id))
    }

    /// Commit the record, drawing a fresh order number on collision.
    async fn commit(&self, record: &mut OrderRecord, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        for _ in 1..ORDER_NUMBER_ATTEMPTS {
            match self.store.commit(record).await {
                Err(StoreError::DuplicateOrderNumber(number)) => {
                    warn!(%number, "Order number collision, regenerating");
                    record.order.order_number = OrderNumber::generate(now);
                }
                result => return result.map_err(commit_failure),
            }
        }
        self.store.commit(record).await.map_err(commit_failure)
    }

    /// Apply a payment outcome. `None` means an earlier outcome already resolved the order.
    async fn resolve(
        &self,
        order_id: OrderId,
        outcome: &PaymentOutcome,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Order>> {
        match self.store.update_order(&order_id, |o| o.resolve_payment(outcome, now).map(Some)).await {
            Ok(order) => Ok(Some(order)),
            Err(StoreError::Rejected(OrderError::AlreadyResolved(status))) => {
                info!(status = status.as_str(), "Duplicate payment callback ignored");
                Ok(None)
            }
            Err(e) => Err(store_error(order_id, e)),
        }
    }

    /// Re-reserve the order's lines for its buyer and finalize them. A live hold is
    /// renewed in place; a lapsed one is taken again only if the stock is still free.
    /// `None` when it is not, after releasing whatever the buyer still holds for the order.
    async fn secure_stock(&self, order: &Order) -> Result<Option<u64>> {
        let record = self.order(order.id).await?;
        let requests: Vec<HoldRequest> = record.items.iter()
            .map(|item| HoldRequest { unit_id: item.unit_id, quantity: item.quantity })
            .collect();
        match self.ledger().reserve(&order.buyer_id, &requests).await {
            Ok(_) => Ok(Some(self.ledger().finalize(&order.buyer_id, &order.id).await?)),
            Err(LedgerError::InsufficientStock(short)) => {
                info!(short = short.len(), "Stock gone before payment resolved");
                self.ledger().release(&order.buyer_id, Some(&order.id)).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a status change that carries no payment record.
    async fn settle<F>(&self, order_id: OrderId, apply: F) -> Result<Order>
    where
        F: FnOnce(&mut Order) -> std::result::Result<(), OrderError> + Send,
    {
        self.store
            .update_order(&order_id, |o| apply(o).map(|()| None))
            .await
            .map_err(|e| store_error(order_id, e))
    }

    async fn current(&self, order_id: OrderId) -> Result<Order> {
        Ok(self.order(order_id).await?.order)
    }

    async fn clear_cart(&self, buyer: &BuyerId) {
        if let Err(e) = self.store.clear_cart(buyer).await {
            warn!(%buyer, error = %e, "Failed to clear cart");
        }
    }

    fn publish(&self, order: &mut Order) {
        for event in order.take_events() {
            self.signals.emit(event);
        }
    }
}

fn commit_failure(e: StoreError) -> CheckoutError {
    error!(error = %e, "Order commit failed");
    CheckoutError::OrderCommitFailure(e)
}

fn store_error(order_id: OrderId, e: StoreError) -> CheckoutError {
    match e {
        StoreError::NotFound(id) => CheckoutError::OrderNotFound(id),
        StoreError::Rejected(source) => CheckoutError::InvalidTransition { order_id, source },
        other => CheckoutError::Storage(other),
    }
}
