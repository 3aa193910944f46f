//! Order persistence used by the coordinator.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;
use crate::domain::aggregates::{CartLine, Order, OrderError, OrderRecord, PaymentMethod, PaymentRecord};
use crate::domain::value_objects::{BuyerId, OrderId, OrderNumber};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order number already used: {0}")]
    DuplicateOrderNumber(OrderNumber),
    #[error("incomplete order batch: {0}")]
    Incomplete(&'static str),
    #[error("order not found: {0}")]
    NotFound(OrderId),
    #[error(transparent)]
    Rejected(#[from] OrderError),
    #[error("order storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("corrupt order row: {0}")]
    Corrupt(String),
}

pub trait CheckoutStore: Send + Sync + 'static {
    /// Persist the order, its items, delivery record and (for cash on delivery) payment
    /// record in one atomic unit.
    fn commit(&self, record: &OrderRecord) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load(&self, order: &OrderId) -> impl Future<Output = Result<Option<OrderRecord>, StoreError>> + Send;

    /// Read-modify-write one order under an exclusive lock. When `apply` yields a payment
    /// record it is upserted in the same unit. Returns the order as written.
    fn update_order<F>(&self, order: &OrderId, apply: F) -> impl Future<Output = Result<Order, StoreError>> + Send
    where
        F: FnOnce(&mut Order) -> Result<Option<PaymentRecord>, OrderError> + Send;

    fn clear_cart(&self, buyer: &BuyerId) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Structural checks every store runs before writing anything.
pub(crate) fn check_complete(record: &OrderRecord) -> Result<(), StoreError> {
    let id = record.order.id;
    if record.items.is_empty() {
        return Err(StoreError::Incomplete("order has no line items"));
    }
    if record.items.iter().any(|item| item.order_id != id) {
        return Err(StoreError::Incomplete("line item belongs to another order"));
    }
    if record.delivery.order_id != id {
        return Err(StoreError::Incomplete("delivery record belongs to another order"));
    }
    let cod = record.order.payment_method == PaymentMethod::CashOnDelivery;
    match &record.payment {
        Some(payment) if payment.order_id != id => Err(StoreError::Incomplete("payment record belongs to another order")),
        None if cod => Err(StoreError::Incomplete("cash on delivery order without payment record")),
        _ => Ok(()),
    }
}

#[derive(Default)]
struct Tables {
    orders: HashMap<OrderId, OrderRecord>,
    numbers: HashSet<OrderNumber>,
    carts: HashMap<BuyerId, Vec<CartLine>>,
}

/// In-process store; one lock guards all tables so a commit is all-or-nothing.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn put_cart(&self, buyer: BuyerId, lines: Vec<CartLine>) {
        self.tables.lock().await.carts.insert(buyer, lines);
    }

    pub async fn cart(&self, buyer: &BuyerId) -> Vec<CartLine> {
        self.tables.lock().await.carts.get(buyer).cloned().unwrap_or_default()
    }

    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }
}

impl CheckoutStore for MemoryStore {
    #[instrument(skip_all, fields(order = %record.order.id))]
    async fn commit(&self, record: &OrderRecord) -> Result<(), StoreError> {
        check_complete(record)?;
        let mut tables = self.tables.lock().await;
        if tables.numbers.contains(&record.order.order_number) {
            return Err(StoreError::DuplicateOrderNumber(record.order.order_number.clone()));
        }
        let mut stored = record.clone();
        stored.order.take_events();
        tables.numbers.insert(stored.order.order_number.clone());
        tables.orders.insert(stored.order.id, stored);
        Ok(())
    }

    async fn load(&self, order: &OrderId) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self.tables.lock().await.orders.get(order).cloned())
    }

    async fn update_order<F>(&self, order: &OrderId, apply: F) -> Result<Order, StoreError>
    where
        F: FnOnce(&mut Order) -> Result<Option<PaymentRecord>, OrderError> + Send,
    {
        let mut tables = self.tables.lock().await;
        let record = tables.orders.get_mut(order).ok_or(StoreError::NotFound(*order))?;
        let mut updated = record.order.clone();
        if let Some(payment) = apply(&mut updated)? {
            record.payment = Some(payment);
        }
        record.order = updated.clone();
        record.order.take_events();
        Ok(updated)
    }

    async fn clear_cart(&self, buyer: &BuyerId) -> Result<(), StoreError> {
        self.tables.lock().await.carts.remove(buyer);
        Ok(())
    }
}
