//! Stock Ledger
//!
//! The only writer of stock counters and holds. Every claim against a unit goes
//! through [`StockLedger::reserve`], which serializes concurrent buyers per unit
//! and is all-or-nothing across the batch.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use crate::domain::aggregates::{Availability, Hold, HoldRequest};
use crate::domain::value_objects::{BuyerId, OrderId, ProductId, UnitId, VariantId};

/// A unit whose free stock could not cover a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub unit_id: UnitId,
    pub requested: u32,
    /// Free stock for this buyer, counting the buyer's own prior hold as free.
    pub available: u32,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient stock for {} unit(s)", .0.len())]
    InsufficientStock(Vec<Shortage>),
    #[error("unknown stock unit: {0}")]
    UnknownUnit(UnitId),
    #[error("invalid quantity {quantity} for unit {unit_id}")]
    InvalidQuantity { unit_id: UnitId, quantity: u32 },
    #[error("cannot set unit {unit_id} to {requested}: {held} already held")]
    BelowHeld { unit_id: UnitId, requested: u32, held: u32 },
    #[error("ledger storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

pub trait StockLedger: Send + Sync + 'static {
    /// Place or replace one hold per requested unit for `buyer`, atomically over the batch.
    fn reserve(&self, buyer: &BuyerId, requests: &[HoldRequest]) -> impl Future<Output = Result<Vec<Hold>, LedgerError>> + Send;

    /// Move the buyer's live, unlinked holds to `finalized` under `order`. Returns how many moved.
    fn finalize(&self, buyer: &BuyerId, order: &OrderId) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Release the buyer's live holds; with `order`, only those unlinked or linked to it.
    fn release(&self, buyer: &BuyerId, order: Option<&OrderId>) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Release the buyer's live holds on the given units only.
    fn release_units(&self, buyer: &BuyerId, units: &[UnitId]) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Physically mark lapsed holds as expired. Availability never waits on this.
    fn sweep_expired(&self) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    fn availability(&self, unit: &UnitId) -> impl Future<Output = Result<Availability, LedgerError>> + Send;

    /// Holds owned by `buyer`, with lapsed active holds reported as expired.
    fn holds_for(&self, buyer: &BuyerId) -> impl Future<Output = Result<Vec<Hold>, LedgerError>> + Send;

    /// Create a unit or change its physical stock. Refuses to drop below what is held.
    fn set_available(&self, unit: &UnitId, product: &ProductId, variant: Option<&VariantId>, quantity: u32)
        -> impl Future<Output = Result<Availability, LedgerError>> + Send;
}

/// Sorted, de-duplicated batch; rejects zero quantities.
pub(crate) fn normalize(requests: &[HoldRequest]) -> Result<Vec<HoldRequest>, LedgerError> {
    let mut sorted: Vec<HoldRequest> = Vec::with_capacity(requests.len());
    let mut input = requests.to_vec();
    input.sort_by_key(|r| r.unit_id);
    for request in input {
        if request.quantity == 0 {
            return Err(LedgerError::InvalidQuantity { unit_id: request.unit_id, quantity: 0 });
        }
        match sorted.last_mut() {
            Some(last) if last.unit_id == request.unit_id => {
                last.quantity = last.quantity.checked_add(request.quantity)
                    .ok_or(LedgerError::InvalidQuantity { unit_id: request.unit_id, quantity: request.quantity })?;
            }
            _ => sorted.push(request),
        }
    }
    Ok(sorted)
}

/// Shortest sweep period; `tokio::time::interval` rejects zero.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// Run `sweep_expired` on a fixed period until the task is aborted.
pub fn spawn_sweeper<L: StockLedger>(ledger: Arc<L>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(MIN_SWEEP_PERIOD));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match ledger.sweep_expired().await {
                Ok(0) => {}
                Ok(expired) => debug!(expired, "Swept lapsed holds"),
                Err(e) => warn!(error = %e, "Hold sweep failed"),
            }
        }
    })
}
