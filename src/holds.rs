//! Hold Manager
//!
//! Re-validates a buyer's holds against the ledger on every cart change and
//! turns ledger shortages into per-line messages the buyer can act on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use crate::domain::aggregates::{cart, CartLine, Hold, HoldState};
use crate::domain::value_objects::{BuyerId, UnitId};
use crate::ledger::{LedgerError, Shortage, StockLedger};

/// A cart line the ledger could not cover.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineShortage {
    pub unit_id: UnitId,
    pub name: String,
    pub sku: String,
    pub requested: u32,
    /// Truly free stock for this buyer, including what the buyer already held.
    pub available: u32,
}

impl LineShortage {
    pub fn exceeded_by(&self) -> u32 { self.requested.saturating_sub(self.available) }
}

#[derive(Debug, Error)]
pub enum HoldError {
    #[error("requested quantity unavailable for {} line(s)", .0.len())]
    Unavailable(Vec<LineShortage>),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct HoldManager<L> {
    ledger: Arc<L>,
}

impl<L: StockLedger> HoldManager<L> {
    pub fn new(ledger: Arc<L>) -> Self { Self { ledger } }

    pub fn ledger(&self) -> &L { &self.ledger }

    /// Reserve the whole current cart, replacing the buyer's previous holds, and drop
    /// holds for units that left the cart. Nothing changes when the reserve fails.
    #[instrument(skip_all, fields(buyer = %buyer, lines = lines.len()))]
    pub async fn ensure_holds(&self, buyer: &BuyerId, lines: &[CartLine]) -> Result<Vec<Hold>, HoldError> {
        if lines.is_empty() {
            let released = self.ledger.release(buyer, None).await?;
            debug!(released, "Cart empty, holds released");
            return Ok(vec![]);
        }
        let requests = cart::hold_requests(lines);
        let holds = match self.ledger.reserve(buyer, &requests).await {
            Ok(holds) => holds,
            Err(LedgerError::InsufficientStock(shortages)) => {
                let lines = describe(&shortages, lines);
                info!(short = lines.len(), "Cart exceeds available stock");
                return Err(HoldError::Unavailable(lines));
            }
            Err(e) => return Err(e.into()),
        };

        let wanted: BTreeSet<UnitId> = requests.iter().map(|r| r.unit_id).collect();
        let stale: Vec<UnitId> = self.ledger.holds_for(buyer).await?
            .into_iter()
            .filter(|h| h.state == HoldState::Active && !wanted.contains(&h.unit_id))
            .map(|h| h.unit_id)
            .collect();
        if !stale.is_empty() {
            let released = self.ledger.release_units(buyer, &stale).await?;
            debug!(released, "Released holds for units no longer in cart");
        }
        Ok(holds)
    }
}

fn describe(shortages: &[Shortage], lines: &[CartLine]) -> Vec<LineShortage> {
    shortages.iter().map(|s| {
        let line = lines.iter().find(|l| l.unit_id == s.unit_id);
        LineShortage {
            unit_id: s.unit_id,
            name: line.map(|l| l.name.clone()).unwrap_or_default(),
            sku: line.map(|l| l.sku.clone()).unwrap_or_default(),
            requested: s.requested,
            available: s.available,
        }
    }).collect()
}
