//! Stock Unit Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::domain::aggregates::hold::{Hold, HoldState};
use crate::domain::value_objects::{BuyerId, ProductId, UnitId, VariantId};

/// Physical stock of one product or variant together with the holds placed against it.
///
/// Owned by a ledger; nothing outside `crate::ledger` mutates it.
#[derive(Clone, Debug)]
pub struct StockUnit {
    pub unit_id: UnitId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub available_quantity: u32,
    pub holds: Vec<Hold>,
}

/// Read model of a unit's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub unit_id: UnitId,
    pub available_quantity: u32,
    pub held_quantity: u32,
    pub free: u32,
}

impl StockUnit {
    pub fn new(unit_id: UnitId, product_id: ProductId, variant_id: Option<VariantId>, available_quantity: u32) -> Self {
        Self { unit_id, product_id, variant_id, available_quantity, holds: vec![] }
    }

    /// Sum of live and finalized holds; lapsed holds never count.
    pub fn held_quantity(&self, now: DateTime<Utc>) -> u32 {
        self.holds.iter().filter(|h| h.is_counted(now)).map(|h| h.quantity).sum()
    }

    /// What `buyer` could hold right now: the buyer's own live hold is treated as free.
    pub fn effective_available(&self, buyer: &BuyerId, now: DateTime<Utc>) -> u32 {
        let others: u32 = self.holds.iter()
            .filter(|h| h.is_counted(now) && !(h.buyer_id == *buyer && h.state == HoldState::Active))
            .map(|h| h.quantity)
            .sum();
        self.available_quantity.saturating_sub(others)
    }

    pub fn active_hold_mut(&mut self, buyer: &BuyerId) -> Option<&mut Hold> {
        self.holds.iter_mut().find(|h| h.buyer_id == *buyer && h.state == HoldState::Active)
    }

    /// Forget released and expired holds; they no longer affect any counter.
    pub fn prune_settled(&mut self) {
        self.holds.retain(|h| matches!(h.state, HoldState::Active | HoldState::Finalized));
    }

    pub fn availability(&self, now: DateTime<Utc>) -> Availability {
        let held_quantity = self.held_quantity(now);
        Availability {
            unit_id: self.unit_id,
            available_quantity: self.available_quantity,
            held_quantity,
            free: self.available_quantity.saturating_sub(held_quantity),
        }
    }
}
