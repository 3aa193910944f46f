//! Hold Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::domain::value_objects::{BuyerId, HoldId, OrderId, UnitId};

/// A time-boxed reservation of one stock unit for one buyer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub buyer_id: BuyerId,
    pub unit_id: UnitId,
    pub quantity: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub order_id: Option<OrderId>,
    pub state: HoldState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldState { Active, Finalized, Released, Expired }

/// One line of a reserve batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldRequest {
    pub unit_id: UnitId,
    pub quantity: u32,
}

impl Hold {
    pub fn place(buyer_id: BuyerId, unit_id: UnitId, quantity: u32, now: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            id: HoldId::new(), buyer_id, unit_id, quantity,
            created_at: now, expires_at: now + window, order_id: None, state: HoldState::Active,
        }
    }

    /// Active and inside its window.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.state == HoldState::Active && self.expires_at > now
    }

    /// Whether this hold counts against availability: live holds and sold (finalized) stock.
    pub fn is_counted(&self, now: DateTime<Utc>) -> bool {
        self.is_live(now) || self.state == HoldState::Finalized
    }

    /// State as observed at `now`; an active hold past its window reads as expired
    /// whether or not the sweep has visited it.
    pub fn effective_state(&self, now: DateTime<Utc>) -> HoldState {
        match self.state {
            HoldState::Active if self.expires_at <= now => HoldState::Expired,
            state => state,
        }
    }

    /// Replace quantity and restart the window, keeping the hold's identity.
    pub fn renew(&mut self, quantity: u32, now: DateTime<Utc>, window: chrono::Duration) {
        self.quantity = quantity;
        self.created_at = now;
        self.expires_at = now + window;
    }

    /// Returns false when the hold was not live (already terminal or lapsed).
    pub fn finalize(&mut self, order_id: OrderId, now: DateTime<Utc>) -> bool {
        if !self.is_live(now) || self.order_id.is_some() { return false; }
        self.state = HoldState::Finalized;
        self.order_id = Some(order_id);
        true
    }

    pub fn release(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_live(now) { return false; }
        self.state = HoldState::Released;
        true
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.effective_state(now) != HoldState::Expired || self.state != HoldState::Active { return false; }
        self.state = HoldState::Expired;
        true
    }
}

impl HoldState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Finalized => "finalized",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "finalized" => Some(Self::Finalized),
            "released" => Some(Self::Released),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for HoldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}
