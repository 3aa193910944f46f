//! In-process ledger: one async mutex per unit, always locked in unit-id order.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument};
use crate::clock::Clock;
use crate::domain::aggregates::{Availability, Hold, HoldRequest, StockUnit};
use crate::domain::value_objects::{BuyerId, OrderId, ProductId, UnitId, VariantId};
use super::{normalize, LedgerError, Shortage, StockLedger};

type Slot = Arc<Mutex<StockUnit>>;

pub struct MemoryLedger {
    units: RwLock<BTreeMap<UnitId, Slot>>,
    clock: Arc<dyn Clock>,
    hold_window: chrono::Duration,
}

impl MemoryLedger {
    pub fn new(clock: Arc<dyn Clock>, hold_window: chrono::Duration) -> Self {
        Self { units: RwLock::new(BTreeMap::new()), clock, hold_window }
    }

    async fn slots(&self, ids: impl Iterator<Item = UnitId>) -> Result<Vec<Slot>, LedgerError> {
        let units = self.units.read().await;
        ids.map(|id| units.get(&id).cloned().ok_or(LedgerError::UnknownUnit(id))).collect()
    }

    async fn all_slots(&self) -> Vec<Slot> {
        self.units.read().await.values().cloned().collect()
    }

    /// Apply `f` to every hold of every unit, one unit lock at a time.
    async fn for_each_hold(&self, slots: Vec<Slot>, mut f: impl FnMut(&mut Hold) -> bool + Send) -> u64 {
        let mut changed = 0;
        for slot in slots {
            let mut unit = slot.lock().await;
            changed += unit.holds.iter_mut().map(|h| u64::from(f(h))).sum::<u64>();
        }
        changed
    }
}

impl StockLedger for MemoryLedger {
    #[instrument(skip_all, fields(buyer = %buyer, lines = requests.len()))]
    async fn reserve(&self, buyer: &BuyerId, requests: &[HoldRequest]) -> Result<Vec<Hold>, LedgerError> {
        let batch = normalize(requests)?;
        let slots = self.slots(batch.iter().map(|r| r.unit_id)).await?;
        let mut guards: Vec<OwnedMutexGuard<StockUnit>> = Vec::with_capacity(slots.len());
        for slot in slots {
            guards.push(slot.lock_owned().await);
        }
        let now = self.clock.now();

        let shortages: Vec<Shortage> = batch.iter().zip(guards.iter())
            .filter_map(|(request, unit)| {
                let available = unit.effective_available(buyer, now);
                (request.quantity > available).then_some(Shortage { unit_id: request.unit_id, requested: request.quantity, available })
            })
            .collect();
        if !shortages.is_empty() {
            info!(short = shortages.len(), "Reservation rejected");
            return Err(LedgerError::InsufficientStock(shortages));
        }

        let mut placed = Vec::with_capacity(batch.len());
        for (request, unit) in batch.iter().zip(guards.iter_mut()) {
            let hold = match unit.active_hold_mut(buyer) {
                Some(existing) => {
                    existing.renew(request.quantity, now, self.hold_window);
                    existing.clone()
                }
                None => {
                    let hold = Hold::place(*buyer, request.unit_id, request.quantity, now, self.hold_window);
                    unit.holds.push(hold.clone());
                    hold
                }
            };
            placed.push(hold);
        }
        debug!(holds = placed.len(), "Holds placed");
        Ok(placed)
    }

    #[instrument(skip_all, fields(buyer = %buyer, order = %order))]
    async fn finalize(&self, buyer: &BuyerId, order: &OrderId) -> Result<u64, LedgerError> {
        let now = self.clock.now();
        let slots = self.all_slots().await;
        Ok(self.for_each_hold(slots, |h| h.buyer_id == *buyer && h.finalize(*order, now)).await)
    }

    #[instrument(skip_all, fields(buyer = %buyer))]
    async fn release(&self, buyer: &BuyerId, order: Option<&OrderId>) -> Result<u64, LedgerError> {
        let now = self.clock.now();
        let order = order.copied();
        let slots = self.all_slots().await;
        Ok(self.for_each_hold(slots, |h| {
            let in_scope = match order {
                None => true,
                Some(order) => h.order_id.map_or(true, |linked| linked == order),
            };
            h.buyer_id == *buyer && in_scope && h.release(now)
        }).await)
    }

    async fn release_units(&self, buyer: &BuyerId, units: &[UnitId]) -> Result<u64, LedgerError> {
        let now = self.clock.now();
        let mut ids = units.to_vec();
        ids.sort();
        ids.dedup();
        let known = self.units.read().await;
        let slots: Vec<Slot> = ids.iter().filter_map(|id| known.get(id).cloned()).collect();
        drop(known);
        Ok(self.for_each_hold(slots, |h| h.buyer_id == *buyer && h.release(now)).await)
    }

    /// Expires lapsed holds, then drops released and expired ones; only live and
    /// sold holds stay on the unit.
    async fn sweep_expired(&self) -> Result<u64, LedgerError> {
        let now = self.clock.now();
        let mut expired = 0;
        for slot in self.all_slots().await {
            let mut unit = slot.lock().await;
            expired += unit.holds.iter_mut().map(|h| u64::from(h.expire(now))).sum::<u64>();
            unit.prune_settled();
        }
        Ok(expired)
    }

    async fn availability(&self, unit: &UnitId) -> Result<Availability, LedgerError> {
        let slot = self.slots(std::iter::once(*unit)).await?.remove(0);
        let now = self.clock.now();
        let guard = slot.lock().await;
        Ok(guard.availability(now))
    }

    async fn holds_for(&self, buyer: &BuyerId) -> Result<Vec<Hold>, LedgerError> {
        let now = self.clock.now();
        let mut holds = vec![];
        for slot in self.all_slots().await {
            let unit = slot.lock().await;
            holds.extend(unit.holds.iter().filter(|h| h.buyer_id == *buyer).map(|h| {
                let mut view = h.clone();
                view.state = h.effective_state(now);
                view
            }));
        }
        Ok(holds)
    }

    #[instrument(skip_all, fields(unit = %unit))]
    async fn set_available(&self, unit: &UnitId, product: &ProductId, variant: Option<&VariantId>, quantity: u32) -> Result<Availability, LedgerError> {
        let existing = self.units.read().await.get(unit).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut units = self.units.write().await;
                units.entry(*unit)
                    .or_insert_with(|| Arc::new(Mutex::new(StockUnit::new(*unit, *product, variant.copied(), 0))))
                    .clone()
            }
        };
        let now = self.clock.now();
        let mut stock = slot.lock().await;
        let held = stock.held_quantity(now);
        if quantity < held {
            return Err(LedgerError::BelowHeld { unit_id: *unit, requested: quantity, held });
        }
        stock.product_id = *product;
        stock.variant_id = variant.copied();
        stock.available_quantity = quantity;
        info!(available = quantity, held, "Stock level set");
        Ok(stock.availability(now))
    }
}
