//! Postgres ledger. A reserve is one transaction that locks the unit rows
//! `FOR UPDATE` in unit-id order, sums the competing holds, then writes.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use crate::clock::Clock;
use crate::domain::aggregates::{Availability, Hold, HoldRequest, HoldState};
use crate::domain::value_objects::{BuyerId, HoldId, OrderId, ProductId, UnitId, VariantId};
use super::{normalize, LedgerError, Shortage, StockLedger};

const HOLD_COLUMNS: &str = "id, buyer_id, unit_id, quantity, state, order_id, created_at, expires_at";

/// Holds that count against a unit at `$2`.
const COUNTED: &str = "((state = 'active' AND expires_at > $2) OR state = 'finalized')";

#[derive(Debug, sqlx::FromRow)]
struct HoldRow {
    id: Uuid,
    buyer_id: Uuid,
    unit_id: Uuid,
    quantity: i64,
    state: String,
    order_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<HoldRow> for Hold {
    type Error = LedgerError;

    fn try_from(row: HoldRow) -> Result<Self, Self::Error> {
        Ok(Hold {
            id: HoldId::from_uuid(row.id),
            buyer_id: BuyerId::from_uuid(row.buyer_id),
            unit_id: UnitId::from_uuid(row.unit_id),
            quantity: to_u32(row.quantity)?,
            state: HoldState::parse(&row.state).ok_or_else(|| LedgerError::Corrupt(format!("hold {} state {:?}", row.id, row.state)))?,
            order_id: row.order_id.map(OrderId::from_uuid),
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

fn to_u32(value: i64) -> Result<u32, LedgerError> {
    u32::try_from(value).map_err(|_| LedgerError::Corrupt(format!("quantity {value} out of range")))
}

pub struct PgLedger {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    hold_window: chrono::Duration,
}

impl PgLedger {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, hold_window: chrono::Duration) -> Self {
        Self { pool, clock, hold_window }
    }

    /// Lock the given unit rows in id order; returns `available_quantity` per unit.
    async fn lock_units(tx: &mut Transaction<'_, Postgres>, ids: &[Uuid]) -> Result<HashMap<Uuid, i64>, LedgerError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            "SELECT unit_id, available_quantity FROM stock_units WHERE unit_id = ANY($1) ORDER BY unit_id FOR UPDATE",
        )
        .bind(ids)
        .fetch_all(&mut **tx)
        .await?;
        let locked: HashMap<Uuid, i64> = rows.into_iter().collect();
        if let Some(missing) = ids.iter().find(|id| !locked.contains_key(*id)) {
            return Err(LedgerError::UnknownUnit(UnitId::from_uuid(*missing)));
        }
        Ok(locked)
    }

    async fn held(&self, unit: Uuid, now: DateTime<Utc>, executor: impl sqlx::PgExecutor<'_>) -> Result<i64, LedgerError> {
        let (held,): (i64,) = sqlx::query_as(&format!(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM holds WHERE unit_id = $1 AND {COUNTED}"
        ))
        .bind(unit)
        .bind(now)
        .fetch_one(executor)
        .await?;
        Ok(held)
    }
}

impl StockLedger for PgLedger {
    #[instrument(skip_all, fields(buyer = %buyer, lines = requests.len()))]
    async fn reserve(&self, buyer: &BuyerId, requests: &[HoldRequest]) -> Result<Vec<Hold>, LedgerError> {
        let batch = normalize(requests)?;
        let ids: Vec<Uuid> = batch.iter().map(|r| r.unit_id.as_uuid()).collect();
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let stock = Self::lock_units(&mut tx, &ids).await?;

        let others: HashMap<Uuid, i64> = sqlx::query_as::<_, (Uuid, i64)>(&format!(
            "SELECT unit_id, COALESCE(SUM(quantity), 0)::BIGINT FROM holds \
             WHERE unit_id = ANY($1) AND {COUNTED} AND NOT (buyer_id = $3 AND state = 'active') \
             GROUP BY unit_id"
        ))
        .bind(&ids)
        .bind(now)
        .bind(buyer.as_uuid())
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

        let mut shortages = vec![];
        for request in &batch {
            let id = request.unit_id.as_uuid();
            let free = stock.get(&id).copied().unwrap_or(0) - others.get(&id).copied().unwrap_or(0);
            let available = to_u32(free.max(0))?;
            if request.quantity > available {
                shortages.push(Shortage { unit_id: request.unit_id, requested: request.quantity, available });
            }
        }
        if !shortages.is_empty() {
            tx.rollback().await?;
            info!(short = shortages.len(), "Reservation rejected");
            return Err(LedgerError::InsufficientStock(shortages));
        }

        let expires_at = now + self.hold_window;
        let mut placed = Vec::with_capacity(batch.len());
        for request in &batch {
            let renewed: Option<HoldRow> = sqlx::query_as(&format!(
                "UPDATE holds SET quantity = $3, created_at = $4, expires_at = $5, updated_at = $4 \
                 WHERE buyer_id = $1 AND unit_id = $2 AND state = 'active' RETURNING {HOLD_COLUMNS}"
            ))
            .bind(buyer.as_uuid())
            .bind(request.unit_id.as_uuid())
            .bind(i64::from(request.quantity))
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&mut *tx)
            .await?;
            let row = match renewed {
                Some(row) => row,
                None => sqlx::query_as(&format!(
                    "INSERT INTO holds (id, buyer_id, unit_id, quantity, state, order_id, created_at, expires_at, updated_at) \
                     VALUES ($1, $2, $3, $4, 'active', NULL, $5, $6, $5) RETURNING {HOLD_COLUMNS}"
                ))
                .bind(HoldId::new().as_uuid())
                .bind(buyer.as_uuid())
                .bind(request.unit_id.as_uuid())
                .bind(i64::from(request.quantity))
                .bind(now)
                .bind(expires_at)
                .fetch_one(&mut *tx)
                .await?,
            };
            placed.push(Hold::try_from(row)?);
        }
        tx.commit().await?;
        Ok(placed)
    }

    #[instrument(skip_all, fields(buyer = %buyer, order = %order))]
    async fn finalize(&self, buyer: &BuyerId, order: &OrderId) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE holds SET state = 'finalized', order_id = $2, updated_at = $3 \
             WHERE buyer_id = $1 AND state = 'active' AND order_id IS NULL AND expires_at > $3",
        )
        .bind(buyer.as_uuid())
        .bind(order.as_uuid())
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all, fields(buyer = %buyer))]
    async fn release(&self, buyer: &BuyerId, order: Option<&OrderId>) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE holds SET state = 'released', updated_at = $2 \
             WHERE buyer_id = $1 AND state = 'active' AND expires_at > $2 \
             AND ($3::uuid IS NULL OR order_id IS NULL OR order_id = $3)",
        )
        .bind(buyer.as_uuid())
        .bind(self.clock.now())
        .bind(order.map(|o| o.as_uuid()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_units(&self, buyer: &BuyerId, units: &[UnitId]) -> Result<u64, LedgerError> {
        let ids: Vec<Uuid> = units.iter().map(UnitId::as_uuid).collect();
        let result = sqlx::query(
            "UPDATE holds SET state = 'released', updated_at = $2 \
             WHERE buyer_id = $1 AND state = 'active' AND expires_at > $2 AND unit_id = ANY($3)",
        )
        .bind(buyer.as_uuid())
        .bind(self.clock.now())
        .bind(&ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn sweep_expired(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query("UPDATE holds SET state = 'expired', updated_at = $1 WHERE state = 'active' AND expires_at <= $1")
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn availability(&self, unit: &UnitId) -> Result<Availability, LedgerError> {
        let now = self.clock.now();
        let available: Option<(i64,)> = sqlx::query_as("SELECT available_quantity FROM stock_units WHERE unit_id = $1")
            .bind(unit.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        let (available,) = available.ok_or(LedgerError::UnknownUnit(*unit))?;
        let held = self.held(unit.as_uuid(), now, &self.pool).await?;
        let available_quantity = to_u32(available)?;
        let held_quantity = to_u32(held)?;
        Ok(Availability { unit_id: *unit, available_quantity, held_quantity, free: available_quantity.saturating_sub(held_quantity) })
    }

    async fn holds_for(&self, buyer: &BuyerId) -> Result<Vec<Hold>, LedgerError> {
        let now = self.clock.now();
        let rows: Vec<HoldRow> = sqlx::query_as(&format!("SELECT {HOLD_COLUMNS} FROM holds WHERE buyer_id = $1 ORDER BY created_at"))
            .bind(buyer.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Hold::try_from(row).map(|mut hold| { hold.state = hold.effective_state(now); hold }))
            .collect()
    }

    #[instrument(skip_all, fields(unit = %unit))]
    async fn set_available(&self, unit: &UnitId, product: &ProductId, variant: Option<&VariantId>, quantity: u32) -> Result<Availability, LedgerError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO stock_units (unit_id, product_id, variant_id, available_quantity, updated_at) \
             VALUES ($1, $2, $3, 0, $4) ON CONFLICT (unit_id) DO NOTHING",
        )
        .bind(unit.as_uuid())
        .bind(product.as_uuid())
        .bind(variant.map(|v| v.as_uuid()))
        .bind(now)
        .execute(&mut *tx)
        .await?;
        Self::lock_units(&mut tx, &[unit.as_uuid()]).await?;
        let held = to_u32(self.held(unit.as_uuid(), now, &mut *tx).await?)?;
        if quantity < held {
            tx.rollback().await?;
            return Err(LedgerError::BelowHeld { unit_id: *unit, requested: quantity, held });
        }
        sqlx::query("UPDATE stock_units SET product_id = $2, variant_id = $3, available_quantity = $4, updated_at = $5 WHERE unit_id = $1")
            .bind(unit.as_uuid())
            .bind(product.as_uuid())
            .bind(variant.map(|v| v.as_uuid()))
            .bind(i64::from(quantity))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(available = quantity, held, "Stock level set");
        Ok(Availability { unit_id: *unit, available_quantity: quantity, held_quantity: held, free: quantity - held })
    }
}
