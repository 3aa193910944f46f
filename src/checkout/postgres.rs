//! Postgres order store. A commit is one transaction over orders, order_items,
//! deliveries and payments.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::{error, instrument};
use uuid::Uuid;
use crate::domain::aggregates::{
    AddressSnapshot, CouponSnapshot, DeliveryRecord, DeliveryStatus, Order, OrderError, OrderLineItem, OrderRecord,
    OrderStatus, OrderTotals, PaymentMethod, PaymentRecord, PaymentStatus,
};
use crate::domain::value_objects::{BundleId, BuyerId, OrderId, OrderNumber, ProductId, UnitId, VariantId};
use super::store::{check_complete, CheckoutStore, StoreError};

const ORDER_COLUMNS: &str = "id, order_number, buyer_id, status, payment_status, payment_method, currency, \
    subtotal, discount_total, shipping_charge, total, shipping_address, coupon, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    buyer_id: Uuid,
    status: String,
    payment_status: String,
    payment_method: String,
    currency: String,
    subtotal: Decimal,
    discount_total: Decimal,
    shipping_charge: Decimal,
    total: Decimal,
    shipping_address: Json<AddressSnapshot>,
    coupon: Option<Json<CouponSnapshot>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    unit_id: Uuid,
    product_id: Uuid,
    variant_id: Option<Uuid>,
    name: String,
    sku: String,
    unit_price: Decimal,
    quantity: i64,
    line_total: Decimal,
    discount: Decimal,
    bundle_id: Option<Uuid>,
    bundle_name: Option<String>,
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    status: String,
    cod_amount: Option<Decimal>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    method: String,
    amount: Decimal,
    status: String,
    reference: Option<String>,
    failure_reason: Option<String>,
    updated_at: DateTime<Utc>,
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Corrupt(format!("{what} {value:?}"))
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let method = PaymentMethod::parse(&row.payment_method).ok_or_else(|| corrupt("payment method", &row.payment_method))?;
        let totals = OrderTotals { subtotal: row.subtotal, discount_total: row.discount_total, shipping_charge: row.shipping_charge, total: row.total };
        let mut order = Order::create(
            OrderNumber::from_string(row.order_number), BuyerId::from_uuid(row.buyer_id), method, &row.currency,
            totals, row.shipping_address.0, row.coupon.map(|c| c.0), row.created_at,
        );
        order.id = OrderId::from_uuid(row.id);
        order.status = OrderStatus::parse(&row.status).ok_or_else(|| corrupt("order status", &row.status))?;
        order.payment_status = PaymentStatus::parse(&row.payment_status).ok_or_else(|| corrupt("payment status", &row.payment_status))?;
        order.updated_at = row.updated_at;
        Ok(order)
    }
}

pub struct PgCheckoutStore {
    pool: PgPool,
}

impl PgCheckoutStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    async fn upsert_payment(conn: &mut PgConnection, payment: &PaymentRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO payments (order_id, method, amount, status, reference, failure_reason, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
             ON CONFLICT (order_id) DO UPDATE SET amount = EXCLUDED.amount, status = EXCLUDED.status, \
             reference = EXCLUDED.reference, failure_reason = EXCLUDED.failure_reason, updated_at = EXCLUDED.updated_at",
        )
        .bind(payment.order_id.as_uuid())
        .bind(payment.method.as_str())
        .bind(payment.amount)
        .bind(payment.status.as_str())
        .bind(&payment.reference)
        .bind(&payment.failure_reason)
        .bind(payment.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn write(conn: &mut PgConnection, record: &OrderRecord) -> Result<(), sqlx::Error> {
        let order = &record.order;
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(order.id.as_uuid())
        .bind(order.order_number.as_str())
        .bind(order.buyer_id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.payment_method.as_str())
        .bind(&order.currency)
        .bind(order.subtotal)
        .bind(order.discount_total)
        .bind(order.shipping_charge)
        .bind(order.total)
        .bind(Json(&order.shipping_address))
        .bind(order.coupon.as_ref().map(Json))
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *conn)
        .await?;

        for (position, item) in record.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (order_id, position, unit_id, product_id, variant_id, name, sku, unit_price, \
                 quantity, line_total, discount, bundle_id, bundle_name) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(order.id.as_uuid())
            .bind(position as i32)
            .bind(item.unit_id.as_uuid())
            .bind(item.product_id.as_uuid())
            .bind(item.variant_id.map(|v| v.as_uuid()))
            .bind(&item.name)
            .bind(&item.sku)
            .bind(item.unit_price)
            .bind(i64::from(item.quantity))
            .bind(item.line_total)
            .bind(item.discount)
            .bind(item.bundle_id.map(|b| b.as_uuid()))
            .bind(&item.bundle_name)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query("INSERT INTO deliveries (order_id, status, cod_amount, created_at, updated_at) VALUES ($1, $2, $3, $4, $4)")
            .bind(order.id.as_uuid())
            .bind(record.delivery.status.as_str())
            .bind(record.delivery.cod_amount)
            .bind(record.delivery.updated_at)
            .execute(&mut *conn)
            .await?;

        if let Some(payment) = &record.payment {
            Self::upsert_payment(conn, payment).await?;
        }
        Ok(())
    }
}

impl CheckoutStore for PgCheckoutStore {
    #[instrument(skip_all, fields(order = %record.order.id))]
    async fn commit(&self, record: &OrderRecord) -> Result<(), StoreError> {
        check_complete(record)?;
        let mut tx = self.pool.begin().await?;
        if let Err(e) = Self::write(&mut tx, record).await {
            // dropping the transaction rolls back every row written so far
            if e.as_database_error().is_some_and(|d| d.is_unique_violation() && d.constraint() == Some("orders_order_number_key")) {
                return Err(StoreError::DuplicateOrderNumber(record.order.order_number.clone()));
            }
            error!(error = %e, "Order commit failed");
            return Err(e.into());
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, order_id: &OrderId) -> Result<Option<OrderRecord>, StoreError> {
        let order_id = *order_id;
        let id = order_id.as_uuid();
        let row: Option<OrderRow> = sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let order = Order::try_from(row)?;

        let items = sqlx::query_as::<_, ItemRow>(
            "SELECT unit_id, product_id, variant_id, name, sku, unit_price, quantity, line_total, discount, bundle_id, bundle_name \
             FROM order_items WHERE order_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Ok(OrderLineItem {
            order_id,
            unit_id: UnitId::from_uuid(row.unit_id),
            product_id: ProductId::from_uuid(row.product_id),
            variant_id: row.variant_id.map(VariantId::from_uuid),
            name: row.name,
            sku: row.sku,
            unit_price: row.unit_price,
            quantity: u32::try_from(row.quantity).map_err(|_| corrupt("quantity", &row.quantity.to_string()))?,
            line_total: row.line_total,
            discount: row.discount,
            bundle_id: row.bundle_id.map(BundleId::from_uuid),
            bundle_name: row.bundle_name,
        }))
        .collect::<Result<Vec<_>, StoreError>>()?;

        let delivery: DeliveryRow = sqlx::query_as("SELECT status, cod_amount, updated_at FROM deliveries WHERE order_id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        let delivery = DeliveryRecord {
            order_id,
            status: DeliveryStatus::parse(&delivery.status).ok_or_else(|| corrupt("delivery status", &delivery.status))?,
            cod_amount: delivery.cod_amount,
            updated_at: delivery.updated_at,
        };

        let payment: Option<PaymentRow> = sqlx::query_as(
            "SELECT method, amount, status, reference, failure_reason, updated_at FROM payments WHERE order_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let payment = payment.map(|p| -> Result<PaymentRecord, StoreError> {
            Ok(PaymentRecord {
                order_id,
                method: PaymentMethod::parse(&p.method).ok_or_else(|| corrupt("payment method", &p.method))?,
                amount: p.amount,
                status: PaymentStatus::parse(&p.status).ok_or_else(|| corrupt("payment status", &p.status))?,
                reference: p.reference,
                failure_reason: p.failure_reason,
                updated_at: p.updated_at,
            })
        }).transpose()?;

        Ok(Some(OrderRecord { order, items, delivery, payment }))
    }

    async fn update_order<F>(&self, order: &OrderId, apply: F) -> Result<Order, StoreError>
    where
        F: FnOnce(&mut Order) -> Result<Option<PaymentRecord>, OrderError> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row: Option<OrderRow> = sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"))
            .bind(order.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let mut current = Order::try_from(row.ok_or(StoreError::NotFound(*order))?)?;
        let payment = apply(&mut current)?;
        sqlx::query("UPDATE orders SET status = $2, payment_status = $3, updated_at = $4 WHERE id = $1")
            .bind(current.id.as_uuid())
            .bind(current.status.as_str())
            .bind(current.payment_status.as_str())
            .bind(current.updated_at)
            .execute(&mut *tx)
            .await?;
        if let Some(payment) = &payment {
            Self::upsert_payment(&mut tx, payment).await?;
        }
        tx.commit().await?;
        Ok(current)
    }

    async fn clear_cart(&self, buyer: &BuyerId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cart_items WHERE buyer_id = $1")
            .bind(buyer.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
