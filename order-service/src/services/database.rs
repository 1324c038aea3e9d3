//! PostgreSQL-backed store for order-service.
//!
//! Stock holds, coupon counters and order status changes are conditional
//! updates (`WHERE stock >= $q`, `WHERE used_count < usage_limit`,
//! `WHERE status = $from`). Multi-row changes run in one transaction and
//! touch variant rows in key order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{CouponError, OrderError};
use crate::models::{
    Address, Coupon, NewTrackingStep, Order, OrderItem, OrderStatus, Payment, PaymentMethod,
    ProductVariant, ReservationLine, ReservationState, ReservationToken, TrackingStep,
    TransitionUpdate, VariantKey,
};
use crate::services::metrics::QueryTimer;
use crate::services::store::{CouponStore, OrderRepository, StockLedger};

macro_rules! order_columns {
    () => {
        "order_id, user_id, status, payment_method, subtotal, discount_amount, total_amount, \
         coupon_code, coupon_redeemed, shipping_address, reservation_id, awb, \
         cancellation_reason, return_reason, expires_utc, delivered_utc, created_utc, updated_utc"
    };
}

macro_rules! payment_columns {
    () => {
        "payment_id, order_id, status, method, amount, currency, gateway_order_id, \
         gateway_payment_id, gateway_signature, refund_id, paid_utc, created_utc, updated_utc"
    };
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> OrderError {
    move |e| OrderError::Storage(AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e)))
}

#[derive(FromRow)]
struct OrderRow {
    order_id: Uuid,
    user_id: String,
    status: OrderStatus,
    payment_method: PaymentMethod,
    subtotal: Decimal,
    discount_amount: Decimal,
    total_amount: Decimal,
    coupon_code: Option<String>,
    coupon_redeemed: bool,
    shipping_address: Json<Address>,
    reservation_id: Uuid,
    awb: Option<String>,
    cancellation_reason: Option<String>,
    return_reason: Option<String>,
    expires_utc: Option<DateTime<Utc>>,
    delivered_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Order {
        Order {
            order_id: self.order_id,
            user_id: self.user_id,
            status: self.status,
            payment_method: self.payment_method,
            subtotal: self.subtotal,
            discount_amount: self.discount_amount,
            total_amount: self.total_amount,
            coupon_code: self.coupon_code,
            coupon_redeemed: self.coupon_redeemed,
            shipping_address: self.shipping_address.0,
            reservation_id: self.reservation_id,
            awb: self.awb,
            cancellation_reason: self.cancellation_reason,
            return_reason: self.return_reason,
            expires_utc: self.expires_utc,
            delivered_utc: self.delivered_utc,
            created_utc: self.created_utc,
            updated_utc: self.updated_utc,
            items,
        }
    }
}

#[derive(FromRow)]
struct ItemRow {
    order_id: Uuid,
    #[sqlx(flatten)]
    variant: VariantKey,
    product_name: String,
    quantity: i32,
    unit_price: Decimal,
}

impl From<ItemRow> for OrderItem {
    fn from(row: ItemRow) -> Self {
        OrderItem {
            order_id: row.order_id,
            variant: row.variant,
            product_name: row.product_name,
            quantity: row.quantity,
            unit_price: row.unit_price,
        }
    }
}

#[derive(FromRow)]
struct LineRow {
    #[sqlx(flatten)]
    variant: VariantKey,
    quantity: i32,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "order-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Catalog seeding
    // -------------------------------------------------------------------------

    /// Insert a variant or overwrite its name, price and stock.
    #[instrument(skip(self, variant), fields(variant = %variant.key))]
    pub async fn upsert_variant(&self, variant: &ProductVariant) -> Result<(), OrderError> {
        sqlx::query(
            r#"
            INSERT INTO product_variants (product_id, size, color, batch_no, product_name, price, stock)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (product_id, size, color, batch_no)
            DO UPDATE SET product_name = EXCLUDED.product_name,
                          price = EXCLUDED.price,
                          stock = EXCLUDED.stock,
                          updated_utc = NOW()
            "#,
        )
        .bind(variant.key.product_id)
        .bind(&variant.key.size)
        .bind(&variant.key.color)
        .bind(&variant.key.batch_no)
        .bind(&variant.product_name)
        .bind(variant.price)
        .bind(variant.stock)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to upsert variant"))?;
        Ok(())
    }

    #[instrument(skip(self, coupon), fields(code = %coupon.code))]
    pub async fn upsert_coupon(&self, coupon: &Coupon) -> Result<(), OrderError> {
        sqlx::query(
            r#"
            INSERT INTO coupons (code, discount_type, value, min_amount, max_discount,
                                 valid_from, valid_to, usage_limit, used_count, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (code)
            DO UPDATE SET discount_type = EXCLUDED.discount_type,
                          value = EXCLUDED.value,
                          min_amount = EXCLUDED.min_amount,
                          max_discount = EXCLUDED.max_discount,
                          valid_from = EXCLUDED.valid_from,
                          valid_to = EXCLUDED.valid_to,
                          usage_limit = EXCLUDED.usage_limit,
                          is_active = EXCLUDED.is_active
            "#,
        )
        .bind(Coupon::normalize_code(&coupon.code))
        .bind(coupon.discount_type.as_str())
        .bind(coupon.value)
        .bind(coupon.min_amount)
        .bind(coupon.max_discount)
        .bind(coupon.valid_from)
        .bind(coupon.valid_to)
        .bind(coupon.usage_limit)
        .bind(coupon.used_count)
        .bind(coupon.is_active)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to upsert coupon"))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, OrderError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT order_id, product_id, size, color, batch_no, product_name, quantity, unit_price
            FROM order_items
            WHERE order_id = $1
            ORDER BY product_id, size, color, batch_no
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load order items"))?;

        Ok(rows.into_iter().map(OrderItem::from).collect())
    }

}

#[derive(FromRow)]
struct LockedOrder {
    status: OrderStatus,
    coupon_code: Option<String>,
    coupon_redeemed: bool,
    reservation_id: Uuid,
}

async fn lock_order(
    conn: &mut PgConnection,
    order_id: Uuid,
) -> Result<LockedOrder, OrderError> {
    sqlx::query_as::<_, LockedOrder>(
        r#"
        SELECT status, coupon_code, coupon_redeemed, reservation_id
        FROM orders
        WHERE order_id = $1
        FOR UPDATE
        "#,
    )
    .bind(order_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to lock order"))?
    .ok_or(OrderError::OrderNotFound(order_id))
}

/// Return held or committed quantities to stock inside the caller's transaction.
async fn release_reservation(
    conn: &mut PgConnection,
    reservation_id: Uuid,
) -> Result<(), OrderError> {
    let update = match lock_reservation(&mut *conn, reservation_id).await? {
        ReservationState::Released => return Ok(()),
        ReservationState::Held => {
            "UPDATE product_variants
             SET stock = stock + $5, reserved = GREATEST(reserved - $5, 0), updated_utc = NOW()
             WHERE product_id = $1 AND size = $2 AND color = $3 AND batch_no = $4"
        }
        ReservationState::Committed => {
            "UPDATE product_variants
             SET stock = stock + $5, sold_count = GREATEST(sold_count - $5, 0), updated_utc = NOW()
             WHERE product_id = $1 AND size = $2 AND color = $3 AND batch_no = $4"
        }
    };

    for line in reservation_lines(&mut *conn, reservation_id).await? {
        sqlx::query(update)
            .bind(line.variant.product_id)
            .bind(&line.variant.size)
            .bind(&line.variant.color)
            .bind(&line.variant.batch_no)
            .bind(i64::from(line.quantity))
            .execute(&mut *conn)
            .await
            .map_err(db_error("Failed to release stock"))?;
    }

    set_reservation_state(conn, reservation_id, ReservationState::Released).await
}

async fn return_coupon_use(conn: &mut PgConnection, code: &str) -> Result<(), OrderError> {
    sqlx::query("UPDATE coupons SET used_count = GREATEST(used_count - 1, 0) WHERE code = $1")
        .bind(Coupon::normalize_code(code))
        .execute(conn)
        .await
        .map_err(db_error("Failed to unredeem coupon"))?;
    Ok(())
}

async fn reservation_lines(
    conn: &mut PgConnection,
    reservation_id: Uuid,
) -> Result<Vec<ReservationLine>, OrderError> {
    let rows = sqlx::query_as::<_, LineRow>(
        r#"
        SELECT product_id, size, color, batch_no, quantity
        FROM reservation_lines
        WHERE reservation_id = $1
        ORDER BY product_id, size, color, batch_no
        "#,
    )
    .bind(reservation_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to load reservation lines"))?;

    Ok(rows
        .into_iter()
        .map(|row| ReservationLine {
            variant: row.variant,
            quantity: row.quantity,
        })
        .collect())
}

async fn lock_reservation(
    conn: &mut PgConnection,
    reservation_id: Uuid,
) -> Result<ReservationState, OrderError> {
    let state: Option<ReservationState> = sqlx::query_scalar(
        "SELECT state FROM reservations WHERE reservation_id = $1 FOR UPDATE",
    )
    .bind(reservation_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to lock reservation"))?;

    state.ok_or_else(|| {
        OrderError::Storage(AppError::NotFound(anyhow::anyhow!(
            "Reservation {} not found",
            reservation_id
        )))
    })
}

async fn set_reservation_state(
    conn: &mut PgConnection,
    reservation_id: Uuid,
    state: ReservationState,
) -> Result<(), OrderError> {
    sqlx::query(
        "UPDATE reservations SET state = $2, updated_utc = NOW() WHERE reservation_id = $1",
    )
    .bind(reservation_id)
    .bind(state.as_str())
    .execute(conn)
    .await
    .map_err(db_error("Failed to update reservation"))?;
    Ok(())
}

#[async_trait]
impl StockLedger for Database {
    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn get_variants(&self, keys: &[VariantKey]) -> Result<Vec<ProductVariant>, OrderError> {
        let timer = QueryTimer::start("get_variants");
        let mut variants = Vec::with_capacity(keys.len());

        for key in keys {
            let variant = sqlx::query_as::<_, ProductVariant>(
                r#"
                SELECT product_id, size, color, batch_no, product_name, price, stock, reserved, sold_count
                FROM product_variants
                WHERE product_id = $1 AND size = $2 AND color = $3 AND batch_no = $4
                "#,
            )
            .bind(key.product_id)
            .bind(&key.size)
            .bind(&key.color)
            .bind(&key.batch_no)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load variant"))?;

            variants.extend(variant);
        }

        timer.observe_duration();
        Ok(variants)
    }

    #[instrument(skip(self, lines), fields(order_id = %order_id))]
    async fn reserve(
        &self,
        order_id: Uuid,
        lines: &[ReservationLine],
    ) -> Result<ReservationToken, OrderError> {
        let lines = ReservationLine::consolidate(lines);
        if lines.is_empty() {
            return Err(OrderError::EmptyCart);
        }
        if let Some(line) = lines.iter().find(|l| l.quantity <= 0) {
            return Err(OrderError::Invalid(format!(
                "Quantity for variant {} must be positive",
                line.variant
            )));
        }

        let timer = QueryTimer::start("reserve");
        let reservation_id = Uuid::new_v4();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin reservation"))?;

        sqlx::query(
            "INSERT INTO reservations (reservation_id, order_id, state) VALUES ($1, $2, $3)",
        )
        .bind(reservation_id)
        .bind(order_id)
        .bind(ReservationState::Held.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to create reservation"))?;

        for line in &lines {
            let held = sqlx::query(
                r#"
                UPDATE product_variants
                SET stock = stock - $5, reserved = reserved + $5, updated_utc = NOW()
                WHERE product_id = $1 AND size = $2 AND color = $3 AND batch_no = $4
                  AND stock >= $5
                "#,
            )
            .bind(line.variant.product_id)
            .bind(&line.variant.size)
            .bind(&line.variant.color)
            .bind(&line.variant.batch_no)
            .bind(i64::from(line.quantity))
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to reserve stock"))?;

            if held.rows_affected() == 0 {
                tx.rollback()
                    .await
                    .map_err(db_error("Failed to roll back reservation"))?;
                warn!(variant = %line.variant, quantity = line.quantity, "Insufficient stock");
                return Err(OrderError::InsufficientStock(line.variant.clone()));
            }

            sqlx::query(
                r#"
                INSERT INTO reservation_lines (reservation_id, product_id, size, color, batch_no, quantity)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(reservation_id)
            .bind(line.variant.product_id)
            .bind(&line.variant.size)
            .bind(&line.variant.color)
            .bind(&line.variant.batch_no)
            .bind(line.quantity)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to record reservation line"))?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit reservation"))?;
        timer.observe_duration();

        Ok(ReservationToken {
            reservation_id,
            order_id,
            lines,
        })
    }

    #[instrument(skip(self, token), fields(reservation_id = %token.reservation_id))]
    async fn release(&self, token: &ReservationToken) -> Result<(), OrderError> {
        let timer = QueryTimer::start("release");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin release"))?;

        release_reservation(&mut *tx, token.reservation_id).await?;
        tx.commit()
            .await
            .map_err(db_error("Failed to commit release"))?;
        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self, token), fields(reservation_id = %token.reservation_id))]
    async fn commit(&self, token: &ReservationToken) -> Result<(), OrderError> {
        let timer = QueryTimer::start("commit");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin commit"))?;

        match lock_reservation(&mut *tx, token.reservation_id).await? {
            ReservationState::Committed => return Ok(()),
            ReservationState::Released => {
                return Err(OrderError::ReservationReleased(token.reservation_id))
            }
            ReservationState::Held => {}
        }

        for line in reservation_lines(&mut *tx, token.reservation_id).await? {
            sqlx::query(
                r#"
                UPDATE product_variants
                SET reserved = GREATEST(reserved - $5, 0), sold_count = sold_count + $5, updated_utc = NOW()
                WHERE product_id = $1 AND size = $2 AND color = $3 AND batch_no = $4
                "#,
            )
            .bind(line.variant.product_id)
            .bind(&line.variant.size)
            .bind(&line.variant.color)
            .bind(&line.variant.batch_no)
            .bind(i64::from(line.quantity))
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to commit stock"))?;
        }

        set_reservation_state(&mut *tx, token.reservation_id, ReservationState::Committed).await?;
        tx.commit()
            .await
            .map_err(db_error("Failed to commit reservation state"))?;
        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<ReservationToken>, OrderError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;

        let order_id: Option<Uuid> =
            sqlx::query_scalar("SELECT order_id FROM reservations WHERE reservation_id = $1")
                .bind(reservation_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_error("Failed to load reservation"))?;

        let Some(order_id) = order_id else {
            return Ok(None);
        };
        let lines = reservation_lines(&mut *conn, reservation_id).await?;

        Ok(Some(ReservationToken {
            reservation_id,
            order_id,
            lines,
        }))
    }
}

#[async_trait]
impl CouponStore for Database {
    #[instrument(skip(self))]
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, OrderError> {
        let timer = QueryTimer::start("find_coupon");
        let coupon = sqlx::query_as::<_, Coupon>(
            r#"
            SELECT code, discount_type, value, min_amount, max_discount, valid_from, valid_to,
                   usage_limit, used_count, is_active
            FROM coupons
            WHERE code = $1
            "#,
        )
        .bind(Coupon::normalize_code(code))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load coupon"))?;
        timer.observe_duration();

        Ok(coupon)
    }

    #[instrument(skip(self))]
    async fn redeem(&self, code: &str) -> Result<(), OrderError> {
        let code = Coupon::normalize_code(code);
        let timer = QueryTimer::start("redeem_coupon");
        let redeemed = sqlx::query(
            r#"
            UPDATE coupons
            SET used_count = used_count + 1
            WHERE code = $1 AND used_count < usage_limit
            "#,
        )
        .bind(&code)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to redeem coupon"))?;
        timer.observe_duration();

        if redeemed.rows_affected() == 1 {
            return Ok(());
        }

        match self.find_coupon(&code).await? {
            Some(_) => Err(CouponError::LimitReached(code).into()),
            None => Err(CouponError::NotFound(code).into()),
        }
    }

    #[instrument(skip(self))]
    async fn unredeem(&self, code: &str) -> Result<(), OrderError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;
        return_coupon_use(&mut *conn, code).await
    }
}

#[async_trait]
impl OrderRepository for Database {
    #[instrument(skip(self, order, payment), fields(order_id = %order.order_id))]
    async fn insert_order(&self, order: &Order, payment: &Payment) -> Result<(), OrderError> {
        let timer = QueryTimer::start("insert_order");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin order insert"))?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_id, user_id, status, payment_method, subtotal, discount_amount,
                                total_amount, coupon_code, coupon_redeemed, shipping_address,
                                reservation_id, expires_utc, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(order.order_id)
        .bind(&order.user_id)
        .bind(order.status.as_str())
        .bind(order.payment_method.as_str())
        .bind(order.subtotal)
        .bind(order.discount_amount)
        .bind(order.total_amount)
        .bind(&order.coupon_code)
        .bind(order.coupon_redeemed)
        .bind(Json(&order.shipping_address))
        .bind(order.reservation_id)
        .bind(order.expires_utc)
        .bind(order.created_utc)
        .bind(order.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                OrderError::Storage(AppError::Conflict(anyhow::anyhow!(
                    "Order {} already exists",
                    order.order_id
                )))
            }
            _ => OrderError::Storage(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to insert order: {}",
                e
            ))),
        })?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, product_id, size, color, batch_no, product_name, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(order.order_id)
            .bind(item.variant.product_id)
            .bind(&item.variant.size)
            .bind(&item.variant.color)
            .bind(&item.variant.batch_no)
            .bind(&item.product_name)
            .bind(item.quantity)
            .bind(item.unit_price)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert order item"))?;
        }

        sqlx::query(
            r#"
            INSERT INTO payments (payment_id, order_id, status, method, amount, currency,
                                  gateway_order_id, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(payment.payment_id)
        .bind(payment.order_id)
        .bind(payment.status.as_str())
        .bind(payment.method.as_str())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.gateway_order_id)
        .bind(payment.created_utc)
        .bind(payment.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to insert payment"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit order insert"))?;
        timer.observe_duration();

        info!(status = %order.status, "Order persisted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, OrderError> {
        let timer = QueryTimer::start("get_order");
        let row = sqlx::query_as::<_, OrderRow>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load order"))?;

        let order = match row {
            Some(row) => Some(row.into_order(self.order_items(order_id).await?)),
            None => None,
        };
        timer.observe_duration();

        Ok(order)
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, order_id: Uuid) -> Result<Option<Payment>, OrderError> {
        sqlx::query_as::<_, Payment>(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payments WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load payment"))
    }

    #[instrument(skip(self, update), fields(from = %from, to = %to))]
    async fn transition(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        update: &TransitionUpdate,
    ) -> Result<Option<Order>, OrderError> {
        let timer = QueryTimer::start("transition");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transition"))?;

        let locked = lock_order(&mut *tx, order_id).await?;
        if locked.status != from {
            return Ok(None);
        }
        if !to.closes_refund() {
            let refunding: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM payments WHERE order_id = $1 AND status = 'refunding')",
            )
            .bind(order_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("Failed to check refund state"))?;
            if refunding {
                return Ok(None);
            }
        }

        if update.release_stock {
            release_reservation(&mut *tx, locked.reservation_id).await?;
        }
        if update.return_coupon && locked.coupon_redeemed {
            if let Some(code) = locked.coupon_code.as_deref() {
                return_coupon_use(&mut *tx, code).await?;
            }
        }

        let row = sqlx::query_as::<_, OrderRow>(concat!(
            r#"
            UPDATE orders
            SET status = $2,
                coupon_redeemed = CASE WHEN $8 THEN FALSE ELSE COALESCE($3, coupon_redeemed) END,
                awb = COALESCE($4, awb),
                cancellation_reason = COALESCE($5, cancellation_reason),
                return_reason = COALESCE($6, return_reason),
                delivered_utc = COALESCE($7, delivered_utc),
                updated_utc = NOW()
            WHERE order_id = $1
            RETURNING "#,
            order_columns!()
        ))
        .bind(order_id)
        .bind(to.as_str())
        .bind(update.coupon_redeemed)
        .bind(&update.awb)
        .bind(&update.cancellation_reason)
        .bind(&update.return_reason)
        .bind(update.delivered_utc)
        .bind(update.return_coupon)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to transition order"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transition"))?;
        timer.observe_duration();

        Ok(Some(row.into_order(self.order_items(order_id).await?)))
    }

    #[instrument(skip(self, gateway_signature))]
    async fn mark_payment_paid(
        &self,
        order_id: Uuid,
        gateway_payment_id: &str,
        gateway_signature: &str,
        paid_utc: DateTime<Utc>,
    ) -> Result<bool, OrderError> {
        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'paid', gateway_payment_id = $2, gateway_signature = $3,
                paid_utc = $4, updated_utc = NOW()
            WHERE order_id = $1 AND status = 'pending'
            "#,
        )
        .bind(order_id)
        .bind(gateway_payment_id)
        .bind(gateway_signature)
        .bind(paid_utc)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark payment paid"))?;

        Ok(updated.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn claim_refund(
        &self,
        order_id: Uuid,
        order_status: OrderStatus,
    ) -> Result<bool, OrderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin refund claim"))?;

        // Same row lock as `transition`, so a fulfilment step cannot slip in.
        if lock_order(&mut *tx, order_id).await?.status != order_status {
            return Ok(false);
        }

        let claimed = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'refunding', updated_utc = NOW()
            WHERE order_id = $1 AND status = 'paid'
            "#,
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to claim refund"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit refund claim"))?;
        Ok(claimed.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_refund_claim(&self, order_id: Uuid) -> Result<bool, OrderError> {
        let released = sqlx::query(
            "UPDATE payments SET status = 'paid', updated_utc = NOW() \
             WHERE order_id = $1 AND status = 'refunding'",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to release refund claim"))?;

        Ok(released.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn mark_payment_refunded(
        &self,
        order_id: Uuid,
        refund_id: Option<&str>,
    ) -> Result<bool, OrderError> {
        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'refunded', refund_id = $2, updated_utc = NOW()
            WHERE order_id = $1 AND status IN ('refunding', 'pending')
            "#,
        )
        .bind(order_id)
        .bind(refund_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark payment refunded"))?;

        Ok(updated.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_expired_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, OrderError> {
        let rows = sqlx::query_as::<_, OrderRow>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE status = 'created' AND expires_utc < $1 ORDER BY expires_utc LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list expired orders"))?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let items = self.order_items(row.order_id).await?;
            orders.push(row.into_order(items));
        }
        Ok(orders)
    }

    #[instrument(skip(self, step), fields(status = %step.status))]
    async fn append_tracking_step(
        &self,
        order_id: Uuid,
        step: &NewTrackingStep,
    ) -> Result<TrackingStep, OrderError> {
        sqlx::query_as::<_, TrackingStep>(
            r#"
            INSERT INTO tracking_steps (order_id, seq, status, label, step_utc, completed)
            SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4, $5
            FROM tracking_steps
            WHERE order_id = $1
            RETURNING order_id, seq, status, label, step_utc, completed
            "#,
        )
        .bind(order_id)
        .bind(&step.status)
        .bind(&step.label)
        .bind(step.step_utc)
        .bind(step.completed)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                OrderError::OrderNotFound(order_id)
            }
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                OrderError::Storage(AppError::Conflict(anyhow::anyhow!(
                    "Concurrent tracking update for order {}",
                    order_id
                )))
            }
            _ => OrderError::Storage(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to append tracking step: {}",
                e
            ))),
        })
    }

    #[instrument(skip(self))]
    async fn tracking_steps(&self, order_id: Uuid) -> Result<Vec<TrackingStep>, OrderError> {
        sqlx::query_as::<_, TrackingStep>(
            r#"
            SELECT order_id, seq, status, label, step_utc, completed
            FROM tracking_steps
            WHERE order_id = $1
            ORDER BY seq
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load tracking steps"))
    }
}
