//! Storage seams used by the orchestrator.
//!
//! Every mutation of shared state (variant stock, coupon counters, order
//! status) is a single conditional update in the backing store, so callers
//! never coordinate through in-process locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::OrderError;
use crate::models::{
    Coupon, NewTrackingStep, Order, OrderStatus, Payment, ProductVariant, ReservationLine,
    ReservationToken, TrackingStep, TransitionUpdate, VariantKey,
};

/// Per-variant available-quantity store.
#[async_trait]
pub trait StockLedger: Send + Sync {
    async fn get_variants(&self, keys: &[VariantKey]) -> Result<Vec<ProductVariant>, OrderError>;

    /// Hold stock for every line or for none of them.
    ///
    /// Fails with `InsufficientStock` naming the first variant (in key order)
    /// that could not be satisfied.
    async fn reserve(
        &self,
        order_id: Uuid,
        lines: &[ReservationLine],
    ) -> Result<ReservationToken, OrderError>;

    /// Return held or committed quantities to stock. Releasing twice is a no-op.
    async fn release(&self, token: &ReservationToken) -> Result<(), OrderError>;

    /// Turn a hold into a sale. Committing twice is a no-op.
    async fn commit(&self, token: &ReservationToken) -> Result<(), OrderError>;

    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<ReservationToken>, OrderError>;
}

/// Coupon lookup and the bounded redemption counter.
#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Case-insensitive lookup.
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, OrderError>;

    /// Consume one use; `LimitReached` when the limit is already met.
    async fn redeem(&self, code: &str) -> Result<(), OrderError>;

    /// Give one use back, never going below zero.
    async fn unredeem(&self, code: &str) -> Result<(), OrderError>;
}

/// Orders, their payments and tracking history.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert_order(&self, order: &Order, payment: &Payment) -> Result<(), OrderError>;

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, OrderError>;

    async fn get_payment(&self, order_id: Uuid) -> Result<Option<Payment>, OrderError>;

    /// Compare-and-set the order status.
    ///
    /// Returns the updated order, or `None` when the order is no longer in
    /// `from` (another request won the race) or a refund is in flight and `to`
    /// does not close it. `update.release_stock` and `update.return_coupon`
    /// are applied in the same write as the status change.
    async fn transition(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        update: &TransitionUpdate,
    ) -> Result<Option<Order>, OrderError>;

    /// `pending -> paid`. Returns false if the payment was not pending.
    async fn mark_payment_paid(
        &self,
        order_id: Uuid,
        gateway_payment_id: &str,
        gateway_signature: &str,
        paid_utc: DateTime<Utc>,
    ) -> Result<bool, OrderError>;

    /// `paid -> refunding`, only while the order is still in `order_status`.
    ///
    /// The winner owns the gateway refund. Returns false when another request
    /// already holds it or the order has moved on.
    async fn claim_refund(
        &self,
        order_id: Uuid,
        order_status: OrderStatus,
    ) -> Result<bool, OrderError>;

    /// `refunding -> paid` after the gateway refused the refund.
    async fn release_refund_claim(&self, order_id: Uuid) -> Result<bool, OrderError>;

    /// `refunding|pending -> refunded`. Returns false if already refunded or failed.
    async fn mark_payment_refunded(
        &self,
        order_id: Uuid,
        refund_id: Option<&str>,
    ) -> Result<bool, OrderError>;

    /// ONLINE orders still in `created` whose payment window closed before `now`.
    async fn list_expired_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, OrderError>;

    async fn append_tracking_step(
        &self,
        order_id: Uuid,
        step: &NewTrackingStep,
    ) -> Result<TrackingStep, OrderError>;

    async fn tracking_steps(&self, order_id: Uuid) -> Result<Vec<TrackingStep>, OrderError>;
}

/// Everything the orchestrator needs from persistence.
pub trait Store: StockLedger + CouponStore + OrderRepository {}

impl<T> Store for T where T: StockLedger + CouponStore + OrderRepository {}

/// Source of "now" for expiry and return-window checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
