//! In-process store.
//!
//! Used by tests and by `storage.backend = "memory"`. Each variant sits
//! behind its own mutex; multi-variant reservations lock variants in
//! `VariantKey` order so two checkouts touching the same rows cannot
//! deadlock. No lock is held across an `.await`. Order entries are locked
//! before payment entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use service_core::error::AppError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::error::{CouponError, OrderError};
use crate::models::{
    Coupon, NewTrackingStep, Order, OrderStatus, Payment, PaymentStatus, ProductVariant,
    ReservationLine, ReservationState, ReservationToken, TrackingStep, TransitionUpdate,
    VariantKey,
};
use crate::services::store::{Clock, CouponStore, OrderRepository, StockLedger, SystemClock};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    variants: DashMap<VariantKey, Arc<Mutex<ProductVariant>>>,
    coupons: DashMap<String, Coupon>,
    reservations: DashMap<Uuid, (ReservationToken, ReservationState)>,
    orders: DashMap<Uuid, Order>,
    payments: DashMap<Uuid, Payment>,
    tracking: DashMap<Uuid, Vec<TrackingStep>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose `updated_utc` stamps come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            variants: DashMap::new(),
            coupons: DashMap::new(),
            reservations: DashMap::new(),
            orders: DashMap::new(),
            payments: DashMap::new(),
            tracking: DashMap::new(),
        }
    }

    pub fn add_variant(&self, variant: ProductVariant) {
        self.variants
            .insert(variant.key.clone(), Arc::new(Mutex::new(variant)));
    }

    pub fn add_coupon(&self, mut coupon: Coupon) {
        coupon.code = Coupon::normalize_code(&coupon.code);
        self.coupons.insert(coupon.code.clone(), coupon);
    }

    /// Snapshot of a variant row.
    pub fn variant(&self, key: &VariantKey) -> Option<ProductVariant> {
        self.variants.get(key).map(|cell| lock(cell.value()).clone())
    }

    /// Snapshot of a coupon row.
    pub fn coupon(&self, code: &str) -> Option<Coupon> {
        self.coupons
            .get(&Coupon::normalize_code(code))
            .map(|c| c.value().clone())
    }

    fn variant_cells(
        &self,
        lines: &[ReservationLine],
    ) -> Result<Vec<Arc<Mutex<ProductVariant>>>, OrderError> {
        lines
            .iter()
            .map(|line| {
                self.variants
                    .get(&line.variant)
                    .map(|cell| Arc::clone(cell.value()))
                    .ok_or_else(|| OrderError::InsufficientStock(line.variant.clone()))
            })
            .collect()
    }

    fn reserve_lines(&self, lines: &[ReservationLine]) -> Result<(), OrderError> {
        let cells = self.variant_cells(lines)?;
        let mut guards: Vec<MutexGuard<'_, ProductVariant>> =
            cells.iter().map(|cell| lock(cell)).collect();

        for (row, line) in guards.iter().zip(lines) {
            if row.stock < i64::from(line.quantity) {
                return Err(OrderError::InsufficientStock(line.variant.clone()));
            }
        }

        for (row, line) in guards.iter_mut().zip(lines) {
            let qty = i64::from(line.quantity);
            row.stock -= qty;
            row.reserved += qty;
        }

        Ok(())
    }

    fn release_reservation(&self, reservation_id: Uuid) -> Result<(), OrderError> {
        let mut entry = self.reservations.get_mut(&reservation_id).ok_or_else(|| {
            OrderError::Storage(AppError::NotFound(anyhow::anyhow!(
                "Reservation {} not found",
                reservation_id
            )))
        })?;

        let (stored, state) = entry.value_mut();
        match *state {
            ReservationState::Released => return Ok(()),
            ReservationState::Held => self.apply_to_lines(&stored.lines, |row, qty| {
                row.stock += qty;
                row.reserved = (row.reserved - qty).max(0);
            })?,
            ReservationState::Committed => self.apply_to_lines(&stored.lines, |row, qty| {
                row.stock += qty;
                row.sold_count = (row.sold_count - qty).max(0);
            })?,
        }
        *state = ReservationState::Released;

        Ok(())
    }

    fn return_coupon_use(&self, code: &str) {
        if let Some(mut coupon) = self.coupons.get_mut(&Coupon::normalize_code(code)) {
            coupon.used_count = (coupon.used_count - 1).max(0);
        }
    }

    fn refund_in_flight(&self, order_id: Uuid) -> bool {
        self.payments
            .get(&order_id)
            .is_some_and(|p| p.status == PaymentStatus::Refunding)
    }

    fn apply_to_lines(
        &self,
        lines: &[ReservationLine],
        apply: impl Fn(&mut ProductVariant, i64),
    ) -> Result<(), OrderError> {
        let cells = self.variant_cells(lines)?;
        let mut guards: Vec<MutexGuard<'_, ProductVariant>> =
            cells.iter().map(|cell| lock(cell)).collect();
        for (row, line) in guards.iter_mut().zip(lines) {
            apply(row, i64::from(line.quantity));
        }
        Ok(())
    }
}

#[async_trait]
impl StockLedger for MemoryStore {
    async fn get_variants(&self, keys: &[VariantKey]) -> Result<Vec<ProductVariant>, OrderError> {
        Ok(keys.iter().filter_map(|key| self.variant(key)).collect())
    }

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

        self.reserve_lines(&lines)?;

        let token = ReservationToken {
            reservation_id: Uuid::new_v4(),
            order_id,
            lines,
        };
        self.reservations.insert(
            token.reservation_id,
            (token.clone(), ReservationState::Held),
        );

        Ok(token)
    }

    async fn release(&self, token: &ReservationToken) -> Result<(), OrderError> {
        self.release_reservation(token.reservation_id)
    }

    async fn commit(&self, token: &ReservationToken) -> Result<(), OrderError> {
        let mut entry = self
            .reservations
            .get_mut(&token.reservation_id)
            .ok_or_else(|| {
                OrderError::Storage(AppError::NotFound(anyhow::anyhow!(
                    "Reservation {} not found",
                    token.reservation_id
                )))
            })?;

        let (stored, state) = entry.value_mut();
        match *state {
            ReservationState::Committed => return Ok(()),
            ReservationState::Released => {
                return Err(OrderError::ReservationReleased(token.reservation_id))
            }
            ReservationState::Held => self.apply_to_lines(&stored.lines, |row, qty| {
                row.reserved = (row.reserved - qty).max(0);
                row.sold_count += qty;
            })?,
        }
        *state = ReservationState::Committed;

        Ok(())
    }

    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<ReservationToken>, OrderError> {
        Ok(self
            .reservations
            .get(&reservation_id)
            .map(|entry| entry.value().0.clone()))
    }
}

#[async_trait]
impl CouponStore for MemoryStore {
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, OrderError> {
        Ok(self.coupon(code))
    }

    async fn redeem(&self, code: &str) -> Result<(), OrderError> {
        let code = Coupon::normalize_code(code);
        let mut coupon = self
            .coupons
            .get_mut(&code)
            .ok_or_else(|| CouponError::NotFound(code.clone()))?;

        if coupon.used_count >= coupon.usage_limit {
            return Err(CouponError::LimitReached(code).into());
        }
        coupon.used_count += 1;
        Ok(())
    }

    async fn unredeem(&self, code: &str) -> Result<(), OrderError> {
        self.return_coupon_use(code);
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert_order(&self, order: &Order, payment: &Payment) -> Result<(), OrderError> {
        if self.orders.contains_key(&order.order_id) {
            return Err(OrderError::Storage(AppError::Conflict(anyhow::anyhow!(
                "Order {} already exists",
                order.order_id
            ))));
        }
        self.payments.insert(order.order_id, payment.clone());
        self.orders.insert(order.order_id, order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, OrderError> {
        Ok(self.orders.get(&order_id).map(|o| o.value().clone()))
    }

    async fn get_payment(&self, order_id: Uuid) -> Result<Option<Payment>, OrderError> {
        Ok(self.payments.get(&order_id).map(|p| p.value().clone()))
    }

    async fn transition(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        update: &TransitionUpdate,
    ) -> Result<Option<Order>, OrderError> {
        let Some(mut order) = self.orders.get_mut(&order_id) else {
            return Err(OrderError::OrderNotFound(order_id));
        };

        if order.status != from {
            return Ok(None);
        }
        if !to.closes_refund() && self.refund_in_flight(order_id) {
            return Ok(None);
        }

        if update.release_stock {
            self.release_reservation(order.reservation_id)?;
        }
        if update.return_coupon && order.coupon_redeemed {
            if let Some(code) = order.coupon_code.as_deref() {
                self.return_coupon_use(code);
            }
        }

        order.status = to;
        update.apply_to(&mut order);
        order.updated_utc = self.clock.now();

        Ok(Some(order.clone()))
    }

    async fn mark_payment_paid(
        &self,
        order_id: Uuid,
        gateway_payment_id: &str,
        gateway_signature: &str,
        paid_utc: DateTime<Utc>,
    ) -> Result<bool, OrderError> {
        let Some(mut payment) = self.payments.get_mut(&order_id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }

        payment.status = PaymentStatus::Paid;
        payment.gateway_payment_id = Some(gateway_payment_id.to_string());
        payment.gateway_signature = Some(gateway_signature.to_string());
        payment.paid_utc = Some(paid_utc);
        payment.updated_utc = self.clock.now();
        Ok(true)
    }

    async fn claim_refund(
        &self,
        order_id: Uuid,
        order_status: OrderStatus,
    ) -> Result<bool, OrderError> {
        let Some(order) = self.orders.get_mut(&order_id) else {
            return Err(OrderError::OrderNotFound(order_id));
        };
        if order.status != order_status {
            return Ok(false);
        }
        let Some(mut payment) = self.payments.get_mut(&order_id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Paid {
            return Ok(false);
        }

        payment.status = PaymentStatus::Refunding;
        payment.updated_utc = self.clock.now();
        Ok(true)
    }

    async fn release_refund_claim(&self, order_id: Uuid) -> Result<bool, OrderError> {
        let Some(mut payment) = self.payments.get_mut(&order_id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Refunding {
            return Ok(false);
        }

        payment.status = PaymentStatus::Paid;
        payment.updated_utc = self.clock.now();
        Ok(true)
    }

    async fn mark_payment_refunded(
        &self,
        order_id: Uuid,
        refund_id: Option<&str>,
    ) -> Result<bool, OrderError> {
        let Some(mut payment) = self.payments.get_mut(&order_id) else {
            return Ok(false);
        };
        if !matches!(payment.status, PaymentStatus::Refunding | PaymentStatus::Pending) {
            return Ok(false);
        }

        payment.status = PaymentStatus::Refunded;
        payment.refund_id = refund_id.map(str::to_string);
        payment.updated_utc = self.clock.now();
        Ok(true)
    }

    async fn list_expired_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, OrderError> {
        let mut expired: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| {
                o.status == OrderStatus::Created && o.expires_utc.is_some_and(|at| at < now)
            })
            .map(|o| o.value().clone())
            .collect();

        expired.sort_by_key(|o| o.expires_utc);
        expired.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(expired)
    }

    async fn append_tracking_step(
        &self,
        order_id: Uuid,
        step: &NewTrackingStep,
    ) -> Result<TrackingStep, OrderError> {
        if !self.orders.contains_key(&order_id) {
            return Err(OrderError::OrderNotFound(order_id));
        }

        let mut steps = self.tracking.entry(order_id).or_default();
        let seq = i32::try_from(steps.len()).unwrap_or(i32::MAX - 1) + 1;
        let stored = TrackingStep {
            order_id,
            seq,
            status: step.status.clone(),
            label: step.label.clone(),
            step_utc: step.step_utc,
            completed: step.completed,
        };
        steps.push(stored.clone());
        Ok(stored)
    }

    async fn tracking_steps(&self, order_id: Uuid) -> Result<Vec<TrackingStep>, OrderError> {
        Ok(self
            .tracking
            .get(&order_id)
            .map(|steps| steps.value().clone())
            .unwrap_or_default())
    }
}
