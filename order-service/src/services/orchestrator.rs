//! Order lifecycle orchestration.
//!
//! Each operation reads the order, asks the state machine whether the event
//! is allowed, performs side effects (stock, coupon, gateway) and then moves
//! the order with a compare-and-set on its current status. No in-process
//! lock is held; the store's conditional updates decide every race.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::error::{CouponError, OrderError};
use crate::models::{
    Address, NewOrderItem, NewTrackingStep, Order, OrderEvent, OrderItem, OrderStatus, Payment,
    PaymentMethod, PaymentStatus, ReservationLine, ReservationToken, TrackingStep,
    TransitionError, TransitionUpdate,
};
use crate::services::broker::{CheckoutCustomer, PaymentBroker, PaymentIntent};
use crate::services::coupon::{self, CouponQuote};
use crate::services::metrics;
use crate::services::store::{Clock, Store};

pub const EXPIRY_REASON: &str = "payment window expired";

/// Time windows that drive expiry and returns.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub payment_window: Duration,
    pub return_window: Duration,
    pub sweep_batch_size: i64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            payment_window: Duration::minutes(30),
            return_window: Duration::days(7),
            sweep_batch_size: 100,
        }
    }
}

impl From<&LifecycleConfig> for LifecycleSettings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            payment_window: Duration::minutes(config.payment_window_minutes),
            return_window: Duration::days(config.return_window_days),
            sweep_batch_size: config.sweep_batch_size.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub user_id: String,
    pub items: Vec<NewOrderItem>,
    pub shipping_address: Address,
    pub payment_method: PaymentMethod,
    pub coupon_code: Option<String>,
}

/// Result of checkout. ONLINE orders carry the intent for the client.
#[derive(Debug, Clone, Serialize)]
pub struct OrderPlacement {
    pub order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent: Option<PaymentIntent>,
}

/// Signed checkout completion reported by the client.
#[derive(Debug, Clone)]
pub struct PaymentCallback {
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: String,
    pub gateway_signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub payment: Option<Payment>,
    pub tracking: Vec<TrackingStep>,
}

#[derive(Clone)]
pub struct OrderOrchestrator {
    store: Arc<dyn Store>,
    broker: PaymentBroker,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
}

fn reservation_of(order: &Order) -> ReservationToken {
    ReservationToken {
        reservation_id: order.reservation_id,
        order_id: order.order_id,
        lines: order
            .items
            .iter()
            .map(|item| ReservationLine {
                variant: item.variant.clone(),
                quantity: item.quantity,
            })
            .collect(),
    }
}

fn illegal(from: OrderStatus, event: OrderEvent) -> OrderError {
    TransitionError::Illegal { from, event }.into()
}

fn refund_in_progress(order_id: Uuid) -> OrderError {
    OrderError::Storage(AppError::Conflict(anyhow::anyhow!(
        "A refund for order {} is already in progress",
        order_id
    )))
}

impl OrderOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        broker: PaymentBroker,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            settings,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -------------------------------------------------------------------------
    // Coupons
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(subtotal = %cart_subtotal))]
    pub async fn validate_coupon(
        &self,
        code: &str,
        cart_subtotal: Decimal,
    ) -> Result<CouponQuote, OrderError> {
        if cart_subtotal.is_sign_negative() && !cart_subtotal.is_zero() {
            return Err(OrderError::Invalid(
                "Cart subtotal cannot be negative".to_string(),
            ));
        }

        let found = self.store.find_coupon(code).await?;
        let quote = coupon::validate(found.as_ref(), code, cart_subtotal, self.clock.now())?;

        info!(code = %quote.coupon.code, discount = %quote.discount_amount, "Coupon validated");
        Ok(quote)
    }

    // -------------------------------------------------------------------------
    // Checkout
    // -------------------------------------------------------------------------

    #[instrument(
        skip(self, request),
        fields(user_id = %request.user_id, payment_method = %request.payment_method)
    )]
    pub async fn create_order(&self, request: CreateOrder) -> Result<OrderPlacement, OrderError> {
        if request.items.is_empty() {
            return Err(OrderError::EmptyCart);
        }
        if let Some(item) = request.items.iter().find(|i| i.quantity <= 0) {
            return Err(OrderError::Invalid(format!(
                "Quantity for variant {} must be positive",
                item.variant
            )));
        }

        let lines = ReservationLine::consolidate(
            &request
                .items
                .iter()
                .map(|item| ReservationLine {
                    variant: item.variant.clone(),
                    quantity: item.quantity,
                })
                .collect::<Vec<_>>(),
        );

        let order_id = Uuid::new_v4();
        let items = self.price_lines(order_id, &lines).await?;
        let subtotal: Decimal = items.iter().map(OrderItem::line_total).sum();

        let quote = match request.coupon_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Some(self.validate_coupon(code, subtotal).await?),
            _ => None,
        };
        let discount_amount = quote
            .as_ref()
            .map(|q| q.discount_amount)
            .unwrap_or(Decimal::ZERO);
        let total_amount = (subtotal - discount_amount).max(Decimal::ZERO);
        if request.payment_method == PaymentMethod::Online && total_amount.is_zero() {
            return Err(OrderError::Invalid(
                "Order total is zero; there is nothing to collect online".to_string(),
            ));
        }

        let token = match self.store.reserve(order_id, &lines).await {
            Ok(token) => {
                metrics::record_reservation("reserved");
                token
            }
            Err(e) => {
                if matches!(e, OrderError::InsufficientStock(_)) {
                    metrics::record_reservation("insufficient");
                }
                warn!(error = %e, "Stock reservation failed");
                return Err(e);
            }
        };

        let now = self.clock.now();
        let order = Order {
            order_id,
            user_id: request.user_id.clone(),
            status: OrderStatus::Created,
            payment_method: request.payment_method,
            subtotal,
            discount_amount,
            total_amount,
            coupon_code: quote.map(|q| q.coupon.code),
            coupon_redeemed: false,
            shipping_address: request.shipping_address,
            reservation_id: token.reservation_id,
            awb: None,
            cancellation_reason: None,
            return_reason: None,
            expires_utc: None,
            delivered_utc: None,
            created_utc: now,
            updated_utc: now,
            items,
        };

        let placement = match request.payment_method {
            PaymentMethod::Cod => self.place_cod_order(order, &token).await?,
            PaymentMethod::Online => self.place_online_order(order, &token).await?,
        };

        metrics::record_order_created(request.payment_method);
        info!(
            order_id = %placement.order.order_id,
            status = %placement.order.status,
            total = %placement.order.total_amount,
            "Order created"
        );

        Ok(placement)
    }

    async fn price_lines(
        &self,
        order_id: Uuid,
        lines: &[ReservationLine],
    ) -> Result<Vec<OrderItem>, OrderError> {
        let keys: Vec<_> = lines.iter().map(|l| l.variant.clone()).collect();
        let catalog: HashMap<_, _> = self
            .store
            .get_variants(&keys)
            .await?
            .into_iter()
            .map(|v| (v.key.clone(), v))
            .collect();

        lines
            .iter()
            .map(|line| {
                let variant = catalog
                    .get(&line.variant)
                    .ok_or_else(|| OrderError::InsufficientStock(line.variant.clone()))?;
                Ok(OrderItem {
                    order_id,
                    variant: line.variant.clone(),
                    product_name: variant.product_name.clone(),
                    quantity: line.quantity,
                    unit_price: variant.price,
                })
            })
            .collect()
    }

    async fn place_cod_order(
        &self,
        mut order: Order,
        token: &ReservationToken,
    ) -> Result<OrderPlacement, OrderError> {
        if let Some(code) = order.coupon_code.clone() {
            if let Err(e) = self.store.redeem(&code).await {
                self.record_redeem_failure(&e);
                self.rollback_checkout(token, None).await;
                return Err(e);
            }
            metrics::record_coupon_redemption("redeemed");
            order.coupon_redeemed = true;
        }
        let redeemed = order.coupon_redeemed.then(|| order.coupon_code.clone()).flatten();

        if let Err(e) = self.store.commit(token).await {
            self.rollback_checkout(token, redeemed.as_deref()).await;
            return Err(e);
        }
        metrics::record_reservation("committed");

        order.status = OrderStatus::Confirmed;
        let payment = Payment::pending(
            order.order_id,
            PaymentMethod::Cod,
            order.total_amount,
            self.broker.currency(),
            None,
            order.created_utc,
        );

        if let Err(e) = self.store.insert_order(&order, &payment).await {
            self.rollback_checkout(token, redeemed.as_deref()).await;
            return Err(e);
        }

        Ok(OrderPlacement {
            order,
            payment_intent: None,
        })
    }

    async fn place_online_order(
        &self,
        mut order: Order,
        token: &ReservationToken,
    ) -> Result<OrderPlacement, OrderError> {
        let customer = CheckoutCustomer {
            user_id: order.user_id.clone(),
            name: order.shipping_address.name.clone(),
            contact: order.shipping_address.phone.clone(),
        };

        let intent = match self
            .broker
            .create_intent(order.order_id, order.total_amount, customer)
            .await
        {
            Ok(intent) => intent,
            Err(e) => {
                self.rollback_checkout(token, None).await;
                return Err(e);
            }
        };

        order.expires_utc = Some(order.created_utc + self.settings.payment_window);
        let payment = Payment::pending(
            order.order_id,
            PaymentMethod::Online,
            order.total_amount,
            &intent.currency,
            Some(intent.gateway_order_id.clone()),
            order.created_utc,
        );

        if let Err(e) = self.store.insert_order(&order, &payment).await {
            self.rollback_checkout(token, None).await;
            return Err(e);
        }

        Ok(OrderPlacement {
            order,
            payment_intent: Some(intent),
        })
    }

    /// Undo a partially applied checkout. Failures are logged, not returned,
    /// so the caller still sees the error that caused the rollback.
    async fn rollback_checkout(&self, token: &ReservationToken, redeemed_coupon: Option<&str>) {
        match self.store.release(token).await {
            Ok(()) => metrics::record_reservation("released"),
            Err(e) => error!(
                reservation_id = %token.reservation_id,
                error = %e,
                "Failed to release reservation during rollback"
            ),
        }

        if let Some(code) = redeemed_coupon {
            match self.store.unredeem(code).await {
                Ok(()) => metrics::record_coupon_redemption("unredeemed"),
                Err(e) => error!(code, error = %e, "Failed to unredeem coupon during rollback"),
            }
        }
    }

    fn record_redeem_failure(&self, err: &OrderError) {
        if matches!(err, OrderError::Coupon(CouponError::LimitReached(_))) {
            metrics::record_coupon_redemption("limit_reached");
        }
    }

    // -------------------------------------------------------------------------
    // Payment confirmation
    // -------------------------------------------------------------------------

    #[instrument(
        skip(self, callback),
        fields(order_id = %order_id, gateway_payment_id = %callback.gateway_payment_id)
    )]
    pub async fn confirm_online_payment(
        &self,
        order_id: Uuid,
        callback: PaymentCallback,
    ) -> Result<Order, OrderError> {
        let order = self.load_order(order_id).await?;
        if order.payment_method != PaymentMethod::Online {
            return Err(OrderError::Invalid(format!(
                "Order {} is not paid online",
                order_id
            )));
        }

        let payment = self.load_payment(order_id).await?;
        let gateway_order_id = payment.gateway_order_id.clone().ok_or_else(|| {
            OrderError::Storage(AppError::InternalError(anyhow::anyhow!(
                "Online payment for order {} has no gateway order",
                order_id
            )))
        })?;

        if let Some(claimed) = callback.gateway_order_id.as_deref() {
            if claimed != gateway_order_id {
                metrics::record_payment_verification("mismatch");
                warn!(claimed, "Callback names a different gateway order");
                return Err(OrderError::SignatureMismatch);
            }
        }

        if order.status != OrderStatus::Created {
            return self
                .settle_confirmation(order, payment, &gateway_order_id, &callback)
                .await;
        }

        if !order.is_payment_window_open(self.clock.now()) {
            metrics::record_payment_verification("expired");
            self.expire_order(&order).await?;
            return Err(OrderError::OrderExpired(order_id));
        }

        self.verify(&gateway_order_id, &callback)?;

        let redeemed = match order.coupon_code.as_deref() {
            Some(code) => {
                if let Err(e) = self.store.redeem(code).await {
                    self.record_redeem_failure(&e);
                    warn!(code, error = %e, "Coupon could not be redeemed; order stays pending");
                    return Err(e);
                }
                metrics::record_coupon_redemption("redeemed");
                true
            }
            None => false,
        };

        let update = TransitionUpdate {
            coupon_redeemed: Some(redeemed),
            ..Default::default()
        };
        let transitioned = self
            .store
            .transition(order_id, OrderStatus::Created, OrderStatus::Confirmed, &update)
            .await;

        match transitioned {
            Ok(Some(confirmed)) => {
                metrics::record_transition(OrderStatus::Created, OrderStatus::Confirmed);
                self.finish_confirmation(&confirmed, &callback).await?;
                info!("Online payment confirmed");
                Ok(confirmed)
            }
            Ok(None) => {
                if redeemed {
                    self.unredeem(&order).await;
                }
                let current = self.load_order(order_id).await?;
                let payment = self.load_payment(order_id).await?;
                self.settle_confirmation(current, payment, &gateway_order_id, &callback)
                    .await
            }
            Err(e) => {
                if redeemed {
                    self.unredeem(&order).await;
                }
                Err(e)
            }
        }
    }

    /// Callback for an order that has already left `created`.
    async fn settle_confirmation(
        &self,
        order: Order,
        payment: Payment,
        gateway_order_id: &str,
        callback: &PaymentCallback,
    ) -> Result<Order, OrderError> {
        let same_payment =
            payment.gateway_payment_id.as_deref() == Some(callback.gateway_payment_id.as_str());

        match (order.status, payment.status) {
            (OrderStatus::Cancelled, PaymentStatus::Pending) => {
                metrics::record_payment_verification("expired");
                Err(OrderError::OrderExpired(order.order_id))
            }
            (_, PaymentStatus::Paid | PaymentStatus::Refunding | PaymentStatus::Refunded)
                if same_payment =>
            {
                info!(status = %order.status, "Duplicate payment callback ignored");
                Ok(order)
            }
            (OrderStatus::Confirmed, PaymentStatus::Pending) => {
                self.verify(gateway_order_id, callback)?;
                self.finish_confirmation(&order, callback).await?;
                Ok(order)
            }
            (status, _) => Err(illegal(status, OrderEvent::PaymentVerified)),
        }
    }

    fn verify(&self, gateway_order_id: &str, callback: &PaymentCallback) -> Result<(), OrderError> {
        match self.broker.verify_callback(
            gateway_order_id,
            &callback.gateway_payment_id,
            &callback.gateway_signature,
        ) {
            Ok(()) => {
                metrics::record_payment_verification("verified");
                Ok(())
            }
            Err(e) => {
                if matches!(e, OrderError::SignatureMismatch) {
                    metrics::record_payment_verification("mismatch");
                }
                Err(e)
            }
        }
    }

    /// Commit stock and record the payment. Both steps are idempotent.
    async fn finish_confirmation(
        &self,
        order: &Order,
        callback: &PaymentCallback,
    ) -> Result<(), OrderError> {
        self.store.commit(&reservation_of(order)).await?;
        metrics::record_reservation("committed");

        self.store
            .mark_payment_paid(
                order.order_id,
                &callback.gateway_payment_id,
                &callback.gateway_signature,
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cancellation and returns
    // -------------------------------------------------------------------------

    /// Cancel a confirmed or processing order.
    ///
    /// A paid ONLINE order is refunded first. The refund is claimed on the
    /// payment row, so a second cancel or a fulfilment step cannot run while
    /// the gateway call is in flight. Stock and the coupon use are given back
    /// in the same write that moves the order to `cancelled`.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid, reason: &str) -> Result<Order, OrderError> {
        let order = self.load_order(order_id).await?;
        let next = order.status.apply(OrderEvent::Cancel)?;

        match self.store.get_payment(order_id).await? {
            Some(payment) if payment.status == PaymentStatus::Paid => {
                self.refund_payment(&order, &payment, OrderEvent::Cancel)
                    .await?;
            }
            Some(payment) if payment.status == PaymentStatus::Refunding => {
                return Err(refund_in_progress(order_id));
            }
            _ => {}
        }

        let update = TransitionUpdate {
            cancellation_reason: Some(reason.to_string()),
            release_stock: true,
            return_coupon: true,
            ..Default::default()
        };
        let cancelled = match self
            .store
            .transition(order_id, order.status, next, &update)
            .await?
        {
            Some(cancelled) => cancelled,
            None => return Err(self.lost_race(order_id, OrderEvent::Cancel).await),
        };
        metrics::record_transition(order.status, next);
        metrics::record_reservation("released");
        if order.coupon_redeemed {
            metrics::record_coupon_redemption("unredeemed");
        }

        info!(from = %order.status, "Order cancelled");
        Ok(cancelled)
    }

    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn return_order(&self, order_id: Uuid, reason: &str) -> Result<Order, OrderError> {
        let order = self.load_order(order_id).await?;
        let next = order.status.apply(OrderEvent::RequestReturn)?;

        let delivered = order.delivered_utc.ok_or(OrderError::ReturnWindowClosed)?;
        if self.clock.now() > delivered + self.settings.return_window {
            info!(delivered_utc = %delivered, "Return requested after window closed");
            return Err(OrderError::ReturnWindowClosed);
        }

        let update = TransitionUpdate {
            return_reason: Some(reason.to_string()),
            ..Default::default()
        };
        let returned = match self
            .store
            .transition(order_id, order.status, next, &update)
            .await?
        {
            Some(returned) => returned,
            None => return Err(self.lost_race(order_id, OrderEvent::RequestReturn).await),
        };
        metrics::record_transition(order.status, next);

        info!("Return requested");
        Ok(returned)
    }

    #[instrument(skip(self))]
    pub async fn approve_return(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let update = TransitionUpdate {
            release_stock: true,
            ..Default::default()
        };
        let (_, returned) = self
            .advance(order_id, OrderEvent::ApproveReturn, update)
            .await?;
        metrics::record_reservation("released");
        Ok(returned)
    }

    #[instrument(skip(self))]
    pub async fn process_refund(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let order = self.load_order(order_id).await?;
        order.status.apply(OrderEvent::RefundProcessed)?;
        let payment = self.load_payment(order_id).await?;

        match (order.payment_method, payment.status) {
            (PaymentMethod::Online, PaymentStatus::Paid) => {
                self.refund_payment(&order, &payment, OrderEvent::RefundProcessed)
                    .await?
            }
            (PaymentMethod::Online, PaymentStatus::Refunding) => {
                return Err(refund_in_progress(order_id))
            }
            (_, PaymentStatus::Refunded) => {}
            (PaymentMethod::Cod, _) => {
                self.store.mark_payment_refunded(order_id, None).await?;
                info!("Manual COD refund recorded");
            }
            (PaymentMethod::Online, status) => {
                return Err(OrderError::Invalid(format!(
                    "Payment is {}; nothing to refund",
                    status
                )))
            }
        }

        let (_, refunded) = self
            .advance(order_id, OrderEvent::RefundProcessed, TransitionUpdate::default())
            .await?;
        Ok(refunded)
    }

    /// Refund a paid payment through the gateway while `order` keeps its status.
    async fn refund_payment(
        &self,
        order: &Order,
        payment: &Payment,
        event: OrderEvent,
    ) -> Result<(), OrderError> {
        let gateway_payment_id = payment.gateway_payment_id.as_deref().ok_or_else(|| {
            OrderError::RefundFailed(format!(
                "Payment for order {} has no gateway payment id",
                payment.order_id
            ))
        })?;

        if !self.store.claim_refund(order.order_id, order.status).await? {
            return Err(match self.lost_race(order.order_id, event).await {
                OrderError::Storage(AppError::Conflict(_)) => refund_in_progress(order.order_id),
                other => other,
            });
        }

        let refunded = self
            .broker
            .refund(
                gateway_payment_id,
                payment.amount,
                &payment.payment_id.to_string(),
            )
            .await;
        let refund_id = match refunded {
            Ok(refund_id) => refund_id,
            Err(e) => {
                if let Err(release_err) = self.store.release_refund_claim(order.order_id).await {
                    error!(error = %release_err, "Failed to release refund claim");
                }
                return Err(e);
            }
        };

        if let Err(e) = self
            .store
            .mark_payment_refunded(order.order_id, Some(&refund_id))
            .await
        {
            error!(
                refund_id = %refund_id,
                error = %e,
                "Gateway refund succeeded but was not recorded"
            );
            return Err(e);
        }
        info!(refund_id = %refund_id, "Payment refunded");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fulfilment
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn start_processing(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let (_, order) = self
            .advance(order_id, OrderEvent::StartProcessing, TransitionUpdate::default())
            .await?;
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn mark_shipped(&self, order_id: Uuid, awb: &str) -> Result<Order, OrderError> {
        let update = TransitionUpdate {
            awb: Some(awb.to_string()),
            ..Default::default()
        };
        let (_, order) = self.advance(order_id, OrderEvent::Ship, update).await?;
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn mark_delivered(
        &self,
        order_id: Uuid,
        delivered_utc: Option<DateTime<Utc>>,
    ) -> Result<Order, OrderError> {
        let update = TransitionUpdate {
            delivered_utc: Some(delivered_utc.unwrap_or_else(|| self.clock.now())),
            ..Default::default()
        };
        let (_, order) = self.advance(order_id, OrderEvent::Deliver, update).await?;
        Ok(order)
    }

    #[instrument(skip(self, step), fields(status = %step.status))]
    pub async fn append_tracking_step(
        &self,
        order_id: Uuid,
        step: NewTrackingStep,
    ) -> Result<TrackingStep, OrderError> {
        self.store.append_tracking_step(order_id, &step).await
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, OrderError> {
        let order = self.load_order(order_id).await?;
        let payment = self.store.get_payment(order_id).await?;
        let tracking = self.store.tracking_steps(order_id).await?;

        Ok(OrderDetails {
            order,
            payment,
            tracking,
        })
    }

    // -------------------------------------------------------------------------
    // Expiry
    // -------------------------------------------------------------------------

    /// Cancel ONLINE orders whose payment window closed before `now`.
    ///
    /// Returns how many orders this call expired.
    #[instrument(skip(self))]
    pub async fn expire_pending_orders(&self, now: DateTime<Utc>) -> Result<usize, OrderError> {
        let candidates = self
            .store
            .list_expired_orders(now, self.settings.sweep_batch_size)
            .await?;

        let mut expired = 0;
        for order in &candidates {
            match self.expire_order(order).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(order_id = %order.order_id, error = %e, "Failed to expire order"),
            }
        }

        if expired > 0 {
            info!(expired, "Expired unpaid orders");
        }
        Ok(expired)
    }

    /// Returns false if the order had already left `created`.
    async fn expire_order(&self, order: &Order) -> Result<bool, OrderError> {
        let next = order.status.apply(OrderEvent::Expire)?;
        let update = TransitionUpdate {
            cancellation_reason: Some(EXPIRY_REASON.to_string()),
            release_stock: true,
            ..Default::default()
        };

        match self
            .store
            .transition(order.order_id, order.status, next, &update)
            .await?
        {
            Some(_) => {
                metrics::record_transition(order.status, next);
                metrics::record_reservation("released");
                info!(order_id = %order.order_id, "Order expired");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn advance(
        &self,
        order_id: Uuid,
        event: OrderEvent,
        update: TransitionUpdate,
    ) -> Result<(Order, Order), OrderError> {
        let order = self.load_order(order_id).await?;
        let next = order.status.apply(event)?;

        match self
            .store
            .transition(order_id, order.status, next, &update)
            .await?
        {
            Some(updated) => {
                metrics::record_transition(order.status, next);
                info!(order_id = %order_id, from = %order.status, to = %next, "Order transitioned");
                Ok((order, updated))
            }
            None => Err(self.lost_race(order_id, event).await),
        }
    }

    /// Explain a failed compare-and-set by re-reading the order.
    async fn lost_race(&self, order_id: Uuid, event: OrderEvent) -> OrderError {
        match self.store.get_order(order_id).await {
            Ok(Some(current)) => match current.status.apply(event) {
                Err(e) => e.into(),
                Ok(_) => OrderError::Storage(AppError::Conflict(anyhow::anyhow!(
                    "Order {} was modified concurrently",
                    order_id
                ))),
            },
            Ok(None) => OrderError::OrderNotFound(order_id),
            Err(e) => e,
        }
    }

    async fn unredeem(&self, order: &Order) {
        let Some(code) = order.coupon_code.as_deref() else {
            return;
        };
        match self.store.unredeem(code).await {
            Ok(()) => metrics::record_coupon_redemption("unredeemed"),
            Err(e) => error!(order_id = %order.order_id, code, error = %e, "Failed to unredeem coupon"),
        }
    }

    async fn load_order(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))
    }

    async fn load_payment(&self, order_id: Uuid) -> Result<Payment, OrderError> {
        self.store.get_payment(order_id).await?.ok_or_else(|| {
            OrderError::Storage(AppError::NotFound(anyhow::anyhow!(
                "Payment for order {} not found",
                order_id
            )))
        })
    }
}
