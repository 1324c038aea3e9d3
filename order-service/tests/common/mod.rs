#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use order_service::error::OrderError;
use order_service::models::{
    Address, Coupon, DiscountType, NewOrderItem, NewTrackingStep, Order, OrderStatus, Payment,
    PaymentMethod, ProductVariant, ReservationLine, ReservationToken, TrackingStep,
    TransitionUpdate, VariantKey,
};
use order_service::services::{
    Clock, CouponStore, CreateOrder, GatewayError, GatewayOrder, GatewayRefund, LifecycleSettings,
    MemoryStore, OrderOrchestrator, OrderRepository, PaymentBroker, PaymentCallback,
    PaymentGateway, StockLedger,
};
use order_service::AppState;
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::error::AppError;
use service_core::utils::signature::{gateway_callback_payload, generate_signature};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const TEST_KEY_ID: &str = "rzp_test_key";
pub const TEST_KEY_SECRET: &str = "test_key_secret";
pub const TEST_USER_ID: &str = "test-user";

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRefund {
    pub gateway_payment_id: String,
    pub amount: u64,
    pub receipt: String,
}

/// Scripted gateway: succeeds unless told to fail, and records every refund.
#[derive(Default)]
pub struct FakeGateway {
    pub fail_create: AtomicBool,
    pub fail_refund: AtomicBool,
    /// Latency of each refund call, in milliseconds.
    pub refund_delay_ms: AtomicU64,
    pub orders_created: AtomicUsize,
    pub refunds: Mutex<Vec<RecordedRefund>>,
}

impl FakeGateway {
    pub fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }

    pub fn slow_refunds(&self, millis: u64) {
        self.refund_delay_ms.store(millis, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }
        let n = self.orders_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayOrder {
            id: format!("order_fake_{}", n),
            amount,
            currency: currency.to_string(),
            receipt: Some(receipt.to_string()),
            status: "created".to_string(),
        })
    }

    async fn refund(
        &self,
        gateway_payment_id: &str,
        amount: u64,
        receipt: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        let delay = self.refund_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("gateway timeout".to_string()));
        }
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push(RecordedRefund {
            gateway_payment_id: gateway_payment_id.to_string(),
            amount,
            receipt: receipt.to_string(),
        });
        Ok(GatewayRefund {
            id: format!("rfnd_fake_{}", refunds.len()),
            payment_id: gateway_payment_id.to_string(),
            amount,
            status: "processed".to_string(),
        })
    }
}

/// Memory store that can be told to fail the next status change that also
/// releases stock, before anything is written.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    pub fail_next_release: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_next_release: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StockLedger for FaultyStore {
    async fn get_variants(&self, keys: &[VariantKey]) -> Result<Vec<ProductVariant>, OrderError> {
        self.inner.get_variants(keys).await
    }

    async fn reserve(
        &self,
        order_id: Uuid,
        lines: &[ReservationLine],
    ) -> Result<ReservationToken, OrderError> {
        self.inner.reserve(order_id, lines).await
    }

    async fn release(&self, token: &ReservationToken) -> Result<(), OrderError> {
        self.inner.release(token).await
    }

    async fn commit(&self, token: &ReservationToken) -> Result<(), OrderError> {
        self.inner.commit(token).await
    }

    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<ReservationToken>, OrderError> {
        self.inner.get_reservation(reservation_id).await
    }
}

#[async_trait]
impl CouponStore for FaultyStore {
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, OrderError> {
        self.inner.find_coupon(code).await
    }

    async fn redeem(&self, code: &str) -> Result<(), OrderError> {
        self.inner.redeem(code).await
    }

    async fn unredeem(&self, code: &str) -> Result<(), OrderError> {
        self.inner.unredeem(code).await
    }
}

#[async_trait]
impl OrderRepository for FaultyStore {
    async fn insert_order(&self, order: &Order, payment: &Payment) -> Result<(), OrderError> {
        self.inner.insert_order(order, payment).await
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, OrderError> {
        self.inner.get_order(order_id).await
    }

    async fn get_payment(&self, order_id: Uuid) -> Result<Option<Payment>, OrderError> {
        self.inner.get_payment(order_id).await
    }

    async fn transition(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        update: &TransitionUpdate,
    ) -> Result<Option<Order>, OrderError> {
        if update.release_stock && self.fail_next_release.swap(false, Ordering::SeqCst) {
            return Err(OrderError::Storage(AppError::DatabaseError(anyhow::anyhow!(
                "connection reset"
            ))));
        }
        self.inner.transition(order_id, from, to, update).await
    }

    async fn mark_payment_paid(
        &self,
        order_id: Uuid,
        gateway_payment_id: &str,
        gateway_signature: &str,
        paid_utc: DateTime<Utc>,
    ) -> Result<bool, OrderError> {
        self.inner
            .mark_payment_paid(order_id, gateway_payment_id, gateway_signature, paid_utc)
            .await
    }

    async fn claim_refund(
        &self,
        order_id: Uuid,
        order_status: OrderStatus,
    ) -> Result<bool, OrderError> {
        self.inner.claim_refund(order_id, order_status).await
    }

    async fn release_refund_claim(&self, order_id: Uuid) -> Result<bool, OrderError> {
        self.inner.release_refund_claim(order_id).await
    }

    async fn mark_payment_refunded(
        &self,
        order_id: Uuid,
        refund_id: Option<&str>,
    ) -> Result<bool, OrderError> {
        self.inner.mark_payment_refunded(order_id, refund_id).await
    }

    async fn list_expired_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, OrderError> {
        self.inner.list_expired_orders(now, limit).await
    }

    async fn append_tracking_step(
        &self,
        order_id: Uuid,
        step: &NewTrackingStep,
    ) -> Result<TrackingStep, OrderError> {
        self.inner.append_tracking_step(order_id, step).await
    }

    async fn tracking_steps(&self, order_id: Uuid) -> Result<Vec<TrackingStep>, OrderError> {
        self.inner.tracking_steps(order_id).await
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub faults: Arc<FaultyStore>,
    pub gateway: Arc<FakeGateway>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: OrderOrchestrator,
}

impl TestHarness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let gateway = Arc::new(FakeGateway::default());

        let broker = PaymentBroker::new(
            gateway.clone(),
            TEST_KEY_ID,
            Secret::new(TEST_KEY_SECRET.to_string()),
            "INR",
        );
        let orchestrator = OrderOrchestrator::new(
            faults.clone(),
            broker,
            clock.clone(),
            LifecycleSettings::default(),
        );

        Self {
            store,
            faults,
            gateway,
            clock,
            orchestrator,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            orchestrator: self.orchestrator.clone(),
            database: None,
        }
    }

    /// Seed a variant and return its key.
    pub fn add_variant(&self, name: &str, price: Decimal, stock: i64) -> VariantKey {
        let key = VariantKey::new(Uuid::new_v4(), "M", "black", "B1");
        self.store
            .add_variant(ProductVariant::new(key.clone(), name, price, stock));
        key
    }

    pub fn stock_of(&self, key: &VariantKey) -> i64 {
        self.store.variant(key).map(|v| v.stock).unwrap_or_default()
    }

    pub fn add_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        min_amount: Decimal,
        usage_limit: i32,
    ) {
        let now = self.clock.now();
        self.store.add_coupon(Coupon {
            code: code.to_string(),
            discount_type,
            value,
            min_amount,
            max_discount: None,
            valid_from: now - Duration::days(1),
            valid_to: now + Duration::days(30),
            usage_limit,
            used_count: 0,
            is_active: true,
        });
    }

    pub fn used_count(&self, code: &str) -> i32 {
        self.store.coupon(code).map(|c| c.used_count).unwrap_or_default()
    }
}

pub fn address() -> Address {
    Address {
        name: "Asha Rao".to_string(),
        phone: "9876543210".to_string(),
        line1: "12 MG Road".to_string(),
        line2: None,
        city: "Bengaluru".to_string(),
        state: "KA".to_string(),
        postal_code: "560001".to_string(),
        country: "IN".to_string(),
    }
}

pub fn order_request(
    lines: &[(&VariantKey, i32)],
    payment_method: PaymentMethod,
    coupon_code: Option<&str>,
) -> CreateOrder {
    CreateOrder {
        user_id: TEST_USER_ID.to_string(),
        items: lines
            .iter()
            .map(|(key, quantity)| NewOrderItem {
                variant: (*key).clone(),
                quantity: *quantity,
            })
            .collect(),
        shipping_address: address(),
        payment_method,
        coupon_code: coupon_code.map(str::to_string),
    }
}

/// Signature the gateway would send for a successful checkout.
pub fn sign(gateway_order_id: &str, gateway_payment_id: &str) -> String {
    generate_signature(
        TEST_KEY_SECRET,
        &gateway_callback_payload(gateway_order_id, gateway_payment_id),
    )
    .unwrap()
}

pub fn signed_callback(gateway_order_id: &str, gateway_payment_id: &str) -> PaymentCallback {
    PaymentCallback {
        gateway_order_id: Some(gateway_order_id.to_string()),
        gateway_payment_id: gateway_payment_id.to_string(),
        gateway_signature: sign(gateway_order_id, gateway_payment_id),
    }
}
