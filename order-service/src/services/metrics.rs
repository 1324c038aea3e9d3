//! Business metrics for order-service.
//!
//! Recorded through the `metrics` facade; the Prometheus recorder installed
//! by `service_core::observability::init_metrics` exports them on `/metrics`.
//! Labels stay low-cardinality: no order, user or coupon identifiers.

use metrics::{counter, histogram};
use std::time::Instant;

use crate::models::{OrderStatus, PaymentMethod};

pub const ORDERS_CREATED_TOTAL: &str = "orders_created_total";
pub const ORDERS_TRANSITIONS_TOTAL: &str = "orders_transitions_total";
pub const STOCK_RESERVATIONS_TOTAL: &str = "stock_reservations_total";
pub const COUPON_REDEMPTIONS_TOTAL: &str = "coupon_redemptions_total";
pub const PAYMENT_VERIFICATIONS_TOTAL: &str = "payment_verifications_total";
pub const DB_QUERY_DURATION: &str = "order_db_query_duration_seconds";

pub fn record_order_created(method: PaymentMethod) {
    counter!(ORDERS_CREATED_TOTAL, "payment_method" => method.as_str()).increment(1);
}

pub fn record_transition(from: OrderStatus, to: OrderStatus) {
    counter!(
        ORDERS_TRANSITIONS_TOTAL,
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// `outcome` is one of `reserved`, `insufficient`, `released`, `committed`.
pub fn record_reservation(outcome: &'static str) {
    counter!(STOCK_RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// `outcome` is one of `redeemed`, `limit_reached`, `unredeemed`.
pub fn record_coupon_redemption(outcome: &'static str) {
    counter!(COUPON_REDEMPTIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// `outcome` is one of `verified`, `mismatch`, `expired`.
pub fn record_payment_verification(outcome: &'static str) {
    counter!(PAYMENT_VERIFICATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Query timer, observed into `order_db_query_duration_seconds{operation}`.
pub struct QueryTimer {
    operation: &'static str,
    started: Instant,
}

impl QueryTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }

    pub fn observe_duration(self) {
        histogram!(DB_QUERY_DURATION, "operation" => self.operation)
            .record(self.started.elapsed().as_secs_f64());
    }
}
