//! Order aggregate and its lifecycle state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::VariantKey;

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// ONLINE order waiting for the gateway callback. Stock is held, not committed.
    Created,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    ReturnRequested,
    Returned,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::ReturnRequested => "return_requested",
            OrderStatus::Returned => "returned",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Resolve the next state for `event`, or explain why it is not allowed.
    pub fn apply(self, event: OrderEvent) -> Result<OrderStatus, TransitionError> {
        use OrderEvent as E;
        use OrderStatus as S;

        match (self, event) {
            (S::Created, E::PaymentVerified) => Ok(S::Confirmed),
            (S::Created, E::Expire) => Ok(S::Cancelled),
            (S::Confirmed | S::Processing, E::Cancel) => Ok(S::Cancelled),
            (S::Shipped | S::Delivered, E::Cancel) => {
                Err(TransitionError::TooLateToCancel { from: self })
            }
            (S::Confirmed, E::StartProcessing) => Ok(S::Processing),
            (S::Processing, E::Ship) => Ok(S::Shipped),
            (S::Shipped, E::Deliver) => Ok(S::Delivered),
            (S::Delivered, E::RequestReturn) => Ok(S::ReturnRequested),
            (S::ReturnRequested, E::ApproveReturn) => Ok(S::Returned),
            (S::Returned, E::RefundProcessed) => Ok(S::Refunded),
            (from, event) => Err(TransitionError::Illegal { from, event }),
        }
    }

    /// States a refund in flight may still move the order into. Every other
    /// transition waits until the refund settles.
    pub fn closes_refund(self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Something that happens to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEvent {
    PaymentVerified,
    Expire,
    Cancel,
    StartProcessing,
    Ship,
    Deliver,
    RequestReturn,
    ApproveReturn,
    RefundProcessed,
}

impl OrderEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEvent::PaymentVerified => "payment_verified",
            OrderEvent::Expire => "expire",
            OrderEvent::Cancel => "cancel",
            OrderEvent::StartProcessing => "start_processing",
            OrderEvent::Ship => "ship",
            OrderEvent::Deliver => "deliver",
            OrderEvent::RequestReturn => "request_return",
            OrderEvent::ApproveReturn => "approve_return",
            OrderEvent::RefundProcessed => "refund_processed",
        }
    }
}

impl std::fmt::Display for OrderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Order is already {from}; it can no longer be cancelled, request a return instead")]
    TooLateToCancel { from: OrderStatus },

    #[error("Cannot apply '{event}' to an order that is {from}")]
    Illegal { from: OrderStatus, event: OrderEvent },
}

impl TransitionError {
    pub fn from_status(&self) -> OrderStatus {
        match self {
            TransitionError::TooLateToCancel { from } => *from,
            TransitionError::Illegal { from, .. } => *from,
        }
    }
}

/// How the customer pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Cod,
    Online,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cod => "COD",
            PaymentMethod::Online => "ONLINE",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shipping address snapshot, copied into the order at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub phone: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

/// Purchased line with price and name frozen at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: Uuid,
    #[serde(flatten)]
    pub variant: VariantKey,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl OrderItem {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Cart line as requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    #[serde(flatten)]
    pub variant: VariantKey,
    pub quantity: i32,
}

/// Order aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub user_id: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub coupon_code: Option<String>,
    /// Set once this order has consumed a unit of its coupon's usage limit.
    pub coupon_redeemed: bool,
    pub shipping_address: Address,
    pub reservation_id: Uuid,
    pub awb: Option<String>,
    pub cancellation_reason: Option<String>,
    pub return_reason: Option<String>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub delivered_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn is_payment_window_open(&self, now: DateTime<Utc>) -> bool {
        match self.expires_utc {
            Some(expires) => now <= expires,
            None => true,
        }
    }
}

/// Column changes applied together with a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionUpdate {
    pub coupon_redeemed: Option<bool>,
    pub awb: Option<String>,
    pub cancellation_reason: Option<String>,
    pub return_reason: Option<String>,
    pub delivered_utc: Option<DateTime<Utc>>,
    /// Return the order's reservation to stock in the same write.
    pub release_stock: bool,
    /// Give back the coupon use this order holds, if any, and clear
    /// `coupon_redeemed`.
    pub return_coupon: bool,
}

impl TransitionUpdate {
    pub fn apply_to(&self, order: &mut Order) {
        if let Some(redeemed) = self.coupon_redeemed {
            order.coupon_redeemed = redeemed;
        }
        if self.return_coupon {
            order.coupon_redeemed = false;
        }
        if let Some(awb) = &self.awb {
            order.awb = Some(awb.clone());
        }
        if let Some(reason) = &self.cancellation_reason {
            order.cancellation_reason = Some(reason.clone());
        }
        if let Some(reason) = &self.return_reason {
            order.return_reason = Some(reason.clone());
        }
        if let Some(at) = self.delivered_utc {
            order.delivered_utc = Some(at);
        }
    }
}
