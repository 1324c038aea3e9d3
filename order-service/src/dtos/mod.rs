//! Request and response bodies for the HTTP API.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{Address, NewOrderItem, NewTrackingStep, PaymentMethod, VariantKey};
use crate::services::{CreateOrder, PaymentCallback};

/// Envelope shared by every successful response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub cart_subtotal: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CouponQuoteResponse {
    pub code: String,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddressRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 6, max = 20))]
    pub phone: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    #[validate(length(max = 255))]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 100))]
    pub state: String,
    #[validate(length(min = 3, max = 12))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 56))]
    pub country: String,
}

impl From<AddressRequest> for Address {
    fn from(req: AddressRequest) -> Self {
        Address {
            name: req.name,
            phone: req.phone,
            line1: req.line1,
            line2: req.line2,
            city: req.city,
            state: req.state,
            postal_code: req.postal_code,
            country: req.country,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    #[validate(length(min = 1, max = 32))]
    pub size: String,
    #[validate(length(min = 1, max = 64))]
    pub color: String,
    #[validate(length(min = 1, max = 64))]
    pub batch_no: String,
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(length(max = 50), nested)]
    pub items: Vec<OrderItemRequest>,
    #[validate(nested)]
    pub shipping_address: AddressRequest,
    pub payment_method: PaymentMethod,
    #[validate(length(max = 64))]
    pub coupon_code: Option<String>,
}

impl From<CreateOrderRequest> for CreateOrder {
    fn from(req: CreateOrderRequest) -> Self {
        CreateOrder {
            user_id: req.user_id,
            items: req
                .items
                .into_iter()
                .map(|item| NewOrderItem {
                    variant: VariantKey::new(item.product_id, item.size, item.color, item.batch_no),
                    quantity: item.quantity,
                })
                .collect(),
            shipping_address: req.shipping_address.into(),
            payment_method: req.payment_method,
            coupon_code: req.coupon_code,
        }
    }
}

/// Checkout completion as posted by the client after the gateway widget closes.
#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmPaymentRequest {
    #[serde(default, alias = "razorpay_order_id")]
    #[validate(length(min = 1, max = 64))]
    pub gateway_order_id: Option<String>,
    #[serde(alias = "razorpay_payment_id")]
    #[validate(length(min = 1, max = 64))]
    pub gateway_payment_id: String,
    #[serde(alias = "razorpay_signature")]
    #[validate(length(min = 1, max = 128))]
    pub gateway_signature: String,
}

impl From<ConfirmPaymentRequest> for PaymentCallback {
    fn from(req: ConfirmPaymentRequest) -> Self {
        PaymentCallback {
            gateway_order_id: req.gateway_order_id,
            gateway_payment_id: req.gateway_payment_id,
            gateway_signature: req.gateway_signature,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReasonRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ShipOrderRequest {
    #[validate(length(min = 1, max = 64))]
    pub awb: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliverOrderRequest {
    #[serde(default)]
    pub delivered_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TrackingStepRequest {
    #[validate(length(min = 1, max = 32))]
    pub status: String,
    #[validate(length(min = 1, max = 255))]
    pub label: String,
    #[serde(default)]
    pub step_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
}

impl TrackingStepRequest {
    pub fn into_step(self, now: DateTime<Utc>) -> NewTrackingStep {
        NewTrackingStep {
            status: self.status,
            label: self.label,
            step_utc: self.step_utc.unwrap_or(now),
            completed: self.completed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExpireOrdersResponse {
    pub expired: usize,
}
