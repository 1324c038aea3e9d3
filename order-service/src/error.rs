//! Error taxonomy for order lifecycle operations.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use service_core::error::{AppError, ErrorBody};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{TransitionError, VariantKey};

/// Reasons a coupon cannot be applied to a cart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponError {
    #[error("Coupon '{0}' does not exist")]
    NotFound(String),

    #[error("Coupon '{0}' is no longer active")]
    Inactive(String),

    #[error("Coupon '{0}' is not valid at this time")]
    OutOfWindow(String),

    #[error("Coupon '{code}' requires a minimum cart value of {min_amount}")]
    BelowMinimum { code: String, min_amount: Decimal },

    #[error("Coupon '{0}' has reached its usage limit")]
    LimitReached(String),
}

impl CouponError {
    pub fn code(&self) -> &'static str {
        match self {
            CouponError::NotFound(_) => "coupon_not_found",
            CouponError::Inactive(_) => "coupon_inactive",
            CouponError::OutOfWindow(_) => "coupon_out_of_window",
            CouponError::BelowMinimum { .. } => "coupon_below_minimum",
            CouponError::LimitReached(_) => "coupon_limit_reached",
        }
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Coupon(#[from] CouponError),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("{0}")]
    Invalid(String),

    #[error("Insufficient stock for variant {0}")]
    InsufficientStock(VariantKey),

    #[error("The return window for this order has closed")]
    ReturnWindowClosed,

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment signature verification failed")]
    SignatureMismatch,

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Payment window for order {0} has expired")]
    OrderExpired(Uuid),

    #[error("Reservation {0} was already released")]
    ReservationReleased(Uuid),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl OrderError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            OrderError::Coupon(err) => err.code(),
            OrderError::EmptyCart => "empty_cart",
            OrderError::Invalid(_) => "invalid_request",
            OrderError::InsufficientStock(_) => "insufficient_stock",
            OrderError::ReturnWindowClosed => "return_window_closed",
            OrderError::GatewayUnavailable(_) => "gateway_unavailable",
            OrderError::SignatureMismatch => "signature_mismatch",
            OrderError::RefundFailed(_) => "refund_failed",
            OrderError::InvalidTransition(TransitionError::TooLateToCancel { .. }) => {
                "too_late_to_cancel"
            }
            OrderError::InvalidTransition(TransitionError::Illegal { .. }) => "invalid_transition",
            OrderError::OrderNotFound(_) => "order_not_found",
            OrderError::OrderExpired(_) => "order_expired",
            OrderError::ReservationReleased(_) => "reservation_released",
            OrderError::Storage(_) => "storage_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            OrderError::Coupon(_)
            | OrderError::EmptyCart
            | OrderError::Invalid(_)
            | OrderError::ReturnWindowClosed
            | OrderError::SignatureMismatch => StatusCode::BAD_REQUEST,
            OrderError::InsufficientStock(_)
            | OrderError::InvalidTransition(_)
            | OrderError::ReservationReleased(_) => StatusCode::CONFLICT,
            OrderError::OrderNotFound(_) => StatusCode::NOT_FOUND,
            OrderError::OrderExpired(_) => StatusCode::GONE,
            OrderError::GatewayUnavailable(_) | OrderError::RefundFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            OrderError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the same request may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrderError::GatewayUnavailable(_)
                | OrderError::RefundFailed(_)
                | OrderError::Storage(_)
        )
    }
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        match self {
            OrderError::Storage(err) => err.into_response(),
            other => {
                let status = other.status_code();
                ErrorBody::new(other.code(), other.to_string()).into_response(status)
            }
        }
    }
}
