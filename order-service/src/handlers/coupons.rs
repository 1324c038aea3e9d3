use axum::{extract::State, Json};
use rust_decimal::Decimal;
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{ApiResponse, CouponQuoteResponse, ValidateCouponRequest};
use crate::error::OrderError;
use crate::startup::AppState;

pub async fn validate_coupon(
    State(state): State<AppState>,
    Json(request): Json<ValidateCouponRequest>,
) -> Result<Json<ApiResponse<CouponQuoteResponse>>, OrderError> {
    request.validate().map_err(AppError::from)?;

    let quote = state
        .orchestrator
        .validate_coupon(&request.code, request.cart_subtotal)
        .await?;

    let response = CouponQuoteResponse {
        code: quote.coupon.code,
        discount_amount: quote.discount_amount,
        final_amount: (request.cart_subtotal - quote.discount_amount).max(Decimal::ZERO),
    };

    Ok(Json(ApiResponse::ok(quote.message, response)))
}
