use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{ApiResponse, ConfirmPaymentRequest, CreateOrderRequest, ReasonRequest};
use crate::error::OrderError;
use crate::models::{Order, OrderStatus};
use crate::services::{OrderDetails, OrderPlacement};
use crate::startup::AppState;

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderPlacement>>), OrderError> {
    request.validate().map_err(AppError::from)?;

    let placement = state.orchestrator.create_order(request.into()).await?;
    let message = match placement.order.status {
        OrderStatus::Created => "Order created; awaiting payment",
        _ => "Order placed",
    };

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(message, placement))))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderDetails>>, OrderError> {
    let details = state.orchestrator.get_order(order_id).await?;
    Ok(Json(ApiResponse::ok("Order found", details)))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Json<ApiResponse<Order>>, OrderError> {
    request.validate().map_err(AppError::from)?;

    let order = state
        .orchestrator
        .confirm_online_payment(order_id, request.into())
        .await?;
    Ok(Json(ApiResponse::ok("Payment confirmed", order)))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<ApiResponse<Order>>, OrderError> {
    request.validate().map_err(AppError::from)?;

    let order = state
        .orchestrator
        .cancel_order(order_id, &request.reason)
        .await?;
    Ok(Json(ApiResponse::ok("Order cancelled", order)))
}

pub async fn return_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<ApiResponse<Order>>, OrderError> {
    request.validate().map_err(AppError::from)?;

    let order = state
        .orchestrator
        .return_order(order_id, &request.reason)
        .await?;
    Ok(Json(ApiResponse::ok("Return requested", order)))
}
