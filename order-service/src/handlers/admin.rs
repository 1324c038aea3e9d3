//! Fulfilment and back-office operations.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    ApiResponse, DeliverOrderRequest, ExpireOrdersResponse, ShipOrderRequest, TrackingStepRequest,
};
use crate::error::OrderError;
use crate::models::{Order, TrackingStep};
use crate::startup::AppState;

pub async fn start_processing(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Order>>, OrderError> {
    let order = state.orchestrator.start_processing(order_id).await?;
    Ok(Json(ApiResponse::ok("Order is being processed", order)))
}

pub async fn mark_shipped(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ShipOrderRequest>,
) -> Result<Json<ApiResponse<Order>>, OrderError> {
    request.validate().map_err(AppError::from)?;

    let order = state
        .orchestrator
        .mark_shipped(order_id, &request.awb)
        .await?;
    Ok(Json(ApiResponse::ok("Order shipped", order)))
}

pub async fn mark_delivered(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<DeliverOrderRequest>,
) -> Result<Json<ApiResponse<Order>>, OrderError> {
    let order = state
        .orchestrator
        .mark_delivered(order_id, request.delivered_utc)
        .await?;
    Ok(Json(ApiResponse::ok("Order delivered", order)))
}

pub async fn approve_return(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Order>>, OrderError> {
    let order = state.orchestrator.approve_return(order_id).await?;
    Ok(Json(ApiResponse::ok("Return approved", order)))
}

pub async fn process_refund(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Order>>, OrderError> {
    let order = state.orchestrator.process_refund(order_id).await?;
    Ok(Json(ApiResponse::ok("Refund processed", order)))
}

pub async fn append_tracking_step(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<TrackingStepRequest>,
) -> Result<(StatusCode, Json<ApiResponse<TrackingStep>>), OrderError> {
    request.validate().map_err(AppError::from)?;

    let now = state.orchestrator.now();
    let step = state
        .orchestrator
        .append_tracking_step(order_id, request.into_step(now))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok("Tracking step recorded", step)),
    ))
}

pub async fn expire_pending_orders(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ExpireOrdersResponse>>, OrderError> {
    let now = state.orchestrator.now();
    let expired = state.orchestrator.expire_pending_orders(now).await?;
    Ok(Json(ApiResponse::ok(
        format!("{} unpaid orders expired", expired),
        ExpireOrdersResponse { expired },
    )))
}
