//! Shipment tracking steps reported by the shipping collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only tracking entry. `seq` orders steps within an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TrackingStep {
    pub order_id: Uuid,
    pub seq: i32,
    pub status: String,
    pub label: String,
    pub step_utc: DateTime<Utc>,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrackingStep {
    pub status: String,
    pub label: String,
    pub step_utc: DateTime<Utc>,
    pub completed: bool,
}
