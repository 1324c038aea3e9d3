//! Payment record, one per order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::PaymentMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    /// A gateway refund is in flight for this payment.
    Refunding,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunding => "refunding",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment attached to an order.
///
/// COD orders carry a marker row with no gateway identifiers.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub status: PaymentStatus,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    #[serde(skip_serializing)]
    pub gateway_signature: Option<String>,
    pub refund_id: Option<String>,
    pub paid_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Payment {
    pub fn pending(
        order_id: Uuid,
        method: PaymentMethod,
        amount: Decimal,
        currency: &str,
        gateway_order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            payment_id: Uuid::new_v4(),
            order_id,
            status: PaymentStatus::Pending,
            method,
            amount,
            currency: currency.to_string(),
            gateway_order_id,
            gateway_payment_id: None,
            gateway_signature: None,
            refund_id: None,
            paid_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}
