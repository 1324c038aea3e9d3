//! Payment gateway seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order created on the gateway side; the client completes checkout against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    /// Smallest currency unit (paise for INR).
    pub amount: u64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub payment_id: String,
    pub amount: u64,
    pub status: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Payment gateway credentials not configured")]
    NotConfigured,

    #[error("Payment gateway unreachable: {0}")]
    Transport(String),

    #[error("Payment gateway rejected the request: {code} - {description}")]
    Rejected { code: String, description: String },
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// External payment provider reached over request/callback.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a gateway order for `amount` minor units.
    ///
    /// `receipt` is our order id; the gateway echoes it back.
    async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, GatewayError>;

    /// Refund a captured payment. `receipt` deduplicates retried refunds.
    async fn refund(
        &self,
        gateway_payment_id: &str,
        amount: u64,
        receipt: &str,
    ) -> Result<GatewayRefund, GatewayError>;
}
