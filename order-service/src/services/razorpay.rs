//! Razorpay payment provider client.
//!
//! Implements Razorpay's Orders API for payment initiation and the Refunds
//! API for cancellations and returns.

use crate::config::GatewayConfig;
use crate::services::gateway::{GatewayError, GatewayOrder, GatewayRefund, PaymentGateway};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Razorpay client for interacting with the Razorpay API.
#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    config: GatewayConfig,
}

/// Request to create a Razorpay order.
#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    /// Amount in smallest currency unit (paise for INR).
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    payment_capture: u8,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    amount: u64,
    currency: String,
    receipt: Option<String>,
    status: String,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    amount: u64,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct RazorpayRefund {
    id: String,
    payment_id: String,
    amount: u64,
    status: String,
}

/// Razorpay API error response.
#[derive(Debug, Deserialize)]
struct RazorpayError {
    error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorDetail {
    code: String,
    description: String,
}

impl RazorpayClient {
    pub fn new(config: GatewayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    /// Check if Razorpay is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let url = format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path);

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, path = %path, "Razorpay response");

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                GatewayError::Transport(format!("Malformed Razorpay response: {}", e))
            });
        }

        let detail = serde_json::from_str::<RazorpayError>(&body)
            .map(|e| e.error)
            .unwrap_or_else(|_| RazorpayErrorDetail {
                code: "UNKNOWN".to_string(),
                description: body.clone(),
            });

        tracing::error!(
            status = %status,
            code = %detail.code,
            description = %detail.description,
            "Razorpay request failed"
        );

        if status.is_server_error() {
            Err(GatewayError::Transport(format!(
                "{} - {}",
                detail.code, detail.description
            )))
        } else {
            Err(GatewayError::Rejected {
                code: detail.code,
                description: detail.description,
            })
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        let request = CreateOrderRequest {
            amount,
            currency,
            receipt,
            payment_capture: 1,
        };

        let order: RazorpayOrder = self.post("/orders", &request).await?;

        tracing::info!(
            gateway_order_id = %order.id,
            amount = order.amount,
            currency = %order.currency,
            "Razorpay order created"
        );

        Ok(GatewayOrder {
            id: order.id,
            amount: order.amount,
            currency: order.currency,
            receipt: order.receipt,
            status: order.status,
        })
    }

    async fn refund(
        &self,
        gateway_payment_id: &str,
        amount: u64,
        receipt: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        let request = RefundRequest { amount, receipt };
        let path = format!("/payments/{}/refund", gateway_payment_id);

        let refund: RazorpayRefund = self.post(&path, &request).await?;

        tracing::info!(
            refund_id = %refund.id,
            gateway_payment_id = %refund.payment_id,
            amount = refund.amount,
            "Razorpay refund created"
        );

        Ok(GatewayRefund {
            id: refund.id,
            payment_id: refund.payment_id,
            amount: refund.amount,
            status: refund.status,
        })
    }
}
