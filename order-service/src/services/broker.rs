//! Payment handshake: intent creation, callback verification and refunds.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use service_core::utils::signature::{gateway_callback_payload, verify_signature};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::services::gateway::{GatewayError, PaymentGateway};

/// Prefill data handed to the checkout widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutCustomer {
    pub user_id: String,
    pub name: String,
    pub contact: String,
}

/// What the client needs to open the gateway checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentIntent {
    pub order_id: Uuid,
    pub gateway_order_id: String,
    /// Smallest currency unit.
    pub amount: u64,
    pub currency: String,
    pub key_id: String,
    pub customer: CheckoutCustomer,
}

#[derive(Clone)]
pub struct PaymentBroker {
    gateway: Arc<dyn PaymentGateway>,
    key_id: String,
    key_secret: Secret<String>,
    currency: String,
}

impl PaymentBroker {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        key_id: impl Into<String>,
        key_secret: Secret<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            key_id: key_id.into(),
            key_secret,
            currency: currency.into(),
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    #[instrument(skip(self, customer), fields(amount = %amount))]
    pub async fn create_intent(
        &self,
        order_id: Uuid,
        amount: Decimal,
        customer: CheckoutCustomer,
    ) -> Result<PaymentIntent, OrderError> {
        let minor = to_minor_units(amount)?;

        let gateway_order = self
            .gateway
            .create_order(minor, &self.currency, &order_id.to_string())
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to create gateway order");
                OrderError::GatewayUnavailable(e.to_string())
            })?;

        info!(gateway_order_id = %gateway_order.id, "Payment intent created");

        Ok(PaymentIntent {
            order_id,
            gateway_order_id: gateway_order.id,
            amount: minor,
            currency: self.currency.clone(),
            key_id: self.key_id.clone(),
            customer,
        })
    }

    /// Check the gateway's HMAC-SHA256 over `gateway_order_id|gateway_payment_id`.
    pub fn verify_callback(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> Result<(), OrderError> {
        let secret = self.key_secret.expose_secret();
        if secret.is_empty() {
            return Err(OrderError::GatewayUnavailable(
                GatewayError::NotConfigured.to_string(),
            ));
        }

        let payload = gateway_callback_payload(gateway_order_id, gateway_payment_id);
        let verified = verify_signature(secret, &payload, signature)
            .map_err(|e| OrderError::Storage(e.into()))?;

        if verified {
            info!(gateway_order_id, gateway_payment_id, "Payment signature verified");
            Ok(())
        } else {
            warn!(gateway_order_id, gateway_payment_id, "Payment signature mismatch");
            Err(OrderError::SignatureMismatch)
        }
    }

    /// Refund `amount` of a captured payment; returns the gateway refund id.
    #[instrument(skip(self), fields(amount = %amount))]
    pub async fn refund(
        &self,
        gateway_payment_id: &str,
        amount: Decimal,
        receipt: &str,
    ) -> Result<String, OrderError> {
        let minor = to_minor_units(amount)?;

        let refund = self
            .gateway
            .refund(gateway_payment_id, minor, receipt)
            .await
            .map_err(|e| {
                warn!(error = %e, "Refund failed");
                OrderError::RefundFailed(e.to_string())
            })?;

        info!(refund_id = %refund.id, "Refund issued");
        Ok(refund.id)
    }
}

/// Convert a major-unit amount to the gateway's smallest unit (×100).
pub fn to_minor_units(amount: Decimal) -> Result<u64, OrderError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(OrderError::Invalid(format!(
            "Amount {} cannot be negative",
            amount
        )));
    }

    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .ok_or_else(|| OrderError::Invalid(format!("Amount {} is out of range", amount)))
}
