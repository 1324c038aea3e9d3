//! Promotional coupon model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// How a coupon's `value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// `value` percent of the cart subtotal, optionally capped by `max_discount`.
    Percentage,
    /// `value` off the subtotal, never more than the subtotal itself.
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }
}

impl std::fmt::Display for DiscountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coupon definition plus its redemption counter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    /// Stored upper-cased; lookups are case-insensitive.
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub min_amount: Decimal,
    pub max_discount: Option<Decimal>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub usage_limit: i32,
    pub used_count: i32,
    pub is_active: bool,
}

impl Coupon {
    /// Canonical form of a coupon code.
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_uppercase()
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_count >= self.usage_limit
    }

    /// Inclusive on both ends.
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_from && now <= self.valid_to
    }
}
