//! Coupon evaluation against a cart snapshot.
//!
//! Validation never touches `used_count`; redemption is a separate, atomic
//! step performed by the store once an order is confirmed.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::error::CouponError;
use crate::models::{Coupon, DiscountType};

/// Outcome of a successful validation.
#[derive(Debug, Clone, Serialize)]
pub struct CouponQuote {
    pub coupon: Coupon,
    pub discount_amount: Decimal,
    pub message: String,
}

/// Check `coupon` (the lookup result for `code`) against a cart subtotal.
///
/// Checks run in a fixed order: existence, active flag, validity window,
/// minimum amount, usage limit.
pub fn validate(
    coupon: Option<&Coupon>,
    code: &str,
    cart_subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<CouponQuote, CouponError> {
    let code = Coupon::normalize_code(code);
    let coupon = coupon
        .filter(|c| c.code.eq_ignore_ascii_case(&code))
        .ok_or_else(|| CouponError::NotFound(code.clone()))?;

    if !coupon.is_active {
        return Err(CouponError::Inactive(code));
    }
    if !coupon.is_within_window(now) {
        return Err(CouponError::OutOfWindow(code));
    }
    if cart_subtotal < coupon.min_amount {
        return Err(CouponError::BelowMinimum {
            code,
            min_amount: coupon.min_amount,
        });
    }
    if coupon.is_exhausted() {
        return Err(CouponError::LimitReached(code));
    }

    let discount_amount = discount_for(coupon, cart_subtotal);

    Ok(CouponQuote {
        message: format!("Coupon {} applied: you save {}", coupon.code, discount_amount),
        coupon: coupon.clone(),
        discount_amount,
    })
}

/// Discount for a subtotal, clamped to `[0, subtotal]` and rounded to cents.
pub fn discount_for(coupon: &Coupon, cart_subtotal: Decimal) -> Decimal {
    let subtotal = cart_subtotal.max(Decimal::ZERO);

    let raw = match coupon.discount_type {
        DiscountType::Percentage => {
            let pct = subtotal * coupon.value / Decimal::ONE_HUNDRED;
            match coupon.max_discount {
                Some(cap) => pct.min(cap),
                None => pct,
            }
        }
        DiscountType::Fixed => coupon.value,
    };

    raw.max(Decimal::ZERO)
        .min(subtotal)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
