//! Product variant model for the stock ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Identity of a purchasable SKU: product × size × color × batch.
///
/// Ordering is total so multi-variant reservations can lock rows in a
/// stable order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, FromRow)]
pub struct VariantKey {
    pub product_id: Uuid,
    pub size: String,
    pub color: String,
    pub batch_no: String,
}

impl VariantKey {
    pub fn new(
        product_id: Uuid,
        size: impl Into<String>,
        color: impl Into<String>,
        batch_no: impl Into<String>,
    ) -> Self {
        Self {
            product_id,
            size: size.into(),
            color: color.into(),
            batch_no: batch_no.into(),
        }
    }
}

impl std::fmt::Display for VariantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.product_id, self.size, self.color, self.batch_no
        )
    }
}

/// Stock ledger row.
///
/// `stock` is what can still be reserved; `reserved` is held by checkouts
/// that have not been committed yet.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductVariant {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub key: VariantKey,
    pub product_name: String,
    pub price: Decimal,
    pub stock: i64,
    pub reserved: i64,
    pub sold_count: i64,
}

impl ProductVariant {
    pub fn new(key: VariantKey, product_name: impl Into<String>, price: Decimal, stock: i64) -> Self {
        Self {
            key,
            product_name: product_name.into(),
            price,
            stock,
            reserved: 0,
            sold_count: 0,
        }
    }
}
