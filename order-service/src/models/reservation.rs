//! Stock reservations held on behalf of an order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::VariantKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Held,
    Committed,
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Held => "held",
            ReservationState::Committed => "committed",
            ReservationState::Released => "released",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub variant: VariantKey,
    pub quantity: i32,
}

impl ReservationLine {
    /// Merge duplicate variants and return lines sorted by variant key.
    pub fn consolidate(lines: &[ReservationLine]) -> Vec<ReservationLine> {
        let mut merged: BTreeMap<&VariantKey, i32> = BTreeMap::new();
        for line in lines {
            *merged.entry(&line.variant).or_insert(0) += line.quantity;
        }
        merged
            .into_iter()
            .map(|(variant, quantity)| ReservationLine {
                variant: variant.clone(),
                quantity,
            })
            .collect()
    }
}

/// Handle for a reservation; carries the exact quantities held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationToken {
    pub reservation_id: Uuid,
    pub order_id: Uuid,
    pub lines: Vec<ReservationLine>,
}
