//! Cart snapshot handed to checkout by the cart collaborator

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;
use crate::domain::aggregates::hold::HoldRequest;
use crate::domain::value_objects::{round_money, BundleId, CategoryId, ProductId, UnitId, VariantId};

/// One cart line with the price the buyer saw.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct CartLine {
    pub unit_id: UnitId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub category_id: Option<CategoryId>,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 64))]
    pub sku: String,
    pub unit_price: Decimal,
    #[validate(range(min = 1, max = 999))]
    pub quantity: u32,
    #[serde(default)]
    pub bundle: Option<BundleRef>,
}

/// Membership of a line in a multi-item promotional bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub id: BundleId,
    pub name: String,
}

impl CartLine {
    pub fn line_total(&self) -> Decimal { round_money(self.unit_price * Decimal::from(self.quantity)) }
}

pub fn subtotal(lines: &[CartLine]) -> Decimal {
    lines.iter().map(CartLine::line_total).sum()
}

/// One request per unit; repeated lines for the same unit are summed (saturating).
pub fn hold_requests(lines: &[CartLine]) -> Vec<HoldRequest> {
    let mut per_unit: BTreeMap<UnitId, u32> = BTreeMap::new();
    for line in lines {
        let total = per_unit.entry(line.unit_id).or_default();
        *total = total.saturating_add(line.quantity);
    }
    per_unit.into_iter().map(|(unit_id, quantity)| HoldRequest { unit_id, quantity }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(unit_id: UnitId, price: i64, quantity: u32) -> CartLine {
        CartLine {
            unit_id, product_id: ProductId::new(), variant_id: None, category_id: None,
            name: "Widget".into(), sku: "W-1".into(), unit_price: Decimal::new(price, 0), quantity, bundle: None,
        }
    }

    #[test]
    fn test_requests_merge_repeated_units() {
        let u1 = UnitId::new();
        let u2 = UnitId::new();
        let lines = vec![line(u1, 10, 2), line(u2, 5, 1), line(u1, 10, 3)];
        let requests = hold_requests(&lines);
        assert_eq!(requests.len(), 2);
        let q1 = requests.iter().find(|r| r.unit_id == u1).unwrap().quantity;
        assert_eq!(q1, 5);
        assert_eq!(subtotal(&lines), Decimal::new(55, 0));
    }

    #[test]
    fn test_merged_quantity_saturates() {
        let u = UnitId::new();
        let requests = hold_requests(&[line(u, 1, u32::MAX), line(u, 1, 7)]);
        assert_eq!(requests[0].quantity, u32::MAX);
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let l = line(UnitId::new(), 10, 0);
        assert!(l.validate().is_err());
    }
}
