//! Discount Engine
//!
//! Pure arithmetic over a cart snapshot. Promotional offers are applied per
//! qualifying line first; a coupon then applies to the post-offer subtotal.
//! The same inputs always produce the same output, so a preview quote and the
//! committed order agree to the cent.
//!
//! Coupon eligibility (expiry, usage limits, minimum spend) is checked by the
//! caller before a coupon reaches this module.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use crate::config::CheckoutConfig;
use crate::domain::aggregates::{cart, CartLine, CouponSnapshot, OrderTotals};
use crate::domain::value_objects::{percent_of, round_money, CategoryId, OfferId, ProductId, UnitId};

/// Store-defined offer applied automatically to qualifying lines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromotionalOffer {
    pub id: OfferId,
    pub name: String,
    pub target: OfferTarget,
    pub rule: OfferRule,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum OfferTarget {
    Product(ProductId),
    Category(CategoryId),
    AllItems,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OfferRule {
    /// `percent` off the line total.
    PercentOff { percent: Decimal },
    /// Flat `amount` off each unit on the line.
    AmountOffPerUnit { amount: Decimal },
}

/// A buyer-applied code, already validated by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub kind: CouponKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouponKind {
    Percentage { percent: Decimal, max_discount: Option<Decimal> },
    Fixed { amount: Decimal },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDiscount {
    pub unit_id: UnitId,
    pub amount: Decimal,
    pub offers: Vec<OfferId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountBreakdown {
    pub per_line: Vec<LineDiscount>,
    pub offer_total: Decimal,
    pub coupon_discount: Decimal,
    pub total_discount: Decimal,
}

/// Priced checkout: the numbers shown in preview and persisted on commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub subtotal: Decimal,
    pub discount: DiscountBreakdown,
    pub shipping_charge: Decimal,
    pub total: Decimal,
}

impl OfferTarget {
    fn matches(&self, line: &CartLine) -> bool {
        match self {
            Self::Product(id) => line.product_id == *id,
            Self::Category(id) => line.category_id == Some(*id),
            Self::AllItems => true,
        }
    }
}

impl OfferRule {
    fn amount_for(&self, line: &CartLine) -> Decimal {
        let amount = match self {
            Self::PercentOff { percent } => percent_of(line.line_total(), *percent),
            Self::AmountOffPerUnit { amount } => round_money(*amount * Decimal::from(line.quantity)),
        };
        amount.max(Decimal::ZERO)
    }
}

impl Coupon {
    fn discount_on(&self, amount: Decimal) -> Decimal {
        let discount = match &self.kind {
            CouponKind::Percentage { percent, max_discount } => {
                let raw = percent_of(amount, *percent);
                max_discount.map_or(raw, |cap| raw.min(cap))
            }
            CouponKind::Fixed { amount: flat } => *flat,
        };
        discount.max(Decimal::ZERO).min(amount)
    }

    pub fn snapshot(&self, discount: Decimal) -> CouponSnapshot {
        let (kind, value) = match &self.kind {
            CouponKind::Percentage { percent, .. } => ("percentage", *percent),
            CouponKind::Fixed { amount } => ("fixed", *amount),
        };
        CouponSnapshot { code: self.code.clone(), kind: kind.to_string(), value, discount }
    }
}

pub fn compute_discount(lines: &[CartLine], offers: &[PromotionalOffer], coupon: Option<&Coupon>) -> DiscountBreakdown {
    let per_line: Vec<LineDiscount> = lines.iter().map(|line| {
        let mut amount = Decimal::ZERO;
        let mut applied = vec![];
        for offer in offers.iter().filter(|o| o.target.matches(line)) {
            let off = offer.rule.amount_for(line);
            if off > Decimal::ZERO {
                amount += off;
                applied.push(offer.id);
            }
        }
        LineDiscount { unit_id: line.unit_id, amount: amount.min(line.line_total()), offers: applied }
    }).collect();

    let offer_total: Decimal = per_line.iter().map(|l| l.amount).sum();
    let after_offers = (cart::subtotal(lines) - offer_total).max(Decimal::ZERO);
    let coupon_discount = coupon.map_or(Decimal::ZERO, |c| c.discount_on(after_offers));

    DiscountBreakdown { per_line, offer_total, coupon_discount, total_discount: offer_total + coupon_discount }
}

/// Price a cart: discounts first, then shipping on the discounted amount.
pub fn quote(lines: &[CartLine], offers: &[PromotionalOffer], coupon: Option<&Coupon>, config: &CheckoutConfig) -> Quote {
    let subtotal = cart::subtotal(lines);
    let discount = compute_discount(lines, offers, coupon);
    let discounted = (subtotal - discount.total_discount).max(Decimal::ZERO);
    let shipping_charge = if lines.is_empty() || discounted >= config.free_shipping_threshold {
        Decimal::ZERO
    } else {
        config.shipping_charge
    };
    Quote { subtotal, shipping_charge, total: discounted + shipping_charge, discount }
}

impl Quote {
    pub fn totals(&self) -> OrderTotals {
        OrderTotals {
            subtotal: self.subtotal,
            discount_total: self.discount.total_discount,
            shipping_charge: self.shipping_charge,
            total: self.total,
        }
    }

    pub fn line_discounts(&self) -> Vec<Decimal> {
        self.discount.per_line.iter().map(|l| l.amount).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(product_id: ProductId, price: i64, quantity: u32) -> CartLine {
        CartLine {
            unit_id: UnitId::new(), product_id, variant_id: None, category_id: None,
            name: "Kurta".into(), sku: "K-1".into(), unit_price: Decimal::new(price, 0), quantity, bundle: None,
        }
    }

    fn offer(target: OfferTarget, rule: OfferRule) -> PromotionalOffer {
        PromotionalOffer { id: OfferId::new(), name: "Festive".into(), target, rule }
    }

    fn pct(p: i64) -> OfferRule { OfferRule::PercentOff { percent: Decimal::new(p, 0) } }

    #[test]
    fn test_offer_then_fixed_coupon() {
        let product = ProductId::new();
        let lines = vec![line(product, 500, 2)];
        let offers = vec![offer(OfferTarget::Product(product), pct(10))];
        let coupon = Coupon { code: "SAVE50".into(), kind: CouponKind::Fixed { amount: Decimal::new(50, 0) } };
        let q = quote(&lines, &offers, Some(&coupon), &CheckoutConfig::default());
        assert_eq!(q.subtotal, Decimal::new(1000, 0));
        assert_eq!(q.discount.offer_total, Decimal::new(100, 0));
        assert_eq!(q.discount.total_discount, Decimal::new(150, 0));
        assert_eq!(q.shipping_charge, Decimal::ZERO);
        assert_eq!(q.total, Decimal::new(850, 0));
    }

    #[test]
    fn test_percentage_coupon_capped() {
        let lines = vec![line(ProductId::new(), 1000, 1)];
        let coupon = Coupon { code: "BIG20".into(), kind: CouponKind::Percentage { percent: Decimal::new(20, 0), max_discount: Some(Decimal::new(150, 0)) } };
        let d = compute_discount(&lines, &[], Some(&coupon));
        assert_eq!(d.coupon_discount, Decimal::new(150, 0));
    }

    #[test]
    fn test_coupon_applies_to_post_offer_amount() {
        let lines = vec![line(ProductId::new(), 1000, 1)];
        let offers = vec![offer(OfferTarget::AllItems, pct(50))];
        let coupon = Coupon { code: "TEN".into(), kind: CouponKind::Percentage { percent: Decimal::new(10, 0), max_discount: None } };
        let d = compute_discount(&lines, &offers, Some(&coupon));
        assert_eq!(d.coupon_discount, Decimal::new(50, 0));
        assert_eq!(d.total_discount, Decimal::new(550, 0));
    }

    #[test]
    fn test_fixed_coupon_never_goes_negative() {
        let lines = vec![line(ProductId::new(), 30, 1)];
        let coupon = Coupon { code: "FLAT100".into(), kind: CouponKind::Fixed { amount: Decimal::new(100, 0) } };
        let q = quote(&lines, &[], Some(&coupon), &CheckoutConfig::default());
        assert_eq!(q.discount.coupon_discount, Decimal::new(30, 0));
        assert_eq!(q.total, Decimal::new(50, 0)); // shipping still charged below threshold
    }

    #[test]
    fn test_offers_only_touch_qualifying_lines() {
        let category = CategoryId::new();
        let mut shirt = line(ProductId::new(), 200, 1);
        shirt.category_id = Some(category);
        let socks = line(ProductId::new(), 100, 3);
        let offers = vec![
            offer(OfferTarget::Category(category), pct(25)),
            offer(OfferTarget::AllItems, OfferRule::AmountOffPerUnit { amount: Decimal::new(5, 0) }),
        ];
        let d = compute_discount(&[shirt, socks], &offers, None);
        assert_eq!(d.per_line[0].amount, Decimal::new(55, 0));
        assert_eq!(d.per_line[0].offers.len(), 2);
        assert_eq!(d.per_line[1].amount, Decimal::new(15, 0));
        assert_eq!(d.offer_total, Decimal::new(70, 0));
    }

    #[test]
    fn test_line_discount_clamped_to_line_total() {
        let lines = vec![line(ProductId::new(), 10, 1)];
        let offers = vec![offer(OfferTarget::AllItems, pct(80)), offer(OfferTarget::AllItems, pct(80))];
        let d = compute_discount(&lines, &offers, None);
        assert_eq!(d.per_line[0].amount, Decimal::new(10, 0));
    }

    #[test]
    fn test_deterministic_output() {
        let product = ProductId::new();
        let lines = vec![line(product, 333, 3), line(ProductId::new(), 17, 7)];
        let offers = vec![offer(OfferTarget::Product(product), OfferRule::PercentOff { percent: Decimal::new(125, 1) })];
        let coupon = Coupon { code: "X".into(), kind: CouponKind::Percentage { percent: Decimal::new(7, 0), max_discount: None } };
        let config = CheckoutConfig::default();
        let first = serde_json::to_string(&quote(&lines, &offers, Some(&coupon), &config)).unwrap();
        let second = serde_json::to_string(&quote(&lines, &offers, Some(&coupon), &config)).unwrap();
        assert_eq!(first, second);
    }
}
