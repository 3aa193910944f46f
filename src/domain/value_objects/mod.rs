//! Value Objects for checkout

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self { Self(Uuid::now_v7()) }
            pub fn from_uuid(id: Uuid) -> Self { Self(id) }
            pub fn as_uuid(&self) -> Uuid { self.0 }
        }

        impl Default for $name {
            fn default() -> Self { Self::new() }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self { Self(id) }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
        }
    };
}

uuid_id!(
    /// Authenticated shopper.
    BuyerId
);
uuid_id!(
    /// A purchasable stock unit: a product, or one variant of it.
    UnitId
);
uuid_id!(ProductId);
uuid_id!(VariantId);
uuid_id!(CategoryId);
uuid_id!(OrderId);
uuid_id!(HoldId);
uuid_id!(OfferId);
uuid_id!(BundleId);

/// Human-facing order number, e.g. `ORD-20261014-5F3A09C1D2`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Date prefix keeps numbers sortable for support staff; the suffix is 40 random bits.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string()[..10].to_uppercase();
        Self(format!("ORD-{}-{}", now.format("%Y%m%d"), suffix))
    }

    pub fn from_string(value: impl Into<String>) -> Self { Self(value.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

const MONEY_DP: u32 = 2;

/// Round a monetary amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// `percent`% of `amount`, rounded to cents.
pub fn percent_of(amount: Decimal, percent: Decimal) -> Decimal {
    round_money(amount * percent / Decimal::ONE_HUNDRED)
}
