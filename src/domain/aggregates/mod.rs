//! Aggregates module
pub mod hold;
pub mod stock;
pub mod order;
pub mod cart;

pub use hold::{Hold, HoldRequest, HoldState};
pub use stock::{Availability, StockUnit};
pub use order::{
    AddressSnapshot, CouponSnapshot, DeliveryRecord, DeliveryStatus, Order, OrderRecord, OrderError,
    OrderLineItem, OrderStatus, OrderTotals, PaymentMethod, PaymentOutcome, PaymentRecord, PaymentStatus,
};
pub use cart::{BundleRef, CartLine};
