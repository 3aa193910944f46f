//! OpenSASE Checkout
//!
//! Inventory reservation and order commit for the OpenSASE storefront.
//!
//! ## Features
//! - Stock ledger with time-boxed holds that never oversell
//! - Hold re-validation on every cart change
//! - Deterministic offer and coupon pricing
//! - Atomic order commit with cash-on-delivery and online payment branches
//!
//! Holds count against stock until they lapse, are released, or are
//! finalized by a paid or cash-on-delivery order. A lapsed hold stops
//! counting the moment its window ends; the background sweep only tidies
//! up rows.

pub mod api;
pub mod checkout;
pub mod clock;
pub mod config;
pub mod discount;
pub mod domain;
pub mod error;
pub mod holds;
pub mod ledger;
pub mod notify;

pub use checkout::{CheckoutCoordinator, CheckoutOutcome, CheckoutRequest, CheckoutState, ContactInfo};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CheckoutConfig, Config};
pub use error::{CheckoutError, Result};
pub use holds::{HoldManager, LineShortage};
pub use ledger::{LedgerError, MemoryLedger, PgLedger, StockLedger};
pub use notify::Signals;
