//! End-to-end checkout runs against the in-process ledger and store.

use chrono::Duration;
use opensase_checkout::checkout::{
    CheckoutStore, MemoryStore, PaymentGateway, PaymentGatewayError, PaymentHandoff, PaymentRequest,
};
use opensase_checkout::discount::{Coupon, CouponKind, OfferRule, OfferTarget, PromotionalOffer};
use opensase_checkout::domain::aggregates::{
    AddressSnapshot, CartLine, HoldState, OrderStatus, PaymentMethod, PaymentStatus,
};
use opensase_checkout::domain::events::CheckoutEvent;
use opensase_checkout::domain::value_objects::{BuyerId, OfferId, ProductId, UnitId};
use opensase_checkout::{
    CheckoutConfig, CheckoutCoordinator, CheckoutError, CheckoutOutcome, CheckoutRequest, ContactInfo, ManualClock,
    MemoryLedger, Signals, StockLedger,
};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ScriptedGateway {
    requests: Mutex<Vec<PaymentRequest>>,
}

impl PaymentGateway for ScriptedGateway {
    async fn begin(&self, request: &PaymentRequest) -> Result<PaymentHandoff, PaymentGatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(PaymentHandoff { reference: format!("rzp_{}", request.order_number), redirect_url: None })
    }
}

type Coordinator = CheckoutCoordinator<MemoryLedger, MemoryStore, ScriptedGateway>;

struct Shop {
    coordinator: Arc<Coordinator>,
    gateway: Arc<ScriptedGateway>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

impl Shop {
    fn with_window(window: Duration) -> Self {
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(MemoryLedger::new(clock.clone(), window));
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let coordinator = CheckoutCoordinator::new(
            ledger, store.clone(), gateway.clone(), Signals::default(), clock.clone(), CheckoutConfig::default(),
        );
        Self { coordinator: Arc::new(coordinator), gateway, store, clock }
    }

    fn new() -> Self { Self::with_window(CheckoutConfig::default().hold_window) }

    async fn stock(&self, quantity: u32) -> UnitId {
        let unit = UnitId::new();
        self.coordinator.ledger().set_available(&unit, &ProductId::new(), None, quantity).await.unwrap();
        unit
    }

    async fn free(&self, unit: &UnitId) -> u32 {
        self.coordinator.ledger().availability(unit).await.unwrap().free
    }
}

fn line(unit_id: UnitId, price: i64, quantity: u32) -> CartLine {
    CartLine {
        unit_id, product_id: ProductId::new(), variant_id: None, category_id: None,
        name: "Handloom saree".into(), sku: "SAR-7".into(), unit_price: Decimal::new(price, 0), quantity, bundle: None,
    }
}

fn checkout_request(buyer_id: BuyerId, lines: Vec<CartLine>, payment_method: PaymentMethod) -> CheckoutRequest {
    CheckoutRequest {
        buyer_id,
        contact: ContactInfo { name: "Anika".into(), email: "anika@example.com".into(), phone: "9988776655".into() },
        lines,
        shipping_address: AddressSnapshot {
            name: "Anika".into(), phone: "9988776655".into(), line1: "7 Park Street".into(), line2: Some("Flat 3B".into()),
            city: "Kolkata".into(), state: "WB".into(), postal_code: "700016".into(),
        },
        payment_method,
        offers: vec![],
        coupon: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_unit_goes_to_exactly_one_buyer() {
    let shop = Shop::new();
    let unit = shop.stock(1).await;
    let tasks: Vec<_> = (0..2).map(|_| {
        let coordinator = shop.coordinator.clone();
        tokio::spawn(async move { coordinator.ensure_holds(&BuyerId::new(), &[line(unit, 999, 1)]).await })
    }).collect();

    let mut won = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => won += 1,
            Err(CheckoutError::QuantityUnavailable(lines)) => {
                assert_eq!(lines[0].available, 0);
                refused += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((won, refused), (1, 1));
    assert_eq!(shop.free(&unit).await, 0);
}

#[tokio::test]
async fn test_shrinking_cart_returns_stock_to_others() {
    let shop = Shop::new();
    let unit = shop.stock(10).await;
    let a = BuyerId::new();
    let b = BuyerId::new();
    shop.coordinator.ensure_holds(&a, &[line(unit, 100, 3)]).await.unwrap();
    assert_eq!(shop.free(&unit).await, 7);

    let holds = shop.coordinator.ensure_holds(&a, &[line(unit, 100, 1)]).await.unwrap();
    assert_eq!(holds.len(), 1);
    assert_eq!(holds[0].quantity, 1);
    shop.coordinator.ensure_holds(&b, &[line(unit, 100, 9)]).await.unwrap();
    assert_eq!(shop.free(&unit).await, 0);
}

#[tokio::test]
async fn test_offer_and_coupon_priced_order() {
    let shop = Shop::new();
    let unit = shop.stock(5).await;
    let cart = vec![line(unit, 500, 2)];
    let mut request = checkout_request(BuyerId::new(), cart.clone(), PaymentMethod::CashOnDelivery);
    request.offers = vec![PromotionalOffer {
        id: OfferId::new(),
        name: "Festive 10".into(),
        target: OfferTarget::Product(cart[0].product_id),
        rule: OfferRule::PercentOff { percent: Decimal::new(10, 0) },
    }];
    request.coupon = Some(Coupon { code: "SAVE50".into(), kind: CouponKind::Fixed { amount: Decimal::new(50, 0) } });

    let preview = shop.coordinator.quote(&request.lines, &request.offers, request.coupon.as_ref());
    assert_eq!(preview.discount.total_discount, Decimal::new(150, 0));
    assert_eq!(preview.shipping_charge, Decimal::ZERO);
    assert_eq!(preview.total, Decimal::new(850, 0));

    let order = shop.coordinator.checkout(request).await.unwrap().order().clone();
    assert_eq!(order.subtotal, Decimal::new(1000, 0));
    assert_eq!(order.discount_total, Decimal::new(150, 0));
    assert_eq!(order.total, preview.total);
    assert_eq!(order.coupon.as_ref().map(|c| c.discount), Some(Decimal::new(50, 0)));
    let record = shop.coordinator.order(order.id).await.unwrap();
    assert_eq!(record.items[0].discount, Decimal::new(100, 0));
    assert_eq!(record.delivery.cod_amount, Some(Decimal::new(850, 0)));
}

#[tokio::test]
async fn test_declined_card_releases_hold() {
    let shop = Shop::new();
    let unit = shop.stock(2).await;
    let buyer = BuyerId::new();
    let outcome = shop.coordinator.checkout(checkout_request(buyer, vec![line(unit, 250, 2)], PaymentMethod::Online)).await.unwrap();
    let CheckoutOutcome::AwaitingPayment { order, .. } = outcome else { panic!("expected payment hand-off") };
    {
        let requests = shop.gateway.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, order.total);
        assert_eq!(requests[0].contact.email, "anika@example.com");
    }
    assert_eq!(shop.free(&unit).await, 0);

    let failed = shop.coordinator.payment_failed(order.id, "card_declined".into()).await.unwrap();
    assert_eq!(failed.payment_status, PaymentStatus::Failed);
    assert_eq!(failed.status, OrderStatus::PaymentFailed);
    let holds = shop.coordinator.ledger().holds_for(&buyer).await.unwrap();
    assert_eq!(holds[0].state, HoldState::Released);

    let record = shop.coordinator.order(order.id).await.unwrap();
    assert_eq!(record.payment.unwrap().failure_reason.as_deref(), Some("card_declined"));
    shop.coordinator.ensure_holds(&BuyerId::new(), &[line(unit, 250, 2)]).await.unwrap();
}

#[tokio::test]
async fn test_cash_on_delivery_sells_the_stock() {
    let shop = Shop::new();
    let unit = shop.stock(2).await;
    let buyer = BuyerId::new();
    let cart = vec![line(unit, 150, 2)];
    shop.store.put_cart(buyer, cart.clone()).await;

    let outcome = shop.coordinator.checkout(checkout_request(buyer, cart, PaymentMethod::CashOnDelivery)).await.unwrap();
    let CheckoutOutcome::Completed { order } = outcome else { panic!("expected immediate completion") };
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert!(shop.store.cart(&buyer).await.is_empty());
    assert!(shop.gateway.requests.lock().unwrap().is_empty());

    let record = shop.store.load(&order.id).await.unwrap().unwrap();
    assert_eq!(record.payment.map(|p| p.status), Some(PaymentStatus::Pending));
    let holds = shop.coordinator.ledger().holds_for(&buyer).await.unwrap();
    assert_eq!((holds[0].state, holds[0].order_id), (HoldState::Finalized, Some(order.id)));

    let err = shop.coordinator.ensure_holds(&BuyerId::new(), &[line(unit, 150, 1)]).await.unwrap_err();
    assert!(matches!(err, CheckoutError::QuantityUnavailable(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossing_and_duplicate_callbacks_resolve_once() {
    let shop = Shop::new();
    let unit = shop.stock(3).await;
    let buyer = BuyerId::new();
    let outcome = shop.coordinator.checkout(checkout_request(buyer, vec![line(unit, 80, 3)], PaymentMethod::Online)).await.unwrap();
    let order_id = outcome.order().id;

    let mut tasks = vec![];
    for i in 0..6 {
        let coordinator = shop.coordinator.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                coordinator.payment_succeeded(order_id, Some(format!("pay_{i}"))).await
            } else {
                coordinator.payment_failed(order_id, "cancelled".into()).await
            }
        }));
    }
    let mut statuses = vec![];
    for task in tasks {
        statuses.push(task.await.unwrap().unwrap().payment_status);
    }
    let settled = shop.coordinator.order(order_id).await.unwrap().order.payment_status;
    assert!(settled == PaymentStatus::Paid || settled == PaymentStatus::Failed);

    let holds = shop.coordinator.ledger().holds_for(&buyer).await.unwrap();
    assert_eq!(holds.len(), 1);
    match settled {
        PaymentStatus::Paid => assert_eq!(holds[0].state, HoldState::Finalized),
        _ => assert_eq!(holds[0].state, HoldState::Released),
    }
    assert!(statuses.iter().all(|s| *s == settled));
}

#[tokio::test]
async fn test_lapsed_hold_requires_revalidation() {
    let shop = Shop::with_window(Duration::zero());
    let unit = shop.stock(1).await;
    let err = shop.coordinator
        .checkout(checkout_request(BuyerId::new(), vec![line(unit, 40, 1)], PaymentMethod::CashOnDelivery))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::HoldExpired(ref units) if units == &vec![unit]));
    assert_eq!(shop.store.order_count().await, 0);
    assert_eq!(shop.free(&unit).await, 1);
}

#[tokio::test]
async fn test_paid_after_resale_is_refunded_not_confirmed() {
    let shop = Shop::new();
    let unit = shop.stock(1).await;
    let first = BuyerId::new();
    let second = BuyerId::new();
    let pending = shop.coordinator
        .checkout(checkout_request(first, vec![line(unit, 700, 1)], PaymentMethod::Online))
        .await
        .unwrap();
    let order_id = pending.order().id;

    shop.clock.advance(Duration::seconds(181));
    let resold = shop.coordinator
        .checkout(checkout_request(second, vec![line(unit, 700, 1)], PaymentMethod::CashOnDelivery))
        .await
        .unwrap();
    assert_eq!(resold.order().status, OrderStatus::Confirmed);

    let mut rx = shop.coordinator.signals().subscribe();
    let late = shop.coordinator.payment_succeeded(order_id, Some("pay_late".into())).await.unwrap();
    assert_eq!(late.payment_status, PaymentStatus::Paid);
    assert_eq!(late.status, OrderStatus::Unfulfillable);
    assert!(matches!(rx.try_recv().unwrap(), CheckoutEvent::RefundRequired { order_id: id, .. } if id == order_id));
    assert!(rx.try_recv().is_err());

    let holds = shop.coordinator.ledger().holds_for(&first).await.unwrap();
    assert!(holds.iter().all(|h| h.state != HoldState::Finalized));
    assert_eq!(shop.free(&unit).await, 0);
    assert_eq!(shop.coordinator.ledger().availability(&unit).await.unwrap().held_quantity, 1);

    let again = shop.coordinator.payment_succeeded(order_id, Some("pay_late".into())).await.unwrap();
    assert_eq!(again.status, OrderStatus::Unfulfillable);
}
