mod common;

use chrono::Duration;
use common::{order_request, sign, signed_callback, TestHarness};
use order_service::error::{CouponError, OrderError};
use order_service::models::{
    DiscountType, NewTrackingStep, OrderStatus, PaymentMethod, PaymentStatus, TransitionError,
    VariantKey,
};
use order_service::services::orchestrator::EXPIRY_REASON;
use order_service::services::PaymentCallback;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use uuid::Uuid;

fn seed_welcome(harness: &TestHarness, usage_limit: i32) {
    harness.add_coupon(
        "WELCOME10",
        DiscountType::Percentage,
        dec!(10),
        dec!(0),
        usage_limit,
    );
}

#[tokio::test]
async fn cod_order_is_confirmed_and_commits_stock() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 2)], PaymentMethod::Cod, None))
        .await
        .unwrap();

    assert_eq!(placement.order.status, OrderStatus::Confirmed);
    assert_eq!(placement.order.subtotal, dec!(1000));
    assert_eq!(placement.order.total_amount, dec!(1000));
    assert!(placement.payment_intent.is_none());
    assert!(placement.order.expires_utc.is_none());

    let variant = harness.store.variant(&tee).unwrap();
    assert_eq!(variant.stock, 8);
    assert_eq!(variant.reserved, 0);
    assert_eq!(variant.sold_count, 2);

    let details = harness
        .orchestrator
        .get_order(placement.order.order_id)
        .await
        .unwrap();
    let payment = details.payment.unwrap();
    assert_eq!(payment.method, PaymentMethod::Cod);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.gateway_order_id.is_none());
}

#[tokio::test]
async fn duplicate_lines_are_merged_before_reserving() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(250), 5);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1), (&tee, 2)], PaymentMethod::Cod, None))
        .await
        .unwrap();

    assert_eq!(placement.order.items.len(), 1);
    assert_eq!(placement.order.items[0].quantity, 3);
    assert_eq!(placement.order.subtotal, dec!(750));
    assert_eq!(harness.stock_of(&tee), 2);
}

#[tokio::test]
async fn empty_cart_and_unknown_variant_are_rejected() {
    let harness = TestHarness::new();

    let err = harness
        .orchestrator
        .create_order(order_request(&[], PaymentMethod::Cod, None))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::EmptyCart));

    let missing = VariantKey::new(Uuid::new_v4(), "S", "red", "B9");
    let err = harness
        .orchestrator
        .create_order(order_request(&[(&missing, 1)], PaymentMethod::Cod, None))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::InsufficientStock(key) if key == missing));
}

#[tokio::test]
async fn insufficient_stock_leaves_other_lines_untouched() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);
    let cap = harness.add_variant("Cap", dec!(300), 1);

    let err = harness
        .orchestrator
        .create_order(order_request(
            &[(&tee, 2), (&cap, 2)],
            PaymentMethod::Cod,
            None,
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, OrderError::InsufficientStock(key) if key == cap));
    assert_eq!(harness.stock_of(&tee), 10);
    assert_eq!(harness.stock_of(&cap), 1);
}

#[tokio::test]
async fn coupon_quotes_follow_validation_rules() {
    let harness = TestHarness::new();
    seed_welcome(&harness, 100);
    harness.add_coupon("FLAT500", DiscountType::Fixed, dec!(500), dec!(1200), 100);

    let quote = harness
        .orchestrator
        .validate_coupon("welcome10", dec!(1000))
        .await
        .unwrap();
    assert_eq!(quote.discount_amount, dec!(100));
    assert_eq!(harness.used_count("WELCOME10"), 0);

    let err = harness
        .orchestrator
        .validate_coupon("FLAT500", dec!(1000))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrderError::Coupon(CouponError::BelowMinimum { .. })
    ));

    let err = harness
        .orchestrator
        .validate_coupon("NOPE", dec!(1000))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Coupon(CouponError::NotFound(_))));
}

#[tokio::test]
async fn online_order_with_coupon_confirms_on_valid_signature() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);
    seed_welcome(&harness, 100);

    let placement = harness
        .orchestrator
        .create_order(order_request(
            &[(&tee, 2)],
            PaymentMethod::Online,
            Some("WELCOME10"),
        ))
        .await
        .unwrap();

    let order = placement.order;
    assert_eq!(order.status, OrderStatus::Created);
    assert_eq!(order.discount_amount, dec!(100));
    assert_eq!(order.total_amount, dec!(900));
    assert!(!order.coupon_redeemed);
    assert!(order.expires_utc.is_some());

    let intent = placement.payment_intent.unwrap();
    assert_eq!(intent.amount, 90_000);
    assert_eq!(intent.currency, "INR");

    // Held, not sold, until the callback arrives.
    let variant = harness.store.variant(&tee).unwrap();
    assert_eq!((variant.stock, variant.reserved, variant.sold_count), (8, 2, 0));
    assert_eq!(harness.used_count("WELCOME10"), 0);

    let confirmed = harness
        .orchestrator
        .confirm_online_payment(
            order.order_id,
            signed_callback(&intent.gateway_order_id, "pay_001"),
        )
        .await
        .unwrap();

    assert_eq!(confirmed.status, OrderStatus::Confirmed);
    assert!(confirmed.coupon_redeemed);
    assert_eq!(harness.used_count("WELCOME10"), 1);

    let variant = harness.store.variant(&tee).unwrap();
    assert_eq!((variant.stock, variant.reserved, variant.sold_count), (8, 0, 2));

    let payment = harness
        .orchestrator
        .get_order(order.order_id)
        .await
        .unwrap()
        .payment
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.gateway_payment_id.as_deref(), Some("pay_001"));
    assert!(payment.paid_utc.is_some());
}

#[tokio::test]
async fn tampered_signature_leaves_order_pending() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 2)], PaymentMethod::Online, None))
        .await
        .unwrap();
    let gateway_order_id = placement.payment_intent.unwrap().gateway_order_id;

    let callback = PaymentCallback {
        gateway_order_id: Some(gateway_order_id.clone()),
        gateway_payment_id: "pay_001".to_string(),
        gateway_signature: sign(&gateway_order_id, "pay_other"),
    };
    let err = harness
        .orchestrator
        .confirm_online_payment(placement.order.order_id, callback)
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::SignatureMismatch));

    let details = harness
        .orchestrator
        .get_order(placement.order.order_id)
        .await
        .unwrap();
    assert_eq!(details.order.status, OrderStatus::Created);
    assert_eq!(details.payment.unwrap().status, PaymentStatus::Pending);
    assert_eq!(harness.store.variant(&tee).unwrap().reserved, 2);
}

#[tokio::test]
async fn callback_for_a_different_gateway_order_is_rejected() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Online, None))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .confirm_online_payment(
            placement.order.order_id,
            signed_callback("order_someone_else", "pay_001"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::SignatureMismatch));
}

#[tokio::test]
async fn late_callback_expires_the_order() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 2)], PaymentMethod::Online, None))
        .await
        .unwrap();
    let gateway_order_id = placement.payment_intent.unwrap().gateway_order_id;

    harness.clock.advance(Duration::minutes(31));

    let err = harness
        .orchestrator
        .confirm_online_payment(
            placement.order.order_id,
            signed_callback(&gateway_order_id, "pay_001"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::OrderExpired(id) if id == placement.order.order_id));

    let order = harness
        .orchestrator
        .get_order(placement.order.order_id)
        .await
        .unwrap()
        .order;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.cancellation_reason.as_deref(), Some(EXPIRY_REASON));
    assert_eq!(harness.stock_of(&tee), 10);
    assert_eq!(harness.store.variant(&tee).unwrap().reserved, 0);

    // A retry after expiry keeps reporting the expiry.
    let err = harness
        .orchestrator
        .confirm_online_payment(
            placement.order.order_id,
            signed_callback(&gateway_order_id, "pay_001"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::OrderExpired(_)));
}

#[tokio::test]
async fn duplicate_callback_is_idempotent() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);
    seed_welcome(&harness, 100);

    let placement = harness
        .orchestrator
        .create_order(order_request(
            &[(&tee, 2)],
            PaymentMethod::Online,
            Some("WELCOME10"),
        ))
        .await
        .unwrap();
    let gateway_order_id = placement.payment_intent.unwrap().gateway_order_id;
    let order_id = placement.order.order_id;

    for _ in 0..2 {
        let order = harness
            .orchestrator
            .confirm_online_payment(order_id, signed_callback(&gateway_order_id, "pay_001"))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
    }

    assert_eq!(harness.used_count("WELCOME10"), 1);
    assert_eq!(harness.store.variant(&tee).unwrap().sold_count, 2);

    // A different payment for an already paid order is not accepted.
    let err = harness
        .orchestrator
        .confirm_online_payment(order_id, signed_callback(&gateway_order_id, "pay_002"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrderError::InvalidTransition(TransitionError::Illegal { .. })
    ));
}

#[tokio::test]
async fn cod_orders_cannot_be_confirmed_online() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Cod, None))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .confirm_online_payment(placement.order.order_id, signed_callback("order_x", "pay_x"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Invalid(_)));
}

#[tokio::test]
async fn coupon_exhausted_before_confirmation_keeps_order_pending() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);
    seed_welcome(&harness, 1);

    let mut pending = Vec::new();
    for _ in 0..2 {
        let placement = harness
            .orchestrator
            .create_order(order_request(
                &[(&tee, 1)],
                PaymentMethod::Online,
                Some("WELCOME10"),
            ))
            .await
            .unwrap();
        pending.push((
            placement.order.order_id,
            placement.payment_intent.unwrap().gateway_order_id,
        ));
    }

    let (first, first_gateway) = &pending[0];
    harness
        .orchestrator
        .confirm_online_payment(*first, signed_callback(first_gateway, "pay_001"))
        .await
        .unwrap();

    let (second, second_gateway) = &pending[1];
    let err = harness
        .orchestrator
        .confirm_online_payment(*second, signed_callback(second_gateway, "pay_002"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrderError::Coupon(CouponError::LimitReached(_))
    ));

    let order = harness.orchestrator.get_order(*second).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Created);
    assert_eq!(harness.used_count("WELCOME10"), 1);
}

#[tokio::test]
async fn gateway_failure_releases_reservation() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);
    harness.gateway.fail_create.store(true, Ordering::SeqCst);

    let err = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 3)], PaymentMethod::Online, None))
        .await
        .unwrap_err();

    assert!(matches!(err, OrderError::GatewayUnavailable(_)));
    let variant = harness.store.variant(&tee).unwrap();
    assert_eq!((variant.stock, variant.reserved), (10, 0));
}

#[tokio::test]
async fn cancelling_a_paid_order_refunds_and_restores() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);
    seed_welcome(&harness, 100);

    let placement = harness
        .orchestrator
        .create_order(order_request(
            &[(&tee, 2)],
            PaymentMethod::Online,
            Some("WELCOME10"),
        ))
        .await
        .unwrap();
    let gateway_order_id = placement.payment_intent.unwrap().gateway_order_id;
    let order_id = placement.order.order_id;

    harness
        .orchestrator
        .confirm_online_payment(order_id, signed_callback(&gateway_order_id, "pay_001"))
        .await
        .unwrap();

    let cancelled = harness
        .orchestrator
        .cancel_order(order_id, "changed my mind")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("changed my mind"));
    assert!(!cancelled.coupon_redeemed);

    let refunds = harness.gateway.refunds.lock().unwrap().clone();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].gateway_payment_id, "pay_001");
    assert_eq!(refunds[0].amount, 90_000);

    let variant = harness.store.variant(&tee).unwrap();
    assert_eq!((variant.stock, variant.reserved, variant.sold_count), (10, 0, 0));
    assert_eq!(harness.used_count("WELCOME10"), 0);

    let payment = harness
        .orchestrator
        .get_order(order_id)
        .await
        .unwrap()
        .payment
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert_eq!(payment.refund_id.as_deref(), Some("rfnd_fake_1"));
    assert_eq!(refunds[0].receipt, payment.payment_id.to_string());
}

#[tokio::test]
async fn failed_refund_keeps_order_confirmed() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Online, None))
        .await
        .unwrap();
    let gateway_order_id = placement.payment_intent.unwrap().gateway_order_id;
    let order_id = placement.order.order_id;
    harness
        .orchestrator
        .confirm_online_payment(order_id, signed_callback(&gateway_order_id, "pay_001"))
        .await
        .unwrap();

    harness.gateway.fail_refund.store(true, Ordering::SeqCst);
    let err = harness
        .orchestrator
        .cancel_order(order_id, "changed my mind")
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::RefundFailed(_)));
    assert!(err.is_retryable());

    let details = harness.orchestrator.get_order(order_id).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Confirmed);
    assert_eq!(details.payment.unwrap().status, PaymentStatus::Paid);
    assert_eq!(harness.store.variant(&tee).unwrap().sold_count, 1);

    harness.gateway.fail_refund.store(false, Ordering::SeqCst);
    let cancelled = harness
        .orchestrator
        .cancel_order(order_id, "changed my mind")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(harness.gateway.refund_count(), 1);
}

#[tokio::test]
async fn failed_stock_release_leaves_cancel_retryable() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);
    seed_welcome(&harness, 100);

    let order_id = harness
        .orchestrator
        .create_order(order_request(
            &[(&tee, 2)],
            PaymentMethod::Cod,
            Some("WELCOME10"),
        ))
        .await
        .unwrap()
        .order
        .order_id;
    assert_eq!(harness.used_count("WELCOME10"), 1);

    harness.faults.fail_next_release.store(true, Ordering::SeqCst);
    let err = harness
        .orchestrator
        .cancel_order(order_id, "changed my mind")
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Storage(_)));

    // Nothing moved: the status change and its compensations failed together.
    let order = harness.orchestrator.get_order(order_id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert!(order.coupon_redeemed);
    assert_eq!(harness.store.variant(&tee).unwrap().sold_count, 2);
    assert_eq!(harness.used_count("WELCOME10"), 1);

    let cancelled = harness
        .orchestrator
        .cancel_order(order_id, "changed my mind")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(!cancelled.coupon_redeemed);
    let variant = harness.store.variant(&tee).unwrap();
    assert_eq!((variant.stock, variant.sold_count), (10, 0));
    assert_eq!(harness.used_count("WELCOME10"), 0);

    let err = harness
        .orchestrator
        .cancel_order(order_id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::InvalidTransition(_)));
    assert_eq!(harness.used_count("WELCOME10"), 0);
    assert_eq!(harness.stock_of(&tee), 10);
}

#[tokio::test]
async fn failed_stock_release_leaves_expiry_for_the_next_sweep() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let order_id = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 3)], PaymentMethod::Online, None))
        .await
        .unwrap()
        .order
        .order_id;
    harness.clock.advance(Duration::minutes(31));

    harness.faults.fail_next_release.store(true, Ordering::SeqCst);
    let expired = harness
        .orchestrator
        .expire_pending_orders(harness.orchestrator.now())
        .await
        .unwrap();
    assert_eq!(expired, 0);
    let order = harness.orchestrator.get_order(order_id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Created);
    assert_eq!(harness.stock_of(&tee), 7);

    let expired = harness
        .orchestrator
        .expire_pending_orders(harness.orchestrator.now())
        .await
        .unwrap();
    assert_eq!(expired, 1);
    let variant = harness.store.variant(&tee).unwrap();
    assert_eq!((variant.stock, variant.reserved), (10, 0));
}

#[tokio::test]
async fn pending_online_order_is_not_customer_cancellable() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Online, None))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .cancel_order(placement.order.order_id, "too slow")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrderError::InvalidTransition(TransitionError::Illegal {
            from: OrderStatus::Created,
            ..
        })
    ));
}

#[tokio::test]
async fn shipped_orders_are_too_late_to_cancel() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let order_id = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Cod, None))
        .await
        .unwrap()
        .order
        .order_id;

    harness.orchestrator.start_processing(order_id).await.unwrap();
    let shipped = harness
        .orchestrator
        .mark_shipped(order_id, "AWB123456")
        .await
        .unwrap();
    assert_eq!(shipped.awb.as_deref(), Some("AWB123456"));

    let err = harness
        .orchestrator
        .cancel_order(order_id, "changed my mind")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrderError::InvalidTransition(TransitionError::TooLateToCancel {
            from: OrderStatus::Shipped
        })
    ));
    assert_eq!(err.code(), "too_late_to_cancel");
}

#[tokio::test]
async fn processing_orders_can_still_be_cancelled() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let order_id = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 4)], PaymentMethod::Cod, None))
        .await
        .unwrap()
        .order
        .order_id;
    harness.orchestrator.start_processing(order_id).await.unwrap();

    let cancelled = harness
        .orchestrator
        .cancel_order(order_id, "address change")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(harness.stock_of(&tee), 10);
    assert_eq!(harness.gateway.refund_count(), 0);
}

async fn delivered_cod_order(harness: &TestHarness, key: &VariantKey) -> Uuid {
    let order_id = harness
        .orchestrator
        .create_order(order_request(&[(key, 1)], PaymentMethod::Cod, None))
        .await
        .unwrap()
        .order
        .order_id;
    harness.orchestrator.start_processing(order_id).await.unwrap();
    harness.orchestrator.mark_shipped(order_id, "AWB1").await.unwrap();
    harness
        .orchestrator
        .mark_delivered(order_id, None)
        .await
        .unwrap();
    order_id
}

#[tokio::test]
async fn returns_respect_the_return_window() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let prompt = delivered_cod_order(&harness, &tee).await;
    let requested = harness
        .orchestrator
        .return_order(prompt, "wrong size")
        .await
        .unwrap();
    assert_eq!(requested.status, OrderStatus::ReturnRequested);

    let undelivered = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Cod, None))
        .await
        .unwrap()
        .order
        .order_id;
    let err = harness
        .orchestrator
        .return_order(undelivered, "wrong size")
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::InvalidTransition(_)));

    let late = delivered_cod_order(&harness, &tee).await;
    harness.clock.advance(Duration::days(8));
    let err = harness
        .orchestrator
        .return_order(late, "wrong size")
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::ReturnWindowClosed));

    let order = harness.orchestrator.get_order(late).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn approved_cod_return_is_refunded_manually() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let order_id = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 2)], PaymentMethod::Cod, None))
        .await
        .unwrap()
        .order
        .order_id;
    harness.orchestrator.start_processing(order_id).await.unwrap();
    harness.orchestrator.mark_shipped(order_id, "AWB1").await.unwrap();
    let delivered = harness
        .orchestrator
        .mark_delivered(order_id, None)
        .await
        .unwrap();
    assert!(delivered.delivered_utc.is_some());

    harness.clock.advance(Duration::days(3));
    let requested = harness
        .orchestrator
        .return_order(order_id, "wrong size")
        .await
        .unwrap();
    assert_eq!(requested.status, OrderStatus::ReturnRequested);
    assert_eq!(requested.return_reason.as_deref(), Some("wrong size"));

    let returned = harness.orchestrator.approve_return(order_id).await.unwrap();
    assert_eq!(returned.status, OrderStatus::Returned);
    assert_eq!(harness.stock_of(&tee), 10);

    let refunded = harness.orchestrator.process_refund(order_id).await.unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert_eq!(harness.gateway.refund_count(), 0);

    let payment = harness
        .orchestrator
        .get_order(order_id)
        .await
        .unwrap()
        .payment
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert!(payment.refund_id.is_none());
}

#[tokio::test]
async fn approved_online_return_is_refunded_through_gateway() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Online, None))
        .await
        .unwrap();
    let order_id = placement.order.order_id;
    let gateway_order_id = placement.payment_intent.unwrap().gateway_order_id;
    harness
        .orchestrator
        .confirm_online_payment(order_id, signed_callback(&gateway_order_id, "pay_001"))
        .await
        .unwrap();

    harness.orchestrator.start_processing(order_id).await.unwrap();
    harness.orchestrator.mark_shipped(order_id, "AWB1").await.unwrap();
    harness
        .orchestrator
        .mark_delivered(order_id, None)
        .await
        .unwrap();
    harness
        .orchestrator
        .return_order(order_id, "damaged")
        .await
        .unwrap();
    harness.orchestrator.approve_return(order_id).await.unwrap();

    let refunded = harness.orchestrator.process_refund(order_id).await.unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);

    let refunds = harness.gateway.refunds.lock().unwrap().clone();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, 50_000);

    // Refunding twice is an illegal transition, not a second gateway call.
    let err = harness.orchestrator.process_refund(order_id).await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidTransition(_)));
    assert_eq!(harness.gateway.refund_count(), 1);
}

#[tokio::test]
async fn expiry_sweep_cancels_only_overdue_orders() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let mut overdue = Vec::new();
    for _ in 0..2 {
        overdue.push(
            harness
                .orchestrator
                .create_order(order_request(&[(&tee, 2)], PaymentMethod::Online, None))
                .await
                .unwrap()
                .order
                .order_id,
        );
    }
    harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Cod, None))
        .await
        .unwrap();
    assert_eq!(harness.stock_of(&tee), 5);

    harness.clock.advance(Duration::minutes(10));
    let fresh = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Online, None))
        .await
        .unwrap()
        .order
        .order_id;

    harness.clock.advance(Duration::minutes(25));
    let now = harness.orchestrator.now();
    assert_eq!(harness.orchestrator.expire_pending_orders(now).await.unwrap(), 2);
    assert_eq!(harness.orchestrator.expire_pending_orders(now).await.unwrap(), 0);

    for order_id in overdue {
        let order = harness.orchestrator.get_order(order_id).await.unwrap().order;
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancellation_reason.as_deref(), Some(EXPIRY_REASON));
    }
    let order = harness.orchestrator.get_order(fresh).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Created);
    assert_eq!(harness.stock_of(&tee), 8);
}

#[tokio::test]
async fn tracking_steps_are_listed_with_the_order() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let order_id = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Cod, None))
        .await
        .unwrap()
        .order
        .order_id;

    let now = harness.orchestrator.now();
    for (status, label) in [("packed", "Packed at warehouse"), ("in_transit", "Left hub")] {
        harness
            .orchestrator
            .append_tracking_step(
                order_id,
                NewTrackingStep {
                    status: status.to_string(),
                    label: label.to_string(),
                    step_utc: now,
                    completed: true,
                },
            )
            .await
            .unwrap();
    }

    let details = harness.orchestrator.get_order(order_id).await.unwrap();
    let seqs: Vec<_> = details.tracking.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(details.tracking[1].status, "in_transit");
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let harness = TestHarness::new();
    let missing = Uuid::new_v4();

    let err = harness.orchestrator.get_order(missing).await.unwrap_err();
    assert!(matches!(err, OrderError::OrderNotFound(id) if id == missing));

    let err = harness.orchestrator.start_processing(missing).await.unwrap_err();
    assert!(matches!(err, OrderError::OrderNotFound(_)));
}

#[tokio::test]
async fn zero_total_online_order_is_rejected_before_reserving() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);
    harness.add_coupon("FREEBIE", DiscountType::Percentage, dec!(100), dec!(0), 10);

    let err = harness
        .orchestrator
        .create_order(order_request(
            &[(&tee, 1)],
            PaymentMethod::Online,
            Some("FREEBIE"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Invalid(_)));
    assert_eq!(harness.gateway.orders_created.load(Ordering::SeqCst), 0);
    assert_eq!(harness.stock_of(&tee), 10);
    assert_eq!(harness.used_count("FREEBIE"), 0);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Cod, Some("FREEBIE")))
        .await
        .unwrap();
    assert_eq!(placement.order.total_amount, dec!(0));
    assert_eq!(placement.order.status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn store_timestamps_follow_the_injected_clock() {
    let harness = TestHarness::new();
    let tee = harness.add_variant("Classic Tee", dec!(500), 10);

    let placement = harness
        .orchestrator
        .create_order(order_request(&[(&tee, 1)], PaymentMethod::Online, None))
        .await
        .unwrap();
    let gateway_order_id = placement.payment_intent.unwrap().gateway_order_id;
    let order_id = placement.order.order_id;

    harness.clock.advance(Duration::minutes(5));
    let confirmed = harness
        .orchestrator
        .confirm_online_payment(order_id, signed_callback(&gateway_order_id, "pay_001"))
        .await
        .unwrap();
    assert_eq!(confirmed.updated_utc, harness.orchestrator.now());

    let payment = harness
        .orchestrator
        .get_order(order_id)
        .await
        .unwrap()
        .payment
        .unwrap();
    assert_eq!(payment.updated_utc, harness.orchestrator.now());
    assert_eq!(payment.paid_utc, Some(harness.orchestrator.now()));

    harness.clock.advance(Duration::hours(2));
    let processing = harness.orchestrator.start_processing(order_id).await.unwrap();
    assert_eq!(processing.updated_utc, harness.orchestrator.now());
}
