mod common;

use std::collections::BTreeMap;
use std::net::IpAddr;

use assert_matches::assert_matches;
use common::{checkout, signed_callback, test_config, PromoSeed, TestApp, HASH_SECRET, MERCHANT_CODE, RETURN_URL};
use rust_decimal_macros::dec;
use techstore_api::{
    auth::AuthUser,
    entities::{
        order::{self, OrderStatus, PaymentMethod, PaymentStatus},
        promo_code::PromoType,
    },
    errors::ServiceError,
    services::{
        orders::CreateOrderInput,
        payment_gateway::signing::{self, SECURE_HASH},
    },
};
use url::Url;
use uuid::Uuid;

fn client_ip() -> IpAddr {
    "::ffff:203.0.113.9".parse().expect("ip")
}

async fn gateway_order(app: &TestApp, user_id: Uuid, price: i64) -> order::Model {
    let product = app.seed_product("Noise Cancelling Headphones", price, 10).await;
    app.add_to_cart(user_id, &product, 1).await;
    app.state
        .services
        .orders
        .create_order(
            user_id,
            CreateOrderInput {
                payment_method: Some(PaymentMethod::RedirectGateway),
                ..checkout("45 Tran Hung Dao")
            },
        )
        .await
        .expect("create order")
        .order
}

fn callback_for(order: &order::Model, code: &str, transaction_no: &str) -> std::collections::HashMap<String, String> {
    let amount = (order.total * 100).to_string();
    signed_callback(&[
        ("vnp_TmnCode", MERCHANT_CODE),
        ("vnp_TxnRef", order.order_number.as_str()),
        ("vnp_Amount", amount.as_str()),
        ("vnp_ResponseCode", code),
        ("vnp_TransactionNo", transaction_no),
        ("vnp_BankCode", "NCB"),
        ("vnp_OrderInfo", "Thanh toan don hang"),
    ])
}

#[tokio::test]
async fn payment_url_carries_every_signed_field() {
    let app = TestApp::new().await;
    let user = app.seed_user(Some("0901234567")).await;
    let order = gateway_order(&app, user.id, 300_000).await;

    let payment_url = app
        .state
        .services
        .payments
        .create_payment_request(AuthUser::customer(user.id), &order.id.to_string(), client_ip())
        .await
        .expect("payment url");

    let parsed = Url::parse(&payment_url).expect("valid url");
    assert_eq!(parsed.host_str(), Some("sandbox.vnpayment.vn"));
    let mut params: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();

    assert_eq!(params["vnp_Amount"], "35000000");
    assert_eq!(params["vnp_TxnRef"], order.order_number);
    assert_eq!(params["vnp_TmnCode"], MERCHANT_CODE);
    assert_eq!(params["vnp_ReturnUrl"], RETURN_URL);
    assert_eq!(params["vnp_IpAddr"], "203.0.113.9");
    assert_eq!(params["vnp_CurrCode"], "VND");
    assert_eq!(params["vnp_Command"], "pay");
    assert_eq!(params["vnp_CreateDate"].len(), 14);
    assert!(params["vnp_ExpireDate"] > params["vnp_CreateDate"]);

    let signature = params.remove(SECURE_HASH).expect("signature present");
    assert_eq!(signature.len(), 128);
    assert!(signing::verify(HASH_SECRET, &params, &signature).expect("verify"));
}

#[tokio::test]
async fn payment_requests_are_refused_for_unpayable_orders() {
    let app = TestApp::new().await;
    let user = app.seed_user(Some("0901234567")).await;
    let stranger = app.seed_user(Some("0907654321")).await;
    let payments = &app.state.services.payments;

    let gateway = gateway_order(&app, user.id, 300_000).await;
    assert_matches!(
        payments
            .create_payment_request(AuthUser::customer(stranger.id), &gateway.id.to_string(), client_ip())
            .await,
        Err(ServiceError::Forbidden(_))
    );

    let product = app.seed_product("Power Bank", 400_000, 5).await;
    app.add_to_cart(user.id, &product, 1).await;
    let cod = app
        .state
        .services
        .orders
        .create_order(user.id, checkout("45 Tran Hung Dao"))
        .await
        .expect("cod order")
        .order;
    assert_matches!(
        payments
            .create_payment_request(AuthUser::customer(user.id), &cod.order_number, client_ip())
            .await,
        Err(ServiceError::InvalidOperation(_))
    );

    app.state
        .services
        .orders
        .cancel_order(AuthUser::customer(user.id), &gateway.order_number)
        .await
        .expect("cancel");
    assert_matches!(
        payments
            .create_payment_request(AuthUser::customer(user.id), &gateway.order_number, client_ip())
            .await,
        Err(ServiceError::InvalidOperation(_))
    );

    assert_matches!(
        payments
            .create_payment_request(AuthUser::customer(user.id), "TS-00000000-000000-0000", client_ip())
            .await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn tiny_totals_are_below_the_gateway_minimum() {
    let app = TestApp::new().await;
    let user = app.seed_user(Some("0901234567")).await;
    app.seed_promo(PromoSeed::new("FREESHIP", PromoType::FreeShipping, dec!(0)))
        .await;
    let sticker = app.seed_product("Sticker", 1_000, 10).await;
    app.add_to_cart(user.id, &sticker, 1).await;
    let order = app
        .state
        .services
        .orders
        .create_order(
            user.id,
            CreateOrderInput {
                payment_method: Some(PaymentMethod::RedirectGateway),
                promo_code: Some("FREESHIP".to_string()),
                ..checkout("45 Tran Hung Dao")
            },
        )
        .await
        .expect("create order")
        .order;
    assert_eq!(order.total, 1_000);

    let result = app
        .state
        .services
        .payments
        .build_payment_url(&order, client_ip(), chrono::Utc::now());

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn missing_credentials_are_a_configuration_error() {
    let mut cfg = test_config();
    cfg.payment_gateway.hash_secret = None;
    let app = TestApp::with_config(cfg).await;
    let user = app.seed_user(Some("0901234567")).await;
    let order = gateway_order(&app, user.id, 300_000).await;
    let payments = &app.state.services.payments;

    assert_matches!(
        payments
            .create_payment_request(AuthUser::customer(user.id), &order.order_number, client_ip())
            .await,
        Err(ServiceError::ConfigurationError(_))
    );
    assert_matches!(
        payments.handle_callback(&callback_for(&order, "00", "1")).await,
        Err(ServiceError::ConfigurationError(_))
    );
    assert_eq!(app.order(order.id).await.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn successful_callback_settles_once() {
    let app = TestApp::new().await;
    let user = app.seed_user(Some("0901234567")).await;
    let order = gateway_order(&app, user.id, 300_000).await;
    let payments = &app.state.services.payments;
    let callback = callback_for(&order, "00", "14012345");

    let outcome = payments.handle_callback(&callback).await.expect("callback");
    assert!(outcome.success);
    assert_eq!(outcome.order_id, order.id);
    assert_eq!(outcome.payment_status, PaymentStatus::Paid);
    assert_eq!(outcome.payment_provider.as_deref(), Some("vnpay"));
    assert_eq!(outcome.payment_transaction_id.as_deref(), Some("14012345"));

    let settled = app.order(order.id).await;
    let replay = payments.handle_callback(&callback).await.expect("replay");
    assert!(replay.success);
    assert_eq!(app.order(order.id).await.updated_at, settled.updated_at);

    let late_failure = payments
        .handle_callback(&callback_for(&order, "24", "14099999"))
        .await
        .expect("late failure");
    assert!(!late_failure.success);
    assert_eq!(late_failure.response_code, "24");
    assert_eq!(late_failure.payment_status, PaymentStatus::Paid);

    let stored = app.order(order.id).await;
    assert_eq!(stored.payment_status, PaymentStatus::Paid);
    assert_eq!(stored.payment_transaction_id.as_deref(), Some("14012345"));
    assert_eq!(stored.order_status, OrderStatus::Pending);

    assert_matches!(
        payments
            .create_payment_request(AuthUser::customer(user.id), &order.order_number, client_ip())
            .await,
        Err(ServiceError::InvalidOperation(msg)) if msg.contains("paid")
    );
}

#[tokio::test]
async fn failed_payment_can_be_retried() {
    let app = TestApp::new().await;
    let user = app.seed_user(Some("0901234567")).await;
    let order = gateway_order(&app, user.id, 300_000).await;
    let payments = &app.state.services.payments;

    let failed = payments
        .handle_callback(&callback_for(&order, "51", ""))
        .await
        .expect("failure callback");
    assert!(!failed.success);
    assert_eq!(failed.payment_status, PaymentStatus::Failed);
    assert_eq!(failed.payment_transaction_id, None);

    let paid = payments
        .handle_callback(&callback_for(&order, "00", "14055555"))
        .await
        .expect("success callback");
    assert!(paid.success);
    assert_eq!(app.order(order.id).await.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn tampered_callbacks_never_touch_the_order() {
    let app = TestApp::new().await;
    let user = app.seed_user(Some("0901234567")).await;
    let order = gateway_order(&app, user.id, 300_000).await;
    let payments = &app.state.services.payments;

    let mut forged = callback_for(&order, "24", "14012345");
    forged.insert("vnp_ResponseCode".to_string(), "00".to_string());
    assert_matches!(
        payments.handle_callback(&forged).await,
        Err(ServiceError::Unauthorized(_))
    );

    let mut unsigned = callback_for(&order, "00", "14012345");
    unsigned.remove(SECURE_HASH);
    assert_matches!(
        payments.handle_callback(&unsigned).await,
        Err(ServiceError::Unauthorized(_))
    );

    let mut garbage = callback_for(&order, "00", "14012345");
    garbage.insert(SECURE_HASH.to_string(), "not-hex".to_string());
    assert_matches!(
        payments.handle_callback(&garbage).await,
        Err(ServiceError::Unauthorized(_))
    );

    let stored = app.order(order.id).await;
    assert_eq!(stored.payment_status, PaymentStatus::Pending);
    assert_eq!(stored.payment_provider, None);
}

#[tokio::test]
async fn signed_callback_with_wrong_amount_is_rejected() {
    let app = TestApp::new().await;
    let user = app.seed_user(Some("0901234567")).await;
    let order = gateway_order(&app, user.id, 300_000).await;

    let callback = signed_callback(&[
        ("vnp_TxnRef", order.order_number.as_str()),
        ("vnp_Amount", "100"),
        ("vnp_ResponseCode", "00"),
        ("vnp_TransactionNo", "14012345"),
    ]);

    assert_matches!(
        app.state.services.payments.handle_callback(&callback).await,
        Err(ServiceError::Unauthorized(msg)) if msg.contains("amount")
    );
    assert_eq!(app.order(order.id).await.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn callback_reference_may_be_the_order_id() {
    let app = TestApp::new().await;
    let user = app.seed_user(Some("0901234567")).await;
    let order = gateway_order(&app, user.id, 300_000).await;
    let payments = &app.state.services.payments;

    let reference = order.id.simple().to_string();
    let amount = (order.total * 100).to_string();
    let callback = signed_callback(&[
        ("vnp_TxnRef", reference.as_str()),
        ("vnp_Amount", amount.as_str()),
        ("vnp_ResponseCode", "00"),
        ("vnp_TransactionNo", "14077777"),
    ]);
    let outcome = payments.handle_callback(&callback).await.expect("callback");
    assert_eq!(outcome.order_number, order.order_number);
    assert!(outcome.success);

    let unknown = signed_callback(&[
        ("vnp_TxnRef", "TS-19990101-000000-0000"),
        ("vnp_ResponseCode", "00"),
    ]);
    assert_matches!(
        payments.handle_callback(&unknown).await,
        Err(ServiceError::NotFound(_))
    );
}
