mod common;

use assert_matches::assert_matches;
use common::{PromoSeed, TestApp};
use rust_decimal_macros::dec;
use techstore_api::{
    entities::promo_code::PromoType,
    errors::ServiceError,
    services::promotions::PromoRejection,
};

#[tokio::test]
async fn lookup_ignores_case_and_whitespace() {
    let app = TestApp::new().await;
    app.seed_promo(PromoSeed::new("SUMMER10", PromoType::Percentage, dec!(10)))
        .await;

    let found = app
        .state
        .services
        .promotions
        .find_by_code("  summer10 ")
        .await
        .expect("lookup");

    assert_eq!(found.map(|p| p.code).as_deref(), Some("SUMMER10"));
}

#[tokio::test]
async fn validation_preview_does_not_record_usage() {
    let app = TestApp::new().await;
    let promo = app
        .seed_promo(PromoSeed {
            min_order: 500_000,
            max_discount: Some(100_000),
            ..PromoSeed::new("SUMMER10", PromoType::Percentage, dec!(10))
        })
        .await;

    let preview = app
        .state
        .services
        .promotions
        .validate("summer10", 1_200_000)
        .await
        .expect("validate");

    assert!(preview.valid);
    assert_eq!(preview.discount, 100_000);
    assert!(!preview.is_free_ship);
    assert_eq!(app.promo_used_count(promo.id).await, 0);
}

#[tokio::test]
async fn rejections_carry_a_reason() {
    let app = TestApp::new().await;
    app.seed_promo(PromoSeed {
        min_order: 500_000,
        ..PromoSeed::new("BIGSPEND", PromoType::Fixed, dec!(50000))
    })
    .await;
    app.seed_promo(PromoSeed {
        usage_limit: Some(3),
        used_count: 3,
        ..PromoSeed::new("LIMITED", PromoType::Fixed, dec!(10000))
    })
    .await;
    app.seed_promo(PromoSeed {
        is_active: false,
        ..PromoSeed::new("PAUSED", PromoType::Fixed, dec!(10000))
    })
    .await;
    let promotions = &app.state.services.promotions;

    let below_min = promotions.validate("BIGSPEND", 100_000).await.expect("validate");
    assert!(!below_min.valid);
    assert_eq!(below_min.discount, 0);
    assert!(below_min.reason.is_some());

    assert_matches!(
        promotions.evaluate_code("LIMITED", 100_000).await.expect("evaluate"),
        Err(PromoRejection::UsageLimitReached)
    );
    assert_matches!(
        promotions.evaluate_code("PAUSED", 100_000).await.expect("evaluate"),
        Err(PromoRejection::Inactive)
    );
    assert_matches!(
        promotions.evaluate_code("NOPE", 100_000).await.expect("evaluate"),
        Err(PromoRejection::NotFound)
    );
}

#[tokio::test]
async fn usage_counter_moves_both_ways_and_floors_at_zero() {
    let app = TestApp::new().await;
    let promo = app
        .seed_promo(PromoSeed::new("FREESHIP", PromoType::FreeShipping, dec!(0)))
        .await;
    let promotions = &app.state.services.promotions;

    promotions.increment_usage("freeship").await.expect("increment");
    promotions.increment_usage("FREESHIP").await.expect("increment");
    assert_eq!(app.promo_used_count(promo.id).await, 2);

    for _ in 0..3 {
        promotions.decrement_usage("FREESHIP").await.expect("decrement");
    }
    assert_eq!(app.promo_used_count(promo.id).await, 0);
}

#[tokio::test]
async fn incrementing_unknown_code_is_not_found() {
    let app = TestApp::new().await;

    assert_matches!(
        app.state.services.promotions.increment_usage("GHOST").await,
        Err(ServiceError::NotFound(_))
    );
}
