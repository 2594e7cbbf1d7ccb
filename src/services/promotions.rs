use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

use crate::{
    entities::promo_code::{self, Entity as PromoCode, Model as PromoCodeModel, PromoType},
    errors::ServiceError,
};

/// Why a code cannot be applied. The `Display` text is the stable reason returned to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoRejection {
    NotFound,
    Inactive,
    NotStarted,
    Expired,
    UsageLimitReached,
    MinOrderNotMet { min_order: i64 },
}

impl fmt::Display for PromoRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "Promo code not found"),
            Self::Inactive => write!(f, "Promo code is not active"),
            Self::NotStarted => write!(f, "Promo code is not yet valid"),
            Self::Expired => write!(f, "Promo code has expired"),
            Self::UsageLimitReached => write!(f, "Promo code usage limit reached"),
            Self::MinOrderNotMet { min_order } => {
                write!(f, "Order subtotal must be at least {}", min_order)
            }
        }
    }
}

impl From<PromoRejection> for ServiceError {
    fn from(rejection: PromoRejection) -> Self {
        match rejection {
            PromoRejection::NotFound => ServiceError::ValidationError(rejection.to_string()),
            other => ServiceError::InvalidOperation(other.to_string()),
        }
    }
}

/// Effect of a code that passed every check.
///
/// Free shipping is a separate effect from `discount`: the caller zeroes the shipping fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedPromo {
    pub code: String,
    pub discount: i64,
    pub is_free_ship: bool,
}

/// Preview result returned by the validate endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromoValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub discount: i64,
    pub is_free_ship: bool,
}

impl From<Result<AppliedPromo, PromoRejection>> for PromoValidation {
    fn from(outcome: Result<AppliedPromo, PromoRejection>) -> Self {
        match outcome {
            Ok(applied) => Self {
                valid: true,
                reason: None,
                discount: applied.discount,
                is_free_ship: applied.is_free_ship,
            },
            Err(rejection) => Self {
                valid: false,
                reason: Some(rejection.to_string()),
                discount: 0,
                is_free_ship: false,
            },
        }
    }
}

/// Codes are matched case-insensitively and stored upper-case.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Runs the validity checks in order; the first failure wins.
pub fn check_validity(
    promo: &PromoCodeModel,
    subtotal: i64,
    now: DateTime<Utc>,
) -> Result<(), PromoRejection> {
    if !promo.is_active {
        return Err(PromoRejection::Inactive);
    }
    if now < promo.valid_from {
        return Err(PromoRejection::NotStarted);
    }
    if now > promo.valid_to {
        return Err(PromoRejection::Expired);
    }
    if let Some(limit) = promo.usage_limit {
        if promo.used_count >= limit {
            return Err(PromoRejection::UsageLimitReached);
        }
    }
    if subtotal < promo.min_order {
        return Err(PromoRejection::MinOrderNotMet {
            min_order: promo.min_order,
        });
    }
    Ok(())
}

/// Monetary discount for `subtotal`, always within `0..=subtotal`.
pub fn calculate_discount(promo: &PromoCodeModel, subtotal: i64) -> i64 {
    let subtotal = subtotal.max(0);
    let discount = match promo.promo_type {
        PromoType::Percentage => {
            let raw = Decimal::from(subtotal)
                .checked_mul(promo.value)
                .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
                .map(|v| v.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
                .and_then(|v| v.to_i64())
                .unwrap_or(subtotal);
            match promo.max_discount {
                Some(cap) => raw.min(cap),
                None => raw,
            }
        }
        PromoType::Fixed => promo
            .value
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or(subtotal),
        PromoType::FreeShipping => 0,
    };

    discount.clamp(0, subtotal)
}

/// Checks validity and computes the effect of a code on `subtotal` at `now`.
pub fn evaluate(
    promo: &PromoCodeModel,
    subtotal: i64,
    now: DateTime<Utc>,
) -> Result<AppliedPromo, PromoRejection> {
    check_validity(promo, subtotal, now)?;
    Ok(AppliedPromo {
        code: promo.code.clone(),
        discount: calculate_discount(promo, subtotal),
        is_free_ship: promo.promo_type == PromoType::FreeShipping,
    })
}

#[derive(Clone, Debug)]
pub struct PromoCodeService {
    db: Arc<DatabaseConnection>,
}

impl PromoCodeService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds a code regardless of its validity
    #[instrument(skip(self))]
    pub async fn find_by_code(&self, code: &str) -> Result<Option<PromoCodeModel>, ServiceError> {
        PromoCode::find()
            .filter(promo_code::Column::Code.eq(normalize_code(code)))
            .one(&*self.db)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to look up promo code");
                ServiceError::DatabaseError(e)
            })
    }

    /// Evaluates a code against `subtotal` without recording any usage.
    #[instrument(skip(self))]
    pub async fn evaluate_code(
        &self,
        code: &str,
        subtotal: i64,
    ) -> Result<Result<AppliedPromo, PromoRejection>, ServiceError> {
        let outcome = match self.find_by_code(code).await? {
            Some(promo) => evaluate(&promo, subtotal, Utc::now()),
            None => Err(PromoRejection::NotFound),
        };
        if let Err(ref rejection) = outcome {
            debug!(%rejection, "promo code rejected");
        }
        Ok(outcome)
    }

    /// Preview for clients; never records usage.
    pub async fn validate(&self, code: &str, subtotal: i64) -> Result<PromoValidation, ServiceError> {
        Ok(self.evaluate_code(code, subtotal).await?.into())
    }

    /// Records one use of `code`.
    #[instrument(skip(self))]
    pub async fn increment_usage(&self, code: &str) -> Result<(), ServiceError> {
        let result = PromoCode::update_many()
            .col_expr(
                promo_code::Column::UsedCount,
                Expr::col(promo_code::Column::UsedCount).add(1),
            )
            .col_expr(promo_code::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(promo_code::Column::Code.eq(normalize_code(code)))
            .exec(&*self.db)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to increment promo usage");
                ServiceError::DatabaseError(e)
            })?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Promo code {} not found", code)));
        }
        Ok(())
    }

    /// Reverses one use of `code`. The counter never goes below zero.
    #[instrument(skip(self))]
    pub async fn decrement_usage(&self, code: &str) -> Result<(), ServiceError> {
        let result = PromoCode::update_many()
            .col_expr(
                promo_code::Column::UsedCount,
                Expr::col(promo_code::Column::UsedCount).sub(1),
            )
            .col_expr(promo_code::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(promo_code::Column::Code.eq(normalize_code(code)))
            .filter(promo_code::Column::UsedCount.gt(0))
            .exec(&*self.db)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to decrement promo usage");
                ServiceError::DatabaseError(e)
            })?;

        if result.rows_affected == 0 {
            warn!(code, "Promo usage not decremented: code missing or already at zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn promo(promo_type: PromoType, value: Decimal) -> PromoCodeModel {
        let now = Utc::now();
        PromoCodeModel {
            id: Uuid::new_v4(),
            code: "SUMMER10".to_string(),
            promo_type,
            value,
            min_order: 0,
            max_discount: None,
            valid_from: now - Duration::days(1),
            valid_to: now + Duration::days(30),
            usage_limit: None,
            used_count: 0,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn percentage_discount_is_capped() {
        let mut p = promo(PromoType::Percentage, dec!(10));
        p.max_discount = Some(100_000);
        p.min_order = 500_000;

        let applied = evaluate(&p, 1_200_000, Utc::now()).unwrap();
        assert_eq!(applied.discount, 100_000);
        assert!(!applied.is_free_ship);
    }

    #[test]
    fn percentage_rounds_half_away_from_zero() {
        let p = promo(PromoType::Percentage, dec!(12.5));
        // 12.5% of 1_004 = 125.5
        assert_eq!(calculate_discount(&p, 1_004), 126);
    }

    #[test]
    fn fixed_discount_never_exceeds_subtotal() {
        let p = promo(PromoType::Fixed, dec!(200_000));
        assert_eq!(calculate_discount(&p, 150_000), 150_000);
        assert_eq!(calculate_discount(&p, 900_000), 200_000);
    }

    #[test]
    fn free_shipping_has_no_monetary_discount() {
        let p = promo(PromoType::FreeShipping, dec!(0));
        let applied = evaluate(&p, 300_000, Utc::now()).unwrap();
        assert_eq!(applied.discount, 0);
        assert!(applied.is_free_ship);
    }

    #[test]
    fn checks_run_in_order() {
        let now = Utc::now();
        let mut p = promo(PromoType::Fixed, dec!(10));
        p.is_active = false;
        p.valid_to = now - Duration::days(1);
        p.min_order = 1_000_000;
        assert_eq!(evaluate(&p, 1, now), Err(PromoRejection::Inactive));

        p.is_active = true;
        assert_eq!(evaluate(&p, 1, now), Err(PromoRejection::Expired));

        p.valid_to = now + Duration::days(1);
        p.usage_limit = Some(3);
        p.used_count = 3;
        assert_eq!(evaluate(&p, 1, now), Err(PromoRejection::UsageLimitReached));

        p.used_count = 2;
        assert_eq!(
            evaluate(&p, 1, now),
            Err(PromoRejection::MinOrderNotMet { min_order: 1_000_000 })
        );
    }

    #[test]
    fn window_is_inclusive() {
        let p = promo(PromoType::Fixed, dec!(10));
        assert!(check_validity(&p, 100, p.valid_from).is_ok());
        assert!(check_validity(&p, 100, p.valid_to).is_ok());
        assert_eq!(
            check_validity(&p, 100, p.valid_from - Duration::seconds(1)),
            Err(PromoRejection::NotStarted)
        );
    }

    #[test]
    fn rejection_maps_to_stable_reason() {
        let validation = PromoValidation::from(Err(PromoRejection::NotFound));
        assert!(!validation.valid);
        assert_eq!(validation.reason.as_deref(), Some("Promo code not found"));
        assert_eq!(
            ServiceError::from(PromoRejection::MinOrderNotMet { min_order: 500 }).to_string(),
            "Invalid operation: Order subtotal must be at least 500"
        );
    }

    #[test]
    fn codes_are_normalized() {
        assert_eq!(normalize_code("  summer10 "), "SUMMER10");
    }
}
