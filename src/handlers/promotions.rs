use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    auth::AuthUser, errors::ServiceError, services::promotions::PromoValidation, ApiResponse,
    AppState,
};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ValidatePromoRequest {
    #[validate(length(min = 1, max = 64, message = "Promo code is required"))]
    pub code: String,
    #[validate(range(min = 0))]
    pub subtotal: i64,
}

/// POST /promo-codes/validate. Preview only, no usage is recorded.
pub async fn validate_promo_code(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(request): Json<ValidatePromoRequest>,
) -> Result<Json<ApiResponse<PromoValidation>>, ServiceError> {
    request.validate()?;
    let result = state
        .services
        .promotions
        .validate(&request.code, request.subtotal)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}
