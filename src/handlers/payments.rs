use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::common::ClientIp;
use crate::{
    auth::AuthUser, errors::ServiceError, services::payment_gateway::CallbackOutcome,
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub order_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentUrlResponse {
    pub payment_url: String,
}

/// POST /payments/gateway
pub async fn create_gateway_payment(
    State(state): State<AppState>,
    user: AuthUser,
    ClientIp(client_ip): ClientIp,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<ApiResponse<PaymentUrlResponse>>, ServiceError> {
    let payment_url = state
        .services
        .payments
        .create_payment_request(user, &request.order_id, client_ip)
        .await?;
    Ok(Json(ApiResponse::success(PaymentUrlResponse { payment_url })))
}

/// GET /payments/gateway/callback. Public; trusted only after signature verification.
pub async fn gateway_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ApiResponse<CallbackOutcome>>, ServiceError> {
    info!(fields = params.len(), "Payment gateway callback received");
    let outcome = state.services.payments.handle_callback(&params).await?;
    Ok(Json(ApiResponse::success(outcome)))
}
