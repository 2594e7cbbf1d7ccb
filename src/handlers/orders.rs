use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{
        order_status::parse_status,
        orders::{CreateOrderInput, OrderDetails},
    },
    ApiResponse, AppState, ListQuery, PaginatedResponse,
};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct UpdateOrderStatusRequest {
    #[validate(length(min = 1, message = "Order status is required"))]
    pub order_status: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminOrderQuery {
    pub status: Option<String>,
    #[serde(default = "crate::default_page")]
    pub page: u64,
    #[serde(default = "crate::default_limit")]
    pub limit: u64,
}

/// POST /orders
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateOrderInput>,
) -> Result<(StatusCode, Json<ApiResponse<OrderDetails>>), ServiceError> {
    let order = state
        .services
        .orders
        .create_order(user.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// GET /orders
pub async fn list_my_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderDetails>>>, ServiceError> {
    let page = state
        .services
        .orders
        .list_orders_for_user(user.user_id, query.page, query.limit)
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// GET /orders/:id, where `id` is either the order id or its order number
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    let order = state.services.orders.get_order(user, &id).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// PUT /orders/:id/status
pub async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    request.validate()?;
    let order = state
        .services
        .orders
        .update_status(user, &id, &request.order_status)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// POST /orders/:id/cancel
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    let order = state.services.orders.cancel_order(user, &id).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// GET /admin/orders
pub async fn admin_list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<AdminOrderQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderDetails>>>, ServiceError> {
    if !user.is_admin() {
        return Err(ServiceError::Forbidden("Administrator role required".to_string()));
    }
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_status)
        .transpose()?;

    let page = state
        .services
        .orders
        .list_orders(status, query.page, query.limit)
        .await?;
    Ok(Json(ApiResponse::success(page)))
}
