use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::Role,
    entities::order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus},
    errors::ServiceError,
};

/// `Cancelled` and `Returned` never change again.
pub fn is_terminal(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Cancelled | OrderStatus::Returned)
}

/// Whether the lifecycle allows moving from `from` to `to`.
///
/// Cancelling or returning is allowed from any non-terminal state.
pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    if is_terminal(from) || from == to {
        return false;
    }
    match (from, to) {
        (_, OrderStatus::Cancelled) | (_, OrderStatus::Returned) => true,
        (OrderStatus::Pending, OrderStatus::Shipped) => true,
        (OrderStatus::Shipped, OrderStatus::Delivered) => true,
        _ => false,
    }
}

/// Parses a client-supplied status, rejecting anything outside the lifecycle.
pub fn parse_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    OrderStatus::from_str(raw.trim())
        .map_err(|_| ServiceError::ValidationError(format!("Unknown order status: {}", raw)))
}

/// Checks a requested transition for an actor with `role`.
///
/// Customers may only cancel an order that is still pending; administrators may request any
/// transition the lifecycle allows. Ownership is checked by the caller.
pub fn authorize_transition(
    role: Role,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<(), ServiceError> {
    if is_terminal(from) {
        return Err(ServiceError::InvalidStatus(format!(
            "Order is already {}",
            from
        )));
    }
    if from == to {
        return Err(ServiceError::InvalidStatus(format!("Order is already {}", from)));
    }
    if role == Role::Customer && !(from == OrderStatus::Pending && to == OrderStatus::Cancelled) {
        return Err(ServiceError::Forbidden(
            "Customers may only cancel pending orders".to_string(),
        ));
    }
    if !can_transition(from, to) {
        return Err(ServiceError::InvalidStatus(format!(
            "Cannot transition from '{}' to '{}'",
            from, to
        )));
    }
    Ok(())
}

/// Writes status changes with an optimistic version check
#[derive(Clone, Debug)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Moves `order` to `to` if nobody changed it since it was read.
    ///
    /// Returns `ConcurrentModification` when the stored version no longer matches, in which
    /// case nothing was written.
    #[instrument(skip(self, order), fields(order_id = %order.id, from = %order.order_status, to = %to))]
    pub async fn write_transition(
        &self,
        order: &OrderModel,
        to: OrderStatus,
    ) -> Result<OrderModel, ServiceError> {
        if !can_transition(order.order_status, to) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot transition from '{}' to '{}'",
                order.order_status, to
            )));
        }

        let now = Utc::now();
        let result = OrderEntity::update_many()
            .col_expr(order::Column::OrderStatus, Expr::value(to))
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Version.eq(order.version))
            .exec(&*self.db)
            .await
            .map_err(|e| {
                error!("Failed to update order {} status: {}", order.id, e);
                ServiceError::DatabaseError(e)
            })?;

        if result.rows_affected == 0 {
            warn!("Order {} changed concurrently, status write skipped", order.id);
            return Err(ServiceError::ConcurrentModification(order.id));
        }

        info!(
            "Order {} status updated from '{}' to '{}'",
            order.id, order.order_status, to
        );

        let mut updated = order.clone();
        updated.order_status = to;
        updated.version += 1;
        updated.updated_at = now;
        Ok(updated)
    }
}
