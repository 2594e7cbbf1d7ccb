use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::{sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::product::{self, Entity as ProductEntity, Model as ProductModel, ProductStatus},
    errors::ServiceError,
};

/// Checks a product row against a requested quantity without touching stock.
pub fn check_availability(product: &ProductModel, quantity: i32) -> Result<(), ServiceError> {
    if quantity < 1 {
        return Err(ServiceError::ValidationError(format!(
            "Quantity for {} must be at least 1",
            product.name
        )));
    }
    if product.status != ProductStatus::Active {
        return Err(ServiceError::InvalidOperation(format!(
            "Product {} is not available",
            product.name
        )));
    }
    if product.stock < quantity {
        return Err(ServiceError::InsufficientStock(product.name.clone()));
    }
    Ok(())
}

/// Debit-on-order / credit-on-cancel bookkeeping on `products.stock`.
///
/// Every mutation is a single conditional `UPDATE`, so concurrent checkouts can never take
/// stock below zero.
#[derive(Clone, Debug)]
pub struct StockLedger {
    db: Arc<DatabaseConnection>,
}

impl StockLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Atomically takes `quantity` units of an active product.
    #[instrument(skip(self))]
    pub async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<(), ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Status.eq(ProductStatus::Active))
            .filter(product::Column::Stock.gte(quantity))
            .exec(&*self.db)
            .await
            .map_err(|e| {
                error!("Failed to reserve stock for product {}: {}", product_id, e);
                ServiceError::DatabaseError(e)
            })?;

        if result.rows_affected == 1 {
            debug!("Reserved {} units of product {}", quantity, product_id);
            return Ok(());
        }

        counter!("techstore.stock.reserve_rejected", 1);
        let product = self.find_product(product_id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("Product {} not found", product_id))
        })?;
        // The update matched nothing, so the row explains why.
        check_availability(&product, quantity)
            .and(Err(ServiceError::InsufficientStock(product.name)))
    }

    /// Returns `quantity` units to stock regardless of the current level.
    #[instrument(skip(self))]
    pub async fn release(&self, product_id: Uuid, quantity: i32) -> Result<(), ServiceError> {
        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(&*self.db)
            .await
            .map_err(|e| {
                error!("Failed to release stock for product {}: {}", product_id, e);
                ServiceError::DatabaseError(e)
            })?;

        if result.rows_affected == 0 {
            warn!("Stock release skipped: product {} no longer exists", product_id);
        }
        Ok(())
    }

    /// Current stock level of a product
    pub async fn stock_of(&self, product_id: Uuid) -> Result<i32, ServiceError> {
        self.find_product(product_id)
            .await?
            .map(|p| p.stock)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    pub async fn find_product(&self, product_id: Uuid) -> Result<Option<ProductModel>, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::DatabaseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn product(stock: i32, status: ProductStatus) -> ProductModel {
        let now = Utc::now();
        ProductModel {
            id: Uuid::new_v4(),
            name: "Laptop".to_string(),
            price: 1_000_000,
            stock,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn availability_requires_active_and_enough_stock() {
        assert!(check_availability(&product(2, ProductStatus::Active), 2).is_ok());
        assert_matches!(
            check_availability(&product(1, ProductStatus::Active), 2),
            Err(ServiceError::InsufficientStock(name)) if name == "Laptop"
        );
        assert_matches!(
            check_availability(&product(10, ProductStatus::Inactive), 1),
            Err(ServiceError::InvalidOperation(_))
        );
        assert_matches!(
            check_availability(&product(10, ProductStatus::Active), 0),
            Err(ServiceError::ValidationError(_))
        );
    }
}
