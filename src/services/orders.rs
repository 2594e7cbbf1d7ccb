use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    config::CheckoutConfig,
    entities::{
        cart_item::{self, Entity as CartItemEntity, Model as CartItemModel},
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus, PaymentMethod, PaymentStatus},
        order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
        product::{self, Entity as ProductEntity},
        user::{self, Entity as UserEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        order_status::{authorize_transition, parse_status, OrderStatusService},
        promotions::{AppliedPromo, PromoCodeService},
        stock_ledger::{check_availability, StockLedger},
    },
    PaginatedResponse,
};

/// Contact details overriding the stored profile for one order
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CustomerInfoInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: Option<String>,
    #[validate(length(min = 6, max = 20, message = "Phone number must be 6-20 characters"))]
    pub phone: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
}

/// Checkout request
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CreateOrderInput {
    #[validate(length(max = 500, message = "Shipping address is too long"))]
    pub shipping_address: String,
    /// Defaults to cash on delivery
    pub payment_method: Option<PaymentMethod>,
    pub promo_code: Option<String>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
    /// Converts only these products' cart lines; the whole cart when absent
    pub selected_product_ids: Option<Vec<Uuid>>,
    #[validate]
    pub customer_info: Option<CustomerInfoInput>,
}

/// An order with its line snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

/// Monetary breakdown of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderTotals {
    pub subtotal: i64,
    pub discount: i64,
    pub shipping_fee: i64,
    pub total: i64,
}

/// Prices an order. Shipping is free above the threshold or with a free-shipping code.
pub fn compute_totals(
    subtotal: i64,
    promo: Option<&AppliedPromo>,
    checkout: &CheckoutConfig,
) -> OrderTotals {
    let discount = promo.map_or(0, |p| p.discount);
    let free_ship = promo.map_or(false, |p| p.is_free_ship);
    let shipping_fee = if free_ship || subtotal > checkout.free_shipping_threshold {
        0
    } else {
        checkout.flat_shipping_fee
    };

    OrderTotals {
        subtotal,
        discount,
        shipping_fee,
        total: (subtotal - discount + shipping_fee).max(0),
    }
}

/// `TS-YYYYMMDD-HHMMSS-NNNN`
pub fn format_order_number(now: DateTime<Utc>, suffix: u16) -> String {
    format!("TS-{}-{:04}", now.format("%Y%m%d-%H%M%S"), suffix % 10_000)
}

/// Supplies human-facing order numbers
pub trait OrderNumberSource: Send + Sync {
    fn next_number(&self, now: DateTime<Utc>) -> String;
}

/// Timestamp plus a random four-digit suffix
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomOrderNumbers;

impl OrderNumberSource for RandomOrderNumbers {
    fn next_number(&self, now: DateTime<Utc>) -> String {
        format_order_number(now, rand::thread_rng().gen_range(0..10_000))
    }
}

struct PricedLine {
    cart_line_id: Uuid,
    product_id: Uuid,
    name: String,
    unit_price: i64,
    quantity: i32,
}

struct OrderDraft {
    user_id: Uuid,
    lines: Vec<PricedLine>,
    totals: OrderTotals,
    promo: Option<AppliedPromo>,
    payment_method: PaymentMethod,
    shipping_address: String,
    notes: Option<String>,
    full_name: String,
    phone: String,
    email: String,
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// Turns carts into orders and drives them through their lifecycle
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    stock: StockLedger,
    promos: PromoCodeService,
    status: OrderStatusService,
    checkout: CheckoutConfig,
    numbers: Arc<dyn OrderNumberSource>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        checkout: CheckoutConfig,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            stock: StockLedger::new(db.clone()),
            promos: PromoCodeService::new(db.clone()),
            status: OrderStatusService::new(db.clone()),
            db,
            checkout,
            numbers: Arc::new(RandomOrderNumbers),
            event_sender,
        }
    }

    pub fn with_order_numbers(mut self, numbers: Arc<dyn OrderNumberSource>) -> Self {
        self.numbers = numbers;
        self
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    /// Converts the caller's cart (or the selected part of it) into an order.
    #[instrument(skip(self, input), fields(user_id = %user_id))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        input: CreateOrderInput,
    ) -> Result<OrderDetails, ServiceError> {
        let draft = self.prepare_order(user_id, &input).await?;
        let (order, items) = self.persist_with_fresh_number(&draft).await?;

        // From here on the order row is the source of truth; failures are integrity faults.
        self.debit_stock(&order, &draft.lines).await?;

        if let Some(promo) = &draft.promo {
            if let Err(e) = self.promos.increment_usage(&promo.code).await {
                error!(order_id = %order.id, code = %promo.code, error = %e, "Failed to record promo usage");
                return Err(ServiceError::InternalError(format!(
                    "promo usage not recorded for order {}",
                    order.id
                )));
            }
        }

        let consumed: Vec<Uuid> = draft.lines.iter().map(|l| l.cart_line_id).collect();
        CartItemEntity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::Id.is_in(consumed))
            .exec(&*self.db)
            .await
            .map_err(|e| {
                error!(order_id = %order.id, error = %e, "Failed to clear ordered cart lines");
                ServiceError::InternalError(format!("cart not cleared for order {}", order.id))
            })?;

        counter!("techstore.orders.created", 1);
        info!(order_id = %order.id, order_number = %order.order_number, total = order.total, "Order created");
        self.emit(Event::OrderCreated {
            order_id: order.id,
            order_number: order.order_number.clone(),
            total: order.total,
        })
        .await;

        Ok(OrderDetails { order, items })
    }

    /// Validation and pricing. Only the phone backfill writes anything.
    async fn prepare_order(
        &self,
        user_id: Uuid,
        input: &CreateOrderInput,
    ) -> Result<OrderDraft, ServiceError> {
        input.validate()?;
        let shipping_address = input.shipping_address.trim().to_string();
        if shipping_address.is_empty() {
            return Err(ServiceError::ValidationError(
                "Shipping address is required".to_string(),
            ));
        }

        let mut cart = CartItemEntity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        if let Some(selected) = &input.selected_product_ids {
            let selected: HashSet<Uuid> = selected.iter().copied().collect();
            cart.retain(|line| selected.contains(&line.product_id));
        }
        if cart.is_empty() {
            return Err(ServiceError::ValidationError(
                "No items selected for checkout".to_string(),
            ));
        }

        let lines = self.price_lines(&cart).await?;
        let subtotal: i64 = lines
            .iter()
            .map(|l| l.unit_price * i64::from(l.quantity))
            .sum();

        let promo = match non_blank(input.promo_code.as_ref()) {
            Some(code) => Some(self.promos.evaluate_code(&code, subtotal).await??),
            None => None,
        };
        let totals = compute_totals(subtotal, promo.as_ref(), &self.checkout);

        let profile = UserEntity::find_by_id(user_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", user_id)))?;
        let info = input.customer_info.clone().unwrap_or_default();
        let phone = non_blank(info.phone.as_ref())
            .or_else(|| non_blank(profile.phone.as_ref()))
            .ok_or_else(|| ServiceError::ValidationError("Phone number is required".to_string()))?;
        if profile.phone.is_none() {
            self.backfill_phone(user_id, &phone).await?;
        }

        Ok(OrderDraft {
            user_id,
            lines,
            totals,
            promo,
            payment_method: input.payment_method.unwrap_or(PaymentMethod::CashOnDelivery),
            shipping_address,
            notes: non_blank(input.notes.as_ref()),
            full_name: non_blank(info.full_name.as_ref()).unwrap_or(profile.full_name),
            phone,
            email: non_blank(info.email.as_ref()).unwrap_or(profile.email),
        })
    }

    /// Checks every line against the catalog and snapshots names. Prices come from the cart.
    async fn price_lines(&self, cart: &[CartItemModel]) -> Result<Vec<PricedLine>, ServiceError> {
        let ids: Vec<Uuid> = cart.iter().map(|l| l.product_id).collect();
        let products: HashMap<Uuid, product::Model> = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut requested: HashMap<Uuid, i32> = HashMap::new();
        for line in cart {
            *requested.entry(line.product_id).or_default() += line.quantity;
        }

        let mut lines = Vec::with_capacity(cart.len());
        for line in cart {
            let product = products.get(&line.product_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", line.product_id))
            })?;
            if line.quantity < 1 || line.price < 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid cart line for {}",
                    product.name
                )));
            }
            check_availability(product, requested[&line.product_id])?;
            lines.push(PricedLine {
                cart_line_id: line.id,
                product_id: product.id,
                name: product.name.clone(),
                unit_price: line.price,
                quantity: line.quantity,
            });
        }
        Ok(lines)
    }

    async fn backfill_phone(&self, user_id: Uuid, phone: &str) -> Result<(), ServiceError> {
        user::Entity::update_many()
            .col_expr(user::Column::Phone, Expr::value(phone))
            .col_expr(user::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(user::Column::Id.eq(user_id))
            .filter(user::Column::Phone.is_null())
            .exec(&*self.db)
            .await?;
        info!(%user_id, "Backfilled profile phone from checkout");
        Ok(())
    }

    /// Inserts the order, drawing a new number whenever the last one was taken.
    async fn persist_with_fresh_number(
        &self,
        draft: &OrderDraft,
    ) -> Result<(OrderModel, Vec<OrderItemModel>), ServiceError> {
        let attempts = self.checkout.order_number_attempts.max(1);
        for attempt in 1..=attempts {
            let number = self.numbers.next_number(Utc::now());
            match self.persist_order(draft, &number).await {
                Ok(persisted) => return Ok(persisted),
                Err(e) if is_unique_violation(&e) => {
                    warn!(order_number = %number, attempt, "Order number collision, retrying");
                }
                Err(e) => {
                    error!(error = %e, "Failed to persist order");
                    return Err(ServiceError::DatabaseError(e));
                }
            }
        }
        Err(ServiceError::Conflict(
            "Could not allocate a unique order number, please retry".to_string(),
        ))
    }

    async fn persist_order(
        &self,
        draft: &OrderDraft,
        order_number: &str,
    ) -> Result<(OrderModel, Vec<OrderItemModel>), DbErr> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.to_string()),
            user_id: Set(draft.user_id),
            subtotal: Set(draft.totals.subtotal),
            discount: Set(draft.totals.discount),
            shipping_fee: Set(draft.totals.shipping_fee),
            total: Set(draft.totals.total),
            promo_code: Set(draft.promo.as_ref().map(|p| p.code.clone())),
            payment_method: Set(draft.payment_method),
            payment_status: Set(PaymentStatus::Pending),
            payment_provider: Set(None),
            payment_transaction_id: Set(None),
            order_status: Set(OrderStatus::Pending),
            shipping_address: Set(draft.shipping_address.clone()),
            notes: Set(draft.notes.clone()),
            customer_full_name: Set(draft.full_name.clone()),
            customer_phone: Set(draft.phone.clone()),
            customer_email: Set(draft.email.clone()),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(draft.lines.len());
        for (position, line) in draft.lines.iter().enumerate() {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                position: Set(position as i32),
                product_id: Set(line.product_id),
                name: Set(line.name.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        txn.commit().await?;
        Ok((order, items))
    }

    /// Applies the stock debits; on failure undoes the ones already taken and cancels the order.
    async fn debit_stock(&self, order: &OrderModel, lines: &[PricedLine]) -> Result<(), ServiceError> {
        for (taken, line) in lines.iter().enumerate() {
            let Err(e) = self.stock.reserve(line.product_id, line.quantity).await else {
                continue;
            };

            error!(
                order_id = %order.id,
                product_id = %line.product_id,
                error = %e,
                "Stock debit failed after order was persisted, compensating"
            );
            for done in &lines[..taken] {
                if let Err(release_err) = self.stock.release(done.product_id, done.quantity).await {
                    error!(order_id = %order.id, product_id = %done.product_id, error = %release_err, "Compensating release failed");
                }
            }
            if let Err(cancel_err) = self.status.write_transition(order, OrderStatus::Cancelled).await {
                error!(order_id = %order.id, error = %cancel_err, "Failed to cancel order after stock debit failure");
            }
            counter!("techstore.orders.cancelled", 1);
            return Err(ServiceError::InternalError(format!(
                "stock debit failed for order {}",
                order.id
            )));
        }
        Ok(())
    }

    /// Resolves a UUID first, then the human-facing order number.
    pub async fn find_order(&self, id_or_number: &str) -> Result<Option<OrderModel>, ServiceError> {
        let key = id_or_number.trim();
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(order) = OrderEntity::find_by_id(id).one(&*self.db).await? {
                return Ok(Some(order));
            }
        }
        Ok(OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(key))
            .one(&*self.db)
            .await?)
    }

    /// Resolves a gateway transaction reference: order number first, then raw id.
    pub async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        let key = reference.trim();
        let by_number = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(key))
            .one(&*self.db)
            .await?;
        if by_number.is_some() {
            return Ok(by_number);
        }
        match Uuid::parse_str(key) {
            Ok(id) => Ok(OrderEntity::find_by_id(id).one(&*self.db).await?),
            Err(_) => Ok(None),
        }
    }

    async fn require_order(&self, id_or_number: &str) -> Result<OrderModel, ServiceError> {
        self.find_order(id_or_number)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id_or_number)))
    }

    pub async fn load_items(&self, order_id: Uuid) -> Result<Vec<OrderItemModel>, ServiceError> {
        Ok(OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::Position)
            .all(&*self.db)
            .await?)
    }

    /// Order details for its owner or an administrator
    #[instrument(skip(self))]
    pub async fn get_order(
        &self,
        actor: AuthUser,
        id_or_number: &str,
    ) -> Result<OrderDetails, ServiceError> {
        let order = self.require_order(id_or_number).await?;
        if !actor.can_access(order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        let items = self.load_items(order.id).await?;
        Ok(OrderDetails { order, items })
    }

    /// Changes an order's status on behalf of `actor`.
    ///
    /// Cancelling releases every item's stock and reverses promo usage; returning does not.
    #[instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn update_status(
        &self,
        actor: AuthUser,
        id_or_number: &str,
        target: &str,
    ) -> Result<OrderDetails, ServiceError> {
        let to = parse_status(target)?;
        let order = self.require_order(id_or_number).await?;
        if !actor.can_access(order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        authorize_transition(actor.role, order.order_status, to)?;

        let from = order.order_status;
        let updated = self.status.write_transition(&order, to).await?;
        let items = self.load_items(updated.id).await?;

        if to == OrderStatus::Cancelled {
            self.restore_cancelled(&updated, &items).await?;
        }

        self.emit(Event::OrderStatusChanged {
            order_id: updated.id,
            old_status: from,
            new_status: to,
        })
        .await;

        Ok(OrderDetails {
            order: updated,
            items,
        })
    }

    /// Customer shortcut for cancelling an order
    pub async fn cancel_order(
        &self,
        actor: AuthUser,
        id_or_number: &str,
    ) -> Result<OrderDetails, ServiceError> {
        self.update_status(actor, id_or_number, "cancelled").await
    }

    async fn restore_cancelled(
        &self,
        order: &OrderModel,
        items: &[OrderItemModel],
    ) -> Result<(), ServiceError> {
        let mut failed = false;
        for item in items {
            if let Err(e) = self.stock.release(item.product_id, item.quantity).await {
                error!(order_id = %order.id, product_id = %item.product_id, error = %e, "Failed to release stock for cancelled order");
                failed = true;
            }
        }
        if let Some(code) = &order.promo_code {
            if let Err(e) = self.promos.decrement_usage(code).await {
                error!(order_id = %order.id, code = %code, error = %e, "Failed to reverse promo usage");
                failed = true;
            }
        }

        counter!("techstore.orders.cancelled", 1);
        self.emit(Event::OrderCancelled(order.id)).await;

        if failed {
            return Err(ServiceError::InternalError(format!(
                "cancellation side effects incomplete for order {}",
                order.id
            )));
        }
        Ok(())
    }

    /// The caller's orders, newest first
    pub async fn list_orders_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        limit: u64,
    ) -> Result<PaginatedResponse<OrderDetails>, ServiceError> {
        let query = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt);
        self.paginate(query, page, limit).await
    }

    /// All orders, optionally filtered by status, newest first
    pub async fn list_orders(
        &self,
        status: Option<OrderStatus>,
        page: u64,
        limit: u64,
    ) -> Result<PaginatedResponse<OrderDetails>, ServiceError> {
        let mut query = OrderEntity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(order::Column::OrderStatus.eq(status));
        }
        self.paginate(query, page, limit).await
    }

    async fn paginate(
        &self,
        query: sea_orm::Select<OrderEntity>,
        page: u64,
        limit: u64,
    ) -> Result<PaginatedResponse<OrderDetails>, ServiceError> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let paginator = query.paginate(&*self.db, limit);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<OrderItemModel>> = HashMap::new();
        for item in OrderItemEntity::find()
            .filter(order_item::Column::OrderId.is_in(ids))
            .order_by_asc(order_item::Column::Position)
            .all(&*self.db)
            .await?
        {
            items_by_order.entry(item.order_id).or_default().push(item);
        }

        let items = orders
            .into_iter()
            .map(|order| {
                let items = items_by_order.remove(&order.id).unwrap_or_default();
                OrderDetails { order, items }
            })
            .collect();

        Ok(PaginatedResponse {
            items,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        })
    }

    /// Marks an order paid unless it already is. Returns whether this call settled it.
    #[instrument(skip(self))]
    pub async fn mark_paid(
        &self,
        order_id: Uuid,
        provider: &str,
        transaction_id: Option<&str>,
    ) -> Result<bool, ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
            .col_expr(order::Column::PaymentProvider, Expr::value(provider))
            .col_expr(
                order::Column::PaymentTransactionId,
                Expr::value(transaction_id.map(str::to_string)),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.ne(PaymentStatus::Paid))
            .exec(&*self.db)
            .await
            .map_err(|e| {
                error!(%order_id, error = %e, "Failed to settle payment");
                ServiceError::DatabaseError(e)
            })?;
        Ok(result.rows_affected == 1)
    }

    /// Marks an order's payment failed unless it is already paid or failed.
    #[instrument(skip(self))]
    pub async fn mark_payment_failed(
        &self,
        order_id: Uuid,
        provider: &str,
        transaction_id: Option<&str>,
    ) -> Result<bool, ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Failed))
            .col_expr(order::Column::PaymentProvider, Expr::value(provider))
            .col_expr(
                order::Column::PaymentTransactionId,
                Expr::value(transaction_id.map(str::to_string)),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(
                order::Column::PaymentStatus
                    .is_not_in([PaymentStatus::Paid, PaymentStatus::Failed]),
            )
            .exec(&*self.db)
            .await
            .map_err(|e| {
                error!(%order_id, error = %e, "Failed to record payment failure");
                ServiceError::DatabaseError(e)
            })?;
        Ok(result.rows_affected == 1)
    }
}
