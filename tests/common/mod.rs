#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::Value;
use techstore_api::{
    auth::Role,
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        cart_item, order,
        product::{self, ProductStatus},
        promo_code::{self, PromoType},
        user,
    },
    events::{self, EventSender},
    services::{
        orders::CreateOrderInput,
        payment_gateway::signing::{self, SECURE_HASH, SECURE_HASH_TYPE},
        stock_ledger::StockLedger,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const HASH_SECRET: &str = "TESTGATEWAYHASHSECRET0123456789";
pub const MERCHANT_CODE: &str = "TSTORE01";
pub const RETURN_URL: &str = "https://techstore.test/payment/return";

/// Application state backed by a fresh in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DatabaseConnection>,
    _event_task: tokio::task::JoinHandle<()>,
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        JWT_SECRET.to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.payment_gateway.merchant_code = Some(MERCHANT_CODE.to_string());
    cfg.payment_gateway.hash_secret = Some(HASH_SECRET.to_string());
    cfg.payment_gateway.return_url = Some(RETURN_URL.to_string());
    cfg
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));
        let state = AppState::new(db_arc.clone(), cfg, EventSender::new(event_tx));
        let router = techstore_api::app_router(state.clone());

        Self {
            router,
            state,
            db: db_arc,
            _event_task: event_task,
        }
    }

    pub fn stock(&self) -> StockLedger {
        StockLedger::new(self.db.clone())
    }

    pub fn token_for(&self, user_id: Uuid, role: Role) -> String {
        self.state
            .auth
            .issue_token(user_id, role, Duration::hours(1))
            .expect("issue token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (u16, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request");
        let status = response.status().as_u16();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn seed_user(&self, phone: Option<&str>) -> user::Model {
        let now = Utc::now();
        user::ActiveModel {
            id: Set(Uuid::new_v4()),
            full_name: Set("Nguyen Van A".to_string()),
            email: Set(format!("{}@techstore.test", Uuid::new_v4().simple())),
            phone: Set(phone.map(str::to_string)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed user")
    }

    pub async fn seed_product(&self, name: &str, price: i64, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            stock: Set(stock),
            status: Set(ProductStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
    }

    pub async fn set_product_status(&self, product_id: Uuid, status: ProductStatus) {
        let mut active: product::ActiveModel = self.product(product_id).await.into();
        active.status = Set(status);
        active.update(&*self.db).await.expect("update product");
    }

    pub async fn product(&self, product_id: Uuid) -> product::Model {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("query product")
            .expect("product exists")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        self.product(product_id).await.stock
    }

    /// Adds a cart line priced at the product's current price.
    pub async fn add_to_cart(
        &self,
        user_id: Uuid,
        product: &product::Model,
        quantity: i32,
    ) -> cart_item::Model {
        self.add_to_cart_at(user_id, product, quantity, product.price)
            .await
    }

    pub async fn add_to_cart_at(
        &self,
        user_id: Uuid,
        product: &product::Model,
        quantity: i32,
        price: i64,
    ) -> cart_item::Model {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product.id),
            quantity: Set(quantity),
            price: Set(price),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed cart line")
    }

    pub async fn cart_of(&self, user_id: Uuid) -> Vec<cart_item::Model> {
        use sea_orm::{ColumnTrait, QueryFilter};
        cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .all(&*self.db)
            .await
            .expect("query cart")
    }

    pub async fn seed_promo(&self, seed: PromoSeed) -> promo_code::Model {
        let now = Utc::now();
        promo_code::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(seed.code.to_uppercase()),
            promo_type: Set(seed.promo_type),
            value: Set(seed.value),
            min_order: Set(seed.min_order),
            max_discount: Set(seed.max_discount),
            valid_from: Set(now - Duration::days(1)),
            valid_to: Set(now + Duration::days(30)),
            usage_limit: Set(seed.usage_limit),
            used_count: Set(seed.used_count),
            is_active: Set(seed.is_active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed promo")
    }

    pub async fn promo_used_count(&self, promo_id: Uuid) -> i32 {
        promo_code::Entity::find_by_id(promo_id)
            .one(&*self.db)
            .await
            .expect("query promo")
            .expect("promo exists")
            .used_count
    }

    pub async fn user(&self, user_id: Uuid) -> user::Model {
        user::Entity::find_by_id(user_id)
            .one(&*self.db)
            .await
            .expect("query user")
            .expect("user exists")
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn order_count(&self) -> usize {
        order::Entity::find()
            .all(&*self.db)
            .await
            .expect("query orders")
            .len()
    }
}

pub struct PromoSeed {
    pub code: &'static str,
    pub promo_type: PromoType,
    pub value: Decimal,
    pub min_order: i64,
    pub max_discount: Option<i64>,
    pub usage_limit: Option<i32>,
    pub used_count: i32,
    pub is_active: bool,
}

impl PromoSeed {
    pub fn new(code: &'static str, promo_type: PromoType, value: Decimal) -> Self {
        Self {
            code,
            promo_type,
            value,
            min_order: 0,
            max_discount: None,
            usage_limit: None,
            used_count: 0,
            is_active: true,
        }
    }
}

pub fn checkout(address: &str) -> CreateOrderInput {
    CreateOrderInput {
        shipping_address: address.to_string(),
        ..Default::default()
    }
}

/// Callback query signed the way the gateway signs it.
pub fn signed_callback(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    let params: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let signature = signing::sign(HASH_SECRET, &params).expect("sign callback");

    let mut query: HashMap<String, String> = params.into_iter().collect();
    query.insert(SECURE_HASH.to_string(), signature.to_uppercase());
    query.insert(SECURE_HASH_TYPE.to_string(), "HmacSHA512".to_string());
    query
}
