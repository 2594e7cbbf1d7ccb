pub mod common;
pub mod orders;
pub mod payments;
pub mod promotions;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        orders::OrderService, payment_gateway::PaymentGatewayService,
        promotions::PromoCodeService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub promotions: Arc<PromoCodeService>,
    pub payments: Arc<PaymentGatewayService>,
}

impl AppServices {
    pub fn new(db_pool: Arc<DbPool>, config: &AppConfig, event_sender: Arc<EventSender>) -> Self {
        let orders = OrderService::new(
            db_pool.clone(),
            config.checkout.clone(),
            Some(event_sender.clone()),
        );
        let payments = PaymentGatewayService::new(
            config.payment_gateway.clone(),
            orders.clone(),
            Some(event_sender),
        );

        Self {
            orders: Arc::new(orders),
            promotions: Arc::new(PromoCodeService::new(db_pool)),
            payments: Arc::new(payments),
        }
    }
}
