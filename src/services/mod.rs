// Checkout and fulfillment
pub mod order_status;
pub mod orders;
pub mod promotions;
pub mod stock_ledger;

// Payments
pub mod payment_gateway;
