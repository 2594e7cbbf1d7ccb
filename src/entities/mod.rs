//! Persisted records. Business rules live in `crate::services`, not here.

pub mod cart_item;
pub mod order;
pub mod order_item;
pub mod product;
pub mod promo_code;
pub mod user;
