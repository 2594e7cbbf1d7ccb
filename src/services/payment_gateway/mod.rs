//! Redirect payment gateway: signed outbound payment URLs and verified inbound callbacks.

pub mod signing;

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    config::PaymentGatewayConfig,
    entities::order::{Model as OrderModel, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::OrderService,
};

use signing::{SECURE_HASH, SECURE_HASH_TYPE};

pub const SUCCESS_CODE: &str = "00";
const TXN_REF_MAX_LEN: usize = 34;
const ORDER_INFO_MAX_LEN: usize = 255;
const GATEWAY_UTC_OFFSET_SECS: i32 = 7 * 3600;

/// Forces an address into the IPv4 form the gateway accepts.
pub fn normalize_ip(ip: IpAddr) -> Ipv4Addr {
    match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                v4
            } else if v6.is_loopback() {
                Ipv4Addr::LOCALHOST
            } else {
                warn!(ip = %v6, "Gateway requires IPv4, falling back to loopback");
                Ipv4Addr::LOCALHOST
            }
        }
    }
}

/// `yyyyMMddHHmmss` on the gateway's UTC+7 clock
pub fn gateway_timestamp(at: DateTime<Utc>) -> Result<String, ServiceError> {
    let offset = FixedOffset::east_opt(GATEWAY_UTC_OFFSET_SECS)
        .ok_or_else(|| ServiceError::InternalError("invalid gateway offset".to_string()))?;
    Ok(at.with_timezone(&offset).format("%Y%m%d%H%M%S").to_string())
}

/// Order number, or the compact id when the number would not fit the gateway field.
pub fn transaction_ref(order: &OrderModel) -> String {
    if order.order_number.len() > TXN_REF_MAX_LEN {
        order.id.simple().to_string()
    } else {
        order.order_number.clone()
    }
}

pub fn order_info(order_number: &str) -> String {
    format!("Payment for order {}", order_number)
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .take(ORDER_INFO_MAX_LEN)
        .collect()
}

/// Parsed and signature-checked callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackVerification {
    pub valid: bool,
    pub order_ref: Option<String>,
    pub transaction_id: Option<String>,
    pub response_code: Option<String>,
    /// Amount in the gateway's unit (total × 100)
    pub amount: Option<i64>,
}

/// Result reported back after a callback was applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackOutcome {
    pub success: bool,
    pub order_id: Uuid,
    pub order_number: String,
    pub payment_status: PaymentStatus,
    pub payment_provider: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub response_code: String,
}

struct Credentials<'a> {
    merchant_code: &'a str,
    hash_secret: &'a str,
    return_url: &'a str,
}

#[derive(Clone)]
pub struct PaymentGatewayService {
    config: PaymentGatewayConfig,
    orders: OrderService,
    event_sender: Option<Arc<EventSender>>,
}

impl PaymentGatewayService {
    pub fn new(
        config: PaymentGatewayConfig,
        orders: OrderService,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            config,
            orders,
            event_sender,
        }
    }

    fn credentials(&self) -> Result<Credentials<'_>, ServiceError> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().map(str::trim).filter(|v| !v.is_empty())
        }

        match (
            present(&self.config.merchant_code),
            present(&self.config.hash_secret),
            present(&self.config.return_url),
        ) {
            (Some(merchant_code), Some(hash_secret), Some(return_url)) => Ok(Credentials {
                merchant_code,
                hash_secret,
                return_url,
            }),
            _ => {
                error!("Payment gateway credentials are not configured");
                Err(ServiceError::ConfigurationError(
                    "payment gateway merchant code, hash secret and return URL are required"
                        .to_string(),
                ))
            }
        }
    }

    /// Builds the signed redirect URL for `order`.
    pub fn build_payment_url(
        &self,
        order: &OrderModel,
        client_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<String, ServiceError> {
        let credentials = self.credentials()?;

        if order.payment_method != PaymentMethod::RedirectGateway {
            return Err(ServiceError::InvalidOperation(
                "Order is not payable through the payment gateway".to_string(),
            ));
        }
        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::InvalidOperation("Order is already paid".to_string()));
        }
        if matches!(order.order_status, OrderStatus::Cancelled | OrderStatus::Returned) {
            return Err(ServiceError::InvalidOperation(format!(
                "Order is {}",
                order.order_status
            )));
        }
        if order.total <= 0 || order.total < self.config.min_amount {
            return Err(ServiceError::ValidationError(format!(
                "Payment amount must be at least {}",
                self.config.min_amount
            )));
        }
        let amount = order
            .total
            .checked_mul(100)
            .ok_or_else(|| ServiceError::ValidationError("Payment amount is too large".to_string()))?;

        let expire_at = now + Duration::minutes(self.config.expire_minutes);
        let mut params = BTreeMap::new();
        params.insert("vnp_Version".to_string(), self.config.version.clone());
        params.insert("vnp_Command".to_string(), self.config.command.clone());
        params.insert("vnp_TmnCode".to_string(), credentials.merchant_code.to_string());
        params.insert("vnp_Amount".to_string(), amount.to_string());
        params.insert("vnp_CurrCode".to_string(), self.config.currency.clone());
        params.insert("vnp_TxnRef".to_string(), transaction_ref(order));
        params.insert("vnp_OrderInfo".to_string(), order_info(&order.order_number));
        params.insert("vnp_OrderType".to_string(), self.config.order_type.clone());
        params.insert("vnp_Locale".to_string(), self.config.locale.clone());
        params.insert("vnp_ReturnUrl".to_string(), credentials.return_url.to_string());
        params.insert("vnp_IpAddr".to_string(), normalize_ip(client_ip).to_string());
        params.insert("vnp_CreateDate".to_string(), gateway_timestamp(now)?);
        params.insert("vnp_ExpireDate".to_string(), gateway_timestamp(expire_at)?);

        let signature = signing::sign(credentials.hash_secret, &params)?;
        params.insert(SECURE_HASH.to_string(), signature);

        Ok(format!(
            "{}?{}",
            self.config.payment_url,
            signing::to_query_string(&params)
        ))
    }

    /// Looks up the order, checks the caller may pay for it, and builds the redirect URL.
    #[instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn create_payment_request(
        &self,
        actor: AuthUser,
        order_id: &str,
        client_ip: IpAddr,
    ) -> Result<String, ServiceError> {
        let order = self
            .orders
            .find_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        if !actor.can_access(order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }

        let url = self.build_payment_url(&order, client_ip, Utc::now())?;
        info!(order_id = %order.id, "Payment request created");
        Ok(url)
    }

    /// Checks the callback signature. Unknown fields are kept in the signed set but
    /// otherwise ignored.
    pub fn verify_callback(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<CallbackVerification, ServiceError> {
        let credentials = self.credentials()?;

        let mut params: BTreeMap<String, String> = query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let received = params.remove(SECURE_HASH).unwrap_or_default();
        params.remove(SECURE_HASH_TYPE);

        let valid = !received.is_empty() && signing::verify(credentials.hash_secret, &params, &received)?;

        Ok(CallbackVerification {
            valid,
            order_ref: params.get("vnp_TxnRef").cloned(),
            transaction_id: params
                .get("vnp_TransactionNo")
                .filter(|v| !v.is_empty())
                .cloned(),
            response_code: params.get("vnp_ResponseCode").cloned(),
            amount: params.get("vnp_Amount").and_then(|v| v.parse().ok()),
        })
    }

    fn reject_callback(&self, order_ref: Option<&str>, reason: &str) -> ServiceError {
        warn!(order_ref = order_ref.unwrap_or("<none>"), reason, "Payment callback rejected");
        counter!("techstore.payments.callback_rejected", 1);
        ServiceError::Unauthorized(format!("Payment callback rejected: {}", reason))
    }

    /// Verifies a callback and applies it to the order exactly once.
    ///
    /// Success moves the payment to paid unless it already is; any other code marks it
    /// failed unless it was already settled.
    #[instrument(skip(self, query))]
    pub async fn handle_callback(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<CallbackOutcome, ServiceError> {
        let verification = self.verify_callback(query)?;
        let order_ref = verification.order_ref.as_deref();
        if !verification.valid {
            return Err(self.reject_callback(order_ref, "invalid signature"));
        }

        let order_ref = order_ref
            .ok_or_else(|| ServiceError::ValidationError("Missing transaction reference".to_string()))?;
        let response_code = verification
            .response_code
            .clone()
            .ok_or_else(|| ServiceError::ValidationError("Missing response code".to_string()))?;
        let order = self
            .orders
            .find_by_payment_reference(order_ref)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_ref)))?;

        if let Some(amount) = verification.amount {
            if order.total.checked_mul(100) != Some(amount) {
                return Err(self.reject_callback(Some(order_ref), "amount mismatch"));
            }
        }

        let provider = self.config.provider.as_str();
        let transaction_id = verification.transaction_id.as_deref();
        if response_code == SUCCESS_CODE {
            if self.orders.mark_paid(order.id, provider, transaction_id).await? {
                counter!("techstore.payments.settled", 1);
                info!(order_id = %order.id, "Payment settled");
                self.emit(Event::PaymentSettled {
                    order_id: order.id,
                    transaction_id: verification.transaction_id.clone(),
                    at: Utc::now(),
                })
                .await;
            } else {
                info!(order_id = %order.id, "Duplicate success callback ignored");
            }
        } else if self
            .orders
            .mark_payment_failed(order.id, provider, transaction_id)
            .await?
        {
            warn!(order_id = %order.id, %response_code, "Payment failed");
            self.emit(Event::PaymentFailed {
                order_id: order.id,
                response_code: response_code.clone(),
            })
            .await;
        } else {
            info!(order_id = %order.id, %response_code, "Failure callback left payment unchanged");
        }

        let current = self
            .orders
            .find_order(&order.id.to_string())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))?;

        Ok(CallbackOutcome {
            success: response_code == SUCCESS_CODE && current.payment_status == PaymentStatus::Paid,
            order_id: current.id,
            order_number: current.order_number,
            payment_status: current.payment_status,
            payment_provider: current.payment_provider,
            payment_transaction_id: current.payment_transaction_id,
            response_code,
        })
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }
}
