//! Canonical signing string and HMAC-SHA512 shared by the outbound builder and the callback
//! verifier.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha512;
use url::form_urlencoded::byte_serialize;

use crate::errors::ServiceError;

type HmacSha512 = Hmac<Sha512>;

pub const SECURE_HASH: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE: &str = "vnp_SecureHashType";

fn is_signature_field(key: &str) -> bool {
    key == SECURE_HASH || key == SECURE_HASH_TYPE
}

/// `k1=v1&k2=v2...` over the non-signature fields in key order, values left unencoded.
pub fn canonical_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(key, _)| !is_signature_field(key))
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn mac_for(secret: &str, params: &BTreeMap<String, String>) -> Result<HmacSha512, ServiceError> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::ConfigurationError(format!("invalid hash secret: {}", e)))?;
    mac.update(canonical_string(params).as_bytes());
    Ok(mac)
}

/// Lowercase hex HMAC-SHA512 of the canonical string
pub fn sign(secret: &str, params: &BTreeMap<String, String>) -> Result<String, ServiceError> {
    Ok(hex::encode(mac_for(secret, params)?.finalize().into_bytes()))
}

/// Checks `signature` against the canonical string of `params`.
///
/// Hex case is ignored and the comparison runs in constant time.
pub fn verify(
    secret: &str,
    params: &BTreeMap<String, String>,
    signature: &str,
) -> Result<bool, ServiceError> {
    let Ok(received) = hex::decode(signature.trim()) else {
        return Ok(false);
    };
    Ok(mac_for(secret, params)?.verify_slice(&received).is_ok())
}

/// Percent-encodes every key and value, signature included, for the redirect URL.
pub fn to_query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                byte_serialize(key.as_bytes()).collect::<String>(),
                byte_serialize(value.as_bytes()).collect::<String>()
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}
