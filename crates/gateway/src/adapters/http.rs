//! Helpers shared by the REST venues

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::str::FromStr;
use std::time::Duration;

use crate::credentials::Credentials;
use crate::error::{BrokerError, BrokerResult};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Transport-level ceiling; the adapter applies its own per-attempt timeout
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_client() -> BrokerResult<Client> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("meridian/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| BrokerError::Connection(format!("failed to build HTTP client: {err}")))
}

pub(crate) fn require_credentials(credentials: &Option<Credentials>) -> BrokerResult<&Credentials> {
    credentials
        .as_ref()
        .ok_or_else(|| BrokerError::Authentication("missing API credentials".into()))
}

/// Classify a non-success HTTP status before looking at the body's error code
pub(crate) fn classify_status(status: StatusCode, body: &str) -> Option<BrokerError> {
    let detail = || format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status.as_u16() {
        429 | 418 => Some(BrokerError::RateLimited(detail())),
        500 | 502 | 503 | 504 => Some(BrokerError::ServiceUnavailable(detail())),
        401 => Some(BrokerError::Authentication(detail())),
        403 => {
            // Some exchanges answer throttling with 403 instead of 429
            let lower = body.to_ascii_lowercase();
            if lower.contains("rate") || lower.contains("throttl") || lower.contains("too many")
            {
                Some(BrokerError::RateLimited(detail()))
            } else {
                Some(BrokerError::PermissionDenied(detail()))
            }
        }
        _ => None,
    }
}

/// Read a response body, classifying transport failures and the HTTP status
///
/// Returns the status and body for venue-specific error-code parsing when
/// the status alone does not decide the error.
pub(crate) async fn read_body(response: reqwest::Response) -> BrokerResult<(StatusCode, String)> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        if let Some(err) = classify_status(status, &body) {
            return Err(err);
        }
    }
    Ok((status, body))
}

pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> BrokerResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| BrokerError::Authentication(format!("invalid signing key: {err}")))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn hmac_sha512(key: &[u8], message: &[u8]) -> BrokerResult<Vec<u8>> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|err| BrokerError::Authentication(format!("invalid signing key: {err}")))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn sha256(message: &[u8]) -> Vec<u8> {
    Sha256::digest(message).to_vec()
}

pub(crate) fn b64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub(crate) fn b64_decode(text: &str) -> BrokerResult<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|err| BrokerError::Authentication(format!("API secret is not base64: {err}")))
}

/// Decimal from a JSON string or number
pub(crate) fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

pub(crate) fn decimal_field(value: &Value, field: &str) -> BrokerResult<Decimal> {
    decimal(&value[field])
        .ok_or_else(|| BrokerError::Parse(format!("missing or invalid decimal field `{field}`")))
}

pub(crate) fn str_field<'a>(value: &'a Value, field: &str) -> BrokerResult<&'a str> {
    value[field]
        .as_str()
        .ok_or_else(|| BrokerError::Parse(format!("missing string field `{field}`")))
}

/// Quantity formatted for an order form: at most 8 decimals, no trailing zeros
pub(crate) fn quantity_string(qty: Decimal) -> String {
    qty.round_dp_with_strategy(8, rust_decimal::RoundingStrategy::ToZero)
        .normalize()
        .to_string()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            Some(BrokerError::RateLimited(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, ""),
            Some(BrokerError::ServiceUnavailable(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "Rate limit exceeded"),
            Some(BrokerError::RateLimited(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "key lacks trade permission"),
            Some(BrokerError::PermissionDenied(_))
        ));
        assert!(classify_status(StatusCode::BAD_REQUEST, "{}").is_none());
    }

    #[test]
    fn test_decimal_parsing() {
        assert_eq!(decimal(&json!("0.50000000")), Some(dec!(0.5)));
        assert_eq!(decimal(&json!(12.25)), Some(dec!(12.25)));
        assert_eq!(decimal(&json!("")), None);
        assert_eq!(decimal(&json!(null)), None);
    }

    #[test]
    fn test_quantity_string() {
        assert_eq!(quantity_string(dec!(0.000123456789)), "0.00012345");
        assert_eq!(quantity_string(dec!(1.50000000)), "1.5");
    }

    #[test]
    fn test_signatures_have_expected_width() {
        assert_eq!(hmac_sha256(b"key", b"msg").unwrap().len(), 32);
        assert_eq!(hmac_sha512(b"key", b"msg").unwrap().len(), 64);
        assert_eq!(
            hmac_sha256(b"key", b"msg").unwrap(),
            hmac_sha256(b"key", b"msg").unwrap()
        );
        assert!(b64_decode("not base64!").is_err());
    }
}
