//! Kraken spot REST client
//!
//! Private calls are form-encoded POSTs carrying the authority's nonce and
//! signed as `b64(HMAC-SHA512(b64dec(secret), path ‖ SHA256(nonce ‖ body)))`.
//! Kraken answers almost everything with HTTP 200 and an `error` array.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use meridian_core::{
    Candle, ExchangeId, ExecutionReport, OrderHandle, OrderRequest, OrderSize, OrderStatus,
    OrderType, Price, Side, Symbol, Timeframe,
};
use meridian_nonce::NonceIssuer;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use super::http::{
    b64_decode, b64_encode, build_client, decimal, decimal_field, hmac_sha512, quantity_string,
    read_body, require_credentials, sha256, str_field,
};
use super::{Balances, VenueApi, VenueConfig};
use crate::credentials::Credentials;
use crate::error::{BrokerError, BrokerResult};
use crate::symbols::{canonical_asset, venue_symbol, venue_timeframe};

const DEFAULT_BASE_URL: &str = "https://api.kraken.com";

pub struct KrakenClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl KrakenClient {
    pub fn new(config: VenueConfig) -> BrokerResult<Self> {
        Ok(Self {
            http: build_client()?,
            base_url: config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            credentials: config.credentials,
        })
    }

    async fn public(&self, path: &str, query: &[(&str, String)]) -> BrokerResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(url).query(query).send().await?;
        let (_, body) = read_body(response).await?;
        parse_envelope(&body)
    }

    async fn private(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
        nonces: &NonceIssuer,
    ) -> BrokerResult<Value> {
        let creds = require_credentials(&self.credentials)?;
        let nonce = nonces.next();

        let mut form = vec![("nonce", nonce.to_string())];
        form.extend(params);
        let body = serde_urlencoded::to_string(&form)
            .map_err(|err| BrokerError::InvalidRequest(err.to_string()))?;
        let signature = sign(&creds.api_secret, path, nonce, &body)?;

        debug!("[KRAKEN] POST {} nonce={}", path, nonce);
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("API-Key", &creds.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let (_, body) = read_body(response).await?;
        parse_envelope(&body)
    }

    async fn orders_by_userref(
        &self,
        path: &str,
        bucket: &str,
        userref: i32,
        client_order_id: Uuid,
        nonces: &NonceIssuer,
    ) -> BrokerResult<Option<String>> {
        let result = self
            .private(path, vec![("userref", userref.to_string())], nonces)
            .await?;
        let Some(orders) = result[bucket].as_object() else {
            return Ok(None);
        };
        let txid = orders
            .iter()
            .find(|(_, info)| is_client_order(info, userref, client_order_id))
            .map(|(txid, _)| txid.clone());
        Ok(txid)
    }
}

#[async_trait]
impl VenueApi for KrakenClient {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Kraken
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.public("/0/public/Time", &[]).await.map(|_| ())
    }

    async fn balances(&self, nonces: &NonceIssuer) -> BrokerResult<Balances> {
        let result = self.private("/0/private/Balance", Vec::new(), nonces).await?;
        parse_balances(&result)
    }

    async fn candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>> {
        let result = self
            .public(
                "/0/public/OHLC",
                &[
                    ("pair", venue_symbol(ExchangeId::Kraken, symbol)),
                    ("interval", venue_timeframe(ExchangeId::Kraken, timeframe)),
                ],
            )
            .await?;
        let mut candles = parse_ohlc(&result)?;
        if candles.len() > count {
            candles.drain(..candles.len() - count);
        }
        Ok(candles)
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        reference_price: Price,
        nonces: &NonceIssuer,
    ) -> BrokerResult<OrderHandle> {
        let volume = match request.size {
            OrderSize::Base(qty) => qty,
            OrderSize::Quote(quote) => quote / reference_price,
        };
        let mut params = vec![
            ("pair", venue_symbol(ExchangeId::Kraken, &request.symbol)),
            ("type", request.side.as_str().to_string()),
            (
                "ordertype",
                match request.order_type {
                    OrderType::Market => "market",
                    OrderType::Limit => "limit",
                }
                .to_string(),
            ),
            ("volume", quantity_string(volume)),
            ("userref", userref(request.client_order_id).to_string()),
        ];
        if let Some(price) = request.limit_price {
            params.push(("price", price.normalize().to_string()));
        }

        let result = self.private("/0/private/AddOrder", params, nonces).await?;
        let order_id = result["txid"][0].as_str().ok_or_else(|| {
            BrokerError::Unverified(format!("AddOrder returned no txid: {result}"))
        })?;
        Ok(OrderHandle {
            order_id: order_id.to_string(),
            client_order_id: request.client_order_id,
            symbol: request.symbol.clone(),
        })
    }

    async fn order_status(
        &self,
        handle: &OrderHandle,
        nonces: &NonceIssuer,
    ) -> BrokerResult<ExecutionReport> {
        let result = self
            .private(
                "/0/private/QueryOrders",
                vec![("txid", handle.order_id.clone()), ("trades", "false".into())],
                nonces,
            )
            .await?;
        let info = result.get(&handle.order_id).ok_or_else(|| {
            BrokerError::Parse(format!("QueryOrders has no entry for {}", handle.order_id))
        })?;
        parse_order(handle, info)
    }

    async fn find_order(
        &self,
        symbol: &Symbol,
        client_order_id: Uuid,
        nonces: &NonceIssuer,
    ) -> BrokerResult<Option<OrderHandle>> {
        let userref = userref(client_order_id);
        // Two privileged calls inside the caller's section, one nonce each
        let mut txid = self
            .orders_by_userref("/0/private/OpenOrders", "open", userref, client_order_id, nonces)
            .await?;
        if txid.is_none() {
            txid = self
                .orders_by_userref(
                    "/0/private/ClosedOrders",
                    "closed",
                    userref,
                    client_order_id,
                    nonces,
                )
                .await?;
        }
        Ok(txid.map(|order_id| OrderHandle {
            order_id,
            client_order_id,
            symbol: symbol.clone(),
        }))
    }

    async fn cancel_order(&self, handle: &OrderHandle, nonces: &NonceIssuer) -> BrokerResult<()> {
        self.private(
            "/0/private/CancelOrder",
            vec![("txid", handle.order_id.clone())],
            nonces,
        )
        .await
        .map(|_| ())
    }
}

/// `API-Sign` header value
fn sign(secret: &str, path: &str, nonce: u64, body: &str) -> BrokerResult<String> {
    let key = b64_decode(secret)?;
    let mut message = path.as_bytes().to_vec();
    message.extend(sha256(format!("{nonce}{body}").as_bytes()));
    Ok(b64_encode(&hmac_sha512(&key, &message)?))
}

/// Kraken order tag derived from the client order id (positive i32)
fn userref(client_order_id: Uuid) -> i32 {
    let bytes = client_order_id.as_bytes();
    let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7fff_ffff;
    raw as i32
}

fn parse_envelope(body: &str) -> BrokerResult<Value> {
    let value: Value = serde_json::from_str(body)?;
    if let Some(first) = value["error"].as_array().and_then(|errors| errors.first()) {
        return Err(map_error(first.as_str().unwrap_or_default()));
    }
    Ok(value["result"].clone())
}

fn map_error(message: &str) -> BrokerError {
    let msg = message.to_string();
    if message.contains("Invalid nonce") {
        BrokerError::InvalidNonce(msg)
    } else if message.contains("Invalid key") || message.contains("Invalid signature") {
        BrokerError::Authentication(msg)
    } else if message.contains("Permission denied") {
        BrokerError::PermissionDenied(msg)
    } else if message.contains("Insufficient funds") {
        BrokerError::InsufficientFunds(msg)
    } else if message.contains("Rate limit") || message.contains("Too many requests") {
        BrokerError::RateLimited(msg)
    } else if message.contains("Deadline elapsed") {
        BrokerError::Timeout(msg)
    } else if message.starts_with("EService:") {
        BrokerError::ServiceUnavailable(msg)
    } else if message.contains("Invalid arguments") || message.contains("Unknown asset pair") {
        BrokerError::InvalidRequest(msg)
    } else {
        BrokerError::Rejected(msg)
    }
}

fn parse_balances(result: &Value) -> BrokerResult<Balances> {
    let entries = result
        .as_object()
        .ok_or_else(|| BrokerError::Parse("Balance result is not an object".into()))?;
    let mut balances = Balances::default();
    for (asset, amount) in entries {
        if let Some(amount) = decimal(amount) {
            balances.add(canonical_asset(ExchangeId::Kraken, asset), amount);
        }
    }
    Ok(balances)
}

fn parse_ohlc(result: &Value) -> BrokerResult<Vec<Candle>> {
    let rows = result
        .as_object()
        .and_then(|obj| {
            obj.iter()
                .find(|(key, value)| key.as_str() != "last" && value.is_array())
        })
        .and_then(|(_, rows)| rows.as_array())
        .ok_or_else(|| BrokerError::Parse("OHLC result has no pair entry".into()))?;

    rows.iter()
        .map(|row| {
            let secs = row[0]
                .as_i64()
                .ok_or_else(|| BrokerError::Parse("OHLC row missing time".into()))?;
            let field = |idx: usize| {
                decimal(&row[idx])
                    .ok_or_else(|| BrokerError::Parse(format!("OHLC row field {idx} invalid")))
            };
            Ok(Candle {
                timestamp: DateTime::<Utc>::from_timestamp(secs, 0)
                    .ok_or_else(|| BrokerError::Parse(format!("bad OHLC time {secs}")))?,
                open: field(1)?,
                high: field(2)?,
                low: field(3)?,
                close: field(4)?,
                volume: field(6)?,
            })
        })
        .collect()
}

fn parse_order(handle: &OrderHandle, info: &Value) -> BrokerResult<ExecutionReport> {
    let filled_qty = decimal(&info["vol_exec"]).unwrap_or_default();
    let cost = decimal(&info["cost"]).unwrap_or_default();
    let status = match str_field(info, "status")? {
        "pending" => OrderStatus::Open,
        "open" => OrderStatus::working(filled_qty),
        "closed" => OrderStatus::Filled,
        "canceled" => OrderStatus::Canceled,
        "expired" => OrderStatus::Expired,
        other => return Err(BrokerError::Parse(format!("unknown order status {other}"))),
    };
    let side = match info["descr"]["type"].as_str() {
        Some("sell") => Side::Sell,
        _ => Side::Buy,
    };
    let avg_price = if filled_qty > Decimal::ZERO && cost > Decimal::ZERO {
        Some(cost / filled_qty)
    } else {
        decimal(&info["price"]).filter(|p| *p > Decimal::ZERO)
    };

    Ok(ExecutionReport {
        handle: handle.clone(),
        side,
        status,
        filled_qty,
        avg_price,
        fee: decimal_field(info, "fee").unwrap_or_default(),
    })
}

/// Whether an order listing entry belongs to our client order id
///
/// A `cl_ord_id` must equal the id itself; without one the order's `userref`
/// must match. The query filter alone is not trusted.
fn is_client_order(info: &Value, userref: i32, client_order_id: Uuid) -> bool {
    match info["cl_ord_id"].as_str() {
        Some(id) => id == client_order_id.to_string(),
        None => info["userref"].as_i64() == Some(i64::from(userref)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_errors_map_to_typed_variants() {
        assert!(matches!(
            parse_envelope(r#"{"error":["EAPI:Invalid nonce"]}"#),
            Err(BrokerError::InvalidNonce(_))
        ));
        assert!(matches!(map_error("EAPI:Invalid key"), BrokerError::Authentication(_)));
        assert!(matches!(
            map_error("EGeneral:Permission denied"),
            BrokerError::PermissionDenied(_)
        ));
        assert!(matches!(
            map_error("EOrder:Insufficient funds"),
            BrokerError::InsufficientFunds(_)
        ));
        assert!(matches!(
            map_error("EAPI:Rate limit exceeded"),
            BrokerError::RateLimited(_)
        ));
        assert!(matches!(map_error("EService:Busy"), BrokerError::ServiceUnavailable(_)));
        assert!(matches!(
            map_error("EService:Deadline elapsed"),
            BrokerError::Timeout(_)
        ));
    }

    #[test]
    fn test_parse_balances_normalizes_assets() {
        let result = json!({"ZUSD": "1000.5000", "XXBT": "0.0100000000", "USDT": "5"});
        let balances = parse_balances(&result).unwrap();
        assert_eq!(balances.get("USD"), dec!(1000.5));
        assert_eq!(balances.get("BTC"), dec!(0.01));
        assert_eq!(balances.get("USDT"), dec!(5));
    }

    #[test]
    fn test_parse_ohlc_skips_last_key() {
        let result = json!({
            "XXBTZUSD": [
                [1700000000, "100.0", "101.0", "99.0", "100.5", "100.2", "3.5", 12],
                [1700000300, "100.5", "102.0", "100.0", "101.5", "101.0", "4.0", 9]
            ],
            "last": 1700000300
        });
        let candles = parse_ohlc(&result).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, dec!(101.5));
        assert_eq!(candles[1].volume, dec!(4.0));
    }

    #[test]
    fn test_parse_order_computes_average_price() {
        let handle = OrderHandle {
            order_id: "OABC-123".into(),
            client_order_id: Uuid::new_v4(),
            symbol: Symbol::new("BTC", "USD"),
        };
        let info = json!({
            "status": "closed",
            "vol_exec": "0.002",
            "cost": "100.0",
            "fee": "0.26",
            "price": "50000.0",
            "descr": {"type": "buy"}
        });
        let report = parse_order(&handle, &info).unwrap();
        assert!(report.is_filled());
        assert_eq!(report.avg_price, Some(dec!(50000)));
        assert_eq!(report.fee, dec!(0.26));
    }

    #[test]
    fn test_userref_is_stable_and_positive() {
        let id = Uuid::new_v4();
        assert_eq!(userref(id), userref(id));
        assert!(userref(id) >= 0);
    }

    #[test]
    fn test_order_lookup_requires_matching_reference() {
        let id = Uuid::new_v4();
        let reference = userref(id);
        assert!(is_client_order(&json!({ "userref": reference }), reference, id));
        assert!(is_client_order(&json!({ "cl_ord_id": id.to_string() }), reference, id));
        assert!(!is_client_order(&json!({ "cl_ord_id": Uuid::new_v4().to_string() }), reference, id));
        assert!(!is_client_order(&json!({ "userref": reference + 1 }), reference, id));
        assert!(!is_client_order(&json!({ "userref": null }), reference, id));
        assert!(!is_client_order(&json!({}), reference, id));
    }

    #[test]
    fn test_sign_requires_base64_secret() {
        assert!(sign("%%%", "/0/private/Balance", 1, "nonce=1").is_err());
        let secret = b64_encode(b"secret-bytes");
        let sig = sign(&secret, "/0/private/Balance", 1, "nonce=1").unwrap();
        assert_eq!(b64_decode(&sig).unwrap().len(), 64);
    }
}
