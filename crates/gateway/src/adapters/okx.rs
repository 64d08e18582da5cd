//! OKX v5 REST client
//!
//! `OK-ACCESS-SIGN = b64(HMAC-SHA256(secret, ts ‖ method ‖ path ‖ body))`,
//! plus the account passphrase. Responses carry a string `code`; `"0"` is
//! success and order endpoints add a per-item `sCode`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use meridian_core::{
    Candle, ExchangeId, ExecutionReport, OrderHandle, OrderRequest, OrderSize, OrderStatus,
    OrderType, Price, Side, Symbol, Timeframe,
};
use meridian_nonce::NonceIssuer;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use uuid::Uuid;

use super::http::{
    b64_encode, build_client, decimal, hmac_sha256, quantity_string, read_body,
    require_credentials, str_field,
};
use super::{Balances, VenueApi, VenueConfig};
use crate::credentials::Credentials;
use crate::error::{BrokerError, BrokerResult};
use crate::symbols::{venue_symbol, venue_timeframe};

const DEFAULT_BASE_URL: &str = "https://www.okx.com";
const ORDER_DOES_NOT_EXIST: &str = "51603";

pub struct OkxClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl OkxClient {
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
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;
        let (_, body) = read_body(response).await?;
        parse_envelope(&body)
    }

    async fn signed(&self, method: Method, path: &str, body: Option<Value>) -> BrokerResult<Value> {
        let creds = require_credentials(&self.credentials)?;
        let passphrase = creds
            .passphrase
            .as_deref()
            .ok_or_else(|| BrokerError::Authentication("OKX requires a passphrase".into()))?;
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let signature = sign(&creds.api_secret, &timestamp, method.as_str(), path, &body)?;

        debug!("[OKX] {} {}", method, path);
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", passphrase)
            .header("Content-Type", "application/json");
        if !body.is_empty() {
            request = request.body(body);
        }
        let (_, body) = read_body(request.send().await?).await?;
        parse_envelope(&body)
    }
}

#[async_trait]
impl VenueApi for OkxClient {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Okx
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.public("/api/v5/public/time", &[]).await.map(|_| ())
    }

    async fn balances(&self, _nonces: &NonceIssuer) -> BrokerResult<Balances> {
        let data = self
            .signed(Method::GET, "/api/v5/account/balance", None)
            .await?;
        parse_balances(&data)
    }

    async fn candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>> {
        let data = self
            .public(
                "/api/v5/market/candles",
                &[
                    ("instId", venue_symbol(ExchangeId::Okx, symbol)),
                    ("bar", venue_timeframe(ExchangeId::Okx, timeframe)),
                    ("limit", count.clamp(1, 300).to_string()),
                ],
            )
            .await?;
        parse_candles(&data)
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        _reference_price: Price,
        _nonces: &NonceIssuer,
    ) -> BrokerResult<OrderHandle> {
        let mut body = json!({
            "instId": venue_symbol(ExchangeId::Okx, &request.symbol),
            "tdMode": "cash",
            "clOrdId": request.client_order_id.simple().to_string(),
            "side": request.side.as_str(),
        });
        match (request.order_type, request.size, request.limit_price) {
            (OrderType::Limit, size, Some(price)) => {
                let qty = match size {
                    OrderSize::Base(qty) => qty,
                    OrderSize::Quote(quote) => quote / price,
                };
                body["ordType"] = json!("limit");
                body["sz"] = json!(quantity_string(qty));
                body["px"] = json!(price.normalize().to_string());
            }
            (_, OrderSize::Quote(quote), _) => {
                body["ordType"] = json!("market");
                body["tgtCcy"] = json!("quote_ccy");
                body["sz"] = json!(quote.round_dp(2).to_string());
            }
            (_, OrderSize::Base(qty), _) => {
                body["ordType"] = json!("market");
                body["tgtCcy"] = json!("base_ccy");
                body["sz"] = json!(quantity_string(qty));
            }
        }

        let data = self
            .signed(Method::POST, "/api/v5/trade/order", Some(body))
            .await?;
        let item = &data[0];
        check_item(item)?;
        let order_id = item["ordId"]
            .as_str()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BrokerError::Unverified(format!("order response without id: {data}")))?;
        Ok(OrderHandle {
            order_id: order_id.to_string(),
            client_order_id: request.client_order_id,
            symbol: request.symbol.clone(),
        })
    }

    async fn order_status(
        &self,
        handle: &OrderHandle,
        _nonces: &NonceIssuer,
    ) -> BrokerResult<ExecutionReport> {
        let path = format!(
            "/api/v5/trade/order?instId={}&ordId={}",
            venue_symbol(ExchangeId::Okx, &handle.symbol),
            handle.order_id
        );
        let data = self.signed(Method::GET, &path, None).await?;
        parse_order(handle, &data[0])
    }

    async fn find_order(
        &self,
        symbol: &Symbol,
        client_order_id: Uuid,
        _nonces: &NonceIssuer,
    ) -> BrokerResult<Option<OrderHandle>> {
        let path = format!(
            "/api/v5/trade/order?instId={}&clOrdId={}",
            venue_symbol(ExchangeId::Okx, symbol),
            client_order_id.simple()
        );
        match self.signed(Method::GET, &path, None).await {
            Ok(data) => Ok(data[0]["ordId"].as_str().map(|id| OrderHandle {
                order_id: id.to_string(),
                client_order_id,
                symbol: symbol.clone(),
            })),
            Err(BrokerError::Rejected(msg)) if msg.starts_with(ORDER_DOES_NOT_EXIST) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn cancel_order(&self, handle: &OrderHandle, _nonces: &NonceIssuer) -> BrokerResult<()> {
        let data = self
            .signed(
                Method::POST,
                "/api/v5/trade/cancel-order",
                Some(json!({
                    "instId": venue_symbol(ExchangeId::Okx, &handle.symbol),
                    "ordId": handle.order_id,
                })),
            )
            .await?;
        check_item(&data[0])
    }
}

fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> BrokerResult<String> {
    let message = format!("{timestamp}{method}{path}{body}");
    Ok(b64_encode(&hmac_sha256(secret.as_bytes(), message.as_bytes())?))
}

/// Unwrap `{"code": "0", "data": [...]}`
fn parse_envelope(body: &str) -> BrokerResult<Value> {
    let value: Value = serde_json::from_str(body)?;
    let code = value["code"].as_str().unwrap_or("0");
    if code != "0" {
        // Batch-style failures put the real reason in the first item
        let item = &value["data"][0];
        if let (Some(s_code), Some(s_msg)) = (item["sCode"].as_str(), item["sMsg"].as_str()) {
            if s_code != "0" {
                return Err(map_error(s_code, s_msg));
            }
        }
        return Err(map_error(code, value["msg"].as_str().unwrap_or_default()));
    }
    Ok(value["data"].clone())
}

fn check_item(item: &Value) -> BrokerResult<()> {
    match item["sCode"].as_str() {
        Some("0") | None => Ok(()),
        Some(code) => Err(map_error(code, item["sMsg"].as_str().unwrap_or_default())),
    }
}

fn map_error(code: &str, msg: &str) -> BrokerError {
    let detail = format!("{code} {msg}");
    match code {
        "50011" | "50061" => BrokerError::RateLimited(detail),
        "50001" | "50013" => BrokerError::ServiceUnavailable(detail),
        "50004" => BrokerError::Timeout(detail),
        "50102" => BrokerError::InvalidNonce(detail),
        "50100" | "50101" | "50103" | "50104" | "50105" | "50111" | "50113" | "50114" => {
            BrokerError::Authentication(detail)
        }
        "50030" | "50120" => BrokerError::PermissionDenied(detail),
        "51008" | "51131" => BrokerError::InsufficientFunds(detail),
        "51000" | "51001" | "50014" => BrokerError::InvalidRequest(detail),
        _ => BrokerError::Rejected(detail),
    }
}

fn parse_balances(data: &Value) -> BrokerResult<Balances> {
    let details = data[0]["details"]
        .as_array()
        .ok_or_else(|| BrokerError::Parse("balance response has no `details`".into()))?;
    let mut balances = Balances::default();
    for detail in details {
        if let Some(amount) = decimal(&detail["availBal"]).or_else(|| decimal(&detail["cashBal"]))
        {
            balances.add(str_field(detail, "ccy")?.to_ascii_uppercase(), amount);
        }
    }
    Ok(balances)
}

fn parse_candles(data: &Value) -> BrokerResult<Vec<Candle>> {
    let rows = data
        .as_array()
        .ok_or_else(|| BrokerError::Parse("candles response is not an array".into()))?;
    let mut candles = rows
        .iter()
        .map(|row| {
            let ms = row[0]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| BrokerError::Parse("candle missing ts".into()))?;
            let field = |idx: usize| {
                decimal(&row[idx]).ok_or_else(|| BrokerError::Parse(format!("candle field {idx}")))
            };
            Ok(Candle {
                timestamp: DateTime::<Utc>::from_timestamp_millis(ms)
                    .ok_or_else(|| BrokerError::Parse(format!("bad candle time {ms}")))?,
                open: field(1)?,
                high: field(2)?,
                low: field(3)?,
                close: field(4)?,
                volume: field(5)?,
            })
        })
        .collect::<BrokerResult<Vec<_>>>()?;
    // Newest first on the wire
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

fn parse_order(handle: &OrderHandle, order: &Value) -> BrokerResult<ExecutionReport> {
    let filled_qty = decimal(&order["accFillSz"]).unwrap_or_default();
    let status = match str_field(order, "state")? {
        "live" => OrderStatus::Open,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "mmp_canceled" => OrderStatus::Canceled,
        other => return Err(BrokerError::Parse(format!("unknown order state {other}"))),
    };
    Ok(ExecutionReport {
        handle: handle.clone(),
        side: match order["side"].as_str() {
            Some("sell") => Side::Sell,
            _ => Side::Buy,
        },
        status,
        filled_qty,
        avg_price: decimal(&order["avgPx"]).filter(|p| *p > Decimal::ZERO),
        // OKX reports fees as negative amounts
        fee: decimal(&order["fee"]).unwrap_or_default().abs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::http::b64_decode;
    use rust_decimal_macros::dec;

    #[test]
    fn test_envelope_errors() {
        assert!(matches!(
            parse_envelope(r#"{"code":"50011","msg":"Too Many Requests","data":[]}"#),
            Err(BrokerError::RateLimited(_))
        ));
        assert!(matches!(
            parse_envelope(
                r#"{"code":"1","msg":"","data":[{"sCode":"51008","sMsg":"Insufficient balance"}]}"#
            ),
            Err(BrokerError::InsufficientFunds(_))
        ));
        assert!(matches!(map_error("50102", "Timestamp request expired"), BrokerError::InvalidNonce(_)));
        assert!(matches!(map_error("50113", "Invalid Sign"), BrokerError::Authentication(_)));
    }

    #[test]
    fn test_parse_order_fee_is_positive() {
        let handle = OrderHandle {
            order_id: "1".into(),
            client_order_id: Uuid::new_v4(),
            symbol: Symbol::new("ETH", "USDT"),
        };
        let order = serde_json::json!({
            "state": "filled", "accFillSz": "0.5", "avgPx": "2000", "fee": "-0.8", "side": "sell"
        });
        let report = parse_order(&handle, &order).unwrap();
        assert_eq!(report.fee, dec!(0.8));
        assert_eq!(report.side, Side::Sell);
    }

    #[test]
    fn test_parse_balances() {
        let data = serde_json::json!([{"details": [
            {"ccy": "USDT", "availBal": "99.5", "cashBal": "100"},
            {"ccy": "BTC", "availBal": "", "cashBal": "0.01"}
        ]}]);
        let balances = parse_balances(&data).unwrap();
        assert_eq!(balances.get("USDT"), dec!(99.5));
        assert_eq!(balances.get("BTC"), dec!(0.01));
    }

    #[test]
    fn test_sign_is_base64_sha256() {
        let sig = sign("secret", "2024-01-01T00:00:00.000Z", "GET", "/api/v5/account/balance", "")
            .unwrap();
        assert_eq!(b64_decode(&sig).unwrap().len(), 32);
    }
}
