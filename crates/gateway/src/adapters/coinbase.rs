//! Coinbase Advanced Trade REST client
//!
//! Signed with `CB-ACCESS-SIGN = hex(HMAC-SHA256(secret, ts ‖ method ‖ path ‖ body))`.
//! Coinbase does not validate nonces; requests are still serialized by the
//! authority like every other privileged call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use meridian_core::{
    Candle, ExchangeId, ExecutionReport, OrderHandle, OrderRequest, OrderSize, OrderStatus, Price,
    Side, Symbol, Timeframe,
};
use meridian_nonce::NonceIssuer;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use uuid::Uuid;

use super::http::{
    build_client, decimal, hmac_sha256, quantity_string, read_body, require_credentials,
    str_field,
};
use super::{Balances, VenueApi, VenueConfig};
use crate::credentials::Credentials;
use crate::error::{BrokerError, BrokerResult};
use crate::symbols::{venue_symbol, venue_timeframe};

const DEFAULT_BASE_URL: &str = "https://api.coinbase.com";

pub struct CoinbaseClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl CoinbaseClient {
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
        let (status, body) = read_body(response).await?;
        parse_response(status.is_success(), &body)
    }

    async fn signed(&self, method: Method, path: &str, body: Option<Value>) -> BrokerResult<Value> {
        let creds = require_credentials(&self.credentials)?;
        let timestamp = Utc::now().timestamp().to_string();
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        // Query strings are not part of the signed path
        let signed_path = path.split('?').next().unwrap_or(path);
        let signature = sign(&creds.api_secret, &timestamp, method.as_str(), signed_path, &body)?;

        debug!("[COINBASE] {} {}", method, path);
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("CB-ACCESS-KEY", &creds.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("Content-Type", "application/json");
        if !body.is_empty() {
            request = request.body(body);
        }
        let (status, body) = read_body(request.send().await?).await?;
        parse_response(status.is_success(), &body)
    }
}

#[async_trait]
impl VenueApi for CoinbaseClient {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Coinbase
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.public("/api/v3/brokerage/time", &[]).await.map(|_| ())
    }

    async fn balances(&self, _nonces: &NonceIssuer) -> BrokerResult<Balances> {
        let result = self
            .signed(Method::GET, "/api/v3/brokerage/accounts?limit=250", None)
            .await?;
        parse_balances(&result)
    }

    async fn candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>> {
        let end = Utc::now().timestamp();
        let span = timeframe.seconds() as i64 * count.min(350) as i64;
        let path = format!(
            "/api/v3/brokerage/market/products/{}/candles",
            venue_symbol(ExchangeId::Coinbase, symbol)
        );
        let result = self
            .public(
                &path,
                &[
                    ("start", (end - span).to_string()),
                    ("end", end.to_string()),
                    (
                        "granularity",
                        venue_timeframe(ExchangeId::Coinbase, timeframe),
                    ),
                ],
            )
            .await?;
        let mut candles = parse_candles(&result)?;
        if candles.len() > count {
            candles.drain(..candles.len() - count);
        }
        Ok(candles)
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        _reference_price: Price,
        _nonces: &NonceIssuer,
    ) -> BrokerResult<OrderHandle> {
        let configuration = match (request.limit_price, request.size) {
            (Some(price), size) => {
                let base = match size {
                    OrderSize::Base(qty) => qty,
                    OrderSize::Quote(quote) => quote / price,
                };
                json!({"limit_limit_gtc": {
                    "base_size": quantity_string(base),
                    "limit_price": price.normalize().to_string(),
                }})
            }
            (None, OrderSize::Quote(quote)) => {
                json!({"market_market_ioc": {"quote_size": quote.round_dp(2).to_string()}})
            }
            (None, OrderSize::Base(qty)) => {
                json!({"market_market_ioc": {"base_size": quantity_string(qty)}})
            }
        };
        let side = match request.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let body = json!({
            "client_order_id": request.client_order_id.to_string(),
            "product_id": venue_symbol(ExchangeId::Coinbase, &request.symbol),
            "side": side,
            "order_configuration": configuration,
        });

        let result = self
            .signed(Method::POST, "/api/v3/brokerage/orders", Some(body))
            .await?;
        if result["success"].as_bool() != Some(true) {
            return Err(map_error(
                result["error_response"]["error"]
                    .as_str()
                    .or_else(|| result["failure_reason"].as_str())
                    .unwrap_or("UNKNOWN_FAILURE_REASON"),
                result["error_response"]["message"]
                    .as_str()
                    .unwrap_or_default(),
            ));
        }
        let order_id = result["success_response"]["order_id"]
            .as_str()
            .ok_or_else(|| BrokerError::Unverified(format!("order accepted without id: {result}")))?;
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
        let path = format!("/api/v3/brokerage/orders/historical/{}", handle.order_id);
        let result = self.signed(Method::GET, &path, None).await?;
        parse_order(handle, &result["order"])
    }

    async fn find_order(
        &self,
        symbol: &Symbol,
        client_order_id: Uuid,
        _nonces: &NonceIssuer,
    ) -> BrokerResult<Option<OrderHandle>> {
        let path = format!(
            "/api/v3/brokerage/orders/historical/batch?product_ids={}&limit=100",
            venue_symbol(ExchangeId::Coinbase, symbol)
        );
        let result = self.signed(Method::GET, &path, None).await?;
        let client_id = client_order_id.to_string();
        let found = result["orders"].as_array().and_then(|orders| {
            orders
                .iter()
                .find(|order| order["client_order_id"].as_str() == Some(client_id.as_str()))
                .and_then(|order| order["order_id"].as_str())
        });
        Ok(found.map(|order_id| OrderHandle {
            order_id: order_id.to_string(),
            client_order_id,
            symbol: symbol.clone(),
        }))
    }

    async fn cancel_order(&self, handle: &OrderHandle, _nonces: &NonceIssuer) -> BrokerResult<()> {
        let result = self
            .signed(
                Method::POST,
                "/api/v3/brokerage/orders/batch_cancel",
                Some(json!({"order_ids": [handle.order_id]})),
            )
            .await?;
        let first = &result["results"][0];
        if first["success"].as_bool() == Some(true) {
            Ok(())
        } else {
            Err(map_error(
                first["failure_reason"].as_str().unwrap_or("UNKNOWN_CANCEL_FAILURE_REASON"),
                "",
            ))
        }
    }
}

fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> BrokerResult<String> {
    let message = format!("{timestamp}{method}{path}{body}");
    Ok(hex::encode(hmac_sha256(secret.as_bytes(), message.as_bytes())?))
}

fn parse_response(success: bool, body: &str) -> BrokerResult<Value> {
    let value: Value = serde_json::from_str(body)?;
    if !success {
        let code = value["error"].as_str().unwrap_or("UNKNOWN");
        let message = value["message"].as_str().unwrap_or(body);
        return Err(map_error(code, message));
    }
    Ok(value)
}

fn map_error(code: &str, message: &str) -> BrokerError {
    let msg = format!("{code}: {message}");
    match code {
        "INSUFFICIENT_FUND" | "INSUFFICIENT_FUNDS" => BrokerError::InsufficientFunds(msg),
        "UNAUTHENTICATED" | "INVALID_API_KEY" => BrokerError::Authentication(msg),
        "PERMISSION_DENIED" => BrokerError::PermissionDenied(msg),
        "RATE_LIMIT_EXCEEDED" | "TOO_MANY_REQUESTS" => BrokerError::RateLimited(msg),
        "UNAVAILABLE" | "INTERNAL" => BrokerError::ServiceUnavailable(msg),
        "DEADLINE_EXCEEDED" => BrokerError::Timeout(msg),
        "INVALID_ARGUMENT" | "INVALID_PRODUCT_ID" | "UNSUPPORTED_ORDER_CONFIGURATION" => {
            BrokerError::InvalidRequest(msg)
        }
        _ => BrokerError::Rejected(msg),
    }
}

fn parse_balances(result: &Value) -> BrokerResult<Balances> {
    let accounts = result["accounts"]
        .as_array()
        .ok_or_else(|| BrokerError::Parse("accounts response has no `accounts`".into()))?;
    let mut balances = Balances::default();
    for account in accounts {
        let currency = str_field(account, "currency")?;
        if let Some(amount) = decimal(&account["available_balance"]["value"]) {
            balances.add(currency.to_ascii_uppercase(), amount);
        }
    }
    Ok(balances)
}

fn parse_candles(result: &Value) -> BrokerResult<Vec<Candle>> {
    let rows = result["candles"]
        .as_array()
        .ok_or_else(|| BrokerError::Parse("candles response has no `candles`".into()))?;
    let mut candles = rows
        .iter()
        .map(|row| {
            let secs = row["start"]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| BrokerError::Parse("candle missing start".into()))?;
            let field = |name: &str| {
                decimal(&row[name]).ok_or_else(|| BrokerError::Parse(format!("candle `{name}`")))
            };
            Ok(Candle {
                timestamp: DateTime::<Utc>::from_timestamp(secs, 0)
                    .ok_or_else(|| BrokerError::Parse(format!("bad candle time {secs}")))?,
                open: field("open")?,
                high: field("high")?,
                low: field("low")?,
                close: field("close")?,
                volume: field("volume")?,
            })
        })
        .collect::<BrokerResult<Vec<_>>>()?;
    // Newest first on the wire
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

fn parse_order(handle: &OrderHandle, order: &Value) -> BrokerResult<ExecutionReport> {
    let filled_qty = decimal(&order["filled_size"]).unwrap_or_default();
    let status = match str_field(order, "status")? {
        "PENDING" | "QUEUED" | "OPEN" if filled_qty.is_zero() => OrderStatus::Open,
        "PENDING" | "QUEUED" | "OPEN" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" | "CANCEL_QUEUED" => OrderStatus::Canceled,
        "EXPIRED" => OrderStatus::Expired,
        "FAILED" => OrderStatus::Rejected,
        other => return Err(BrokerError::Parse(format!("unknown order status {other}"))),
    };
    Ok(ExecutionReport {
        handle: handle.clone(),
        side: match order["side"].as_str() {
            Some("SELL") => Side::Sell,
            _ => Side::Buy,
        },
        status,
        filled_qty,
        avg_price: decimal(&order["average_filled_price"]).filter(|p| !p.is_zero()),
        fee: decimal(&order["total_fees"]).unwrap_or_default(),
    })
}
