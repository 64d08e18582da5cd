//! Binance spot REST client
//!
//! Signed endpoints append `signature = hex(HMAC-SHA256(secret, query))` to
//! the query string. Binance's replay guard is a millisecond `timestamp`
//! checked against `recvWindow`; a rejection there (-1021) is treated like an
//! invalid nonce.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use meridian_core::{
    Candle, ExchangeId, ExecutionReport, OrderHandle, OrderRequest, OrderSize, OrderStatus,
    OrderType, Price, Side, Symbol, Timeframe,
};
use meridian_nonce::NonceIssuer;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use super::http::{
    build_client, decimal, hmac_sha256, quantity_string, read_body, require_credentials,
    str_field,
};
use super::{Balances, VenueApi, VenueConfig};
use crate::credentials::Credentials;
use crate::error::{BrokerError, BrokerResult};
use crate::symbols::{venue_symbol, venue_timeframe};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const RECV_WINDOW_MS: u64 = 5_000;
const ORDER_DOES_NOT_EXIST: i64 = -2013;

pub struct BinanceClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl BinanceClient {
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

    async fn signed(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> BrokerResult<Value> {
        let creds = require_credentials(&self.credentials)?;
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = serde_urlencoded::to_string(&params)
            .map_err(|err| BrokerError::InvalidRequest(err.to_string()))?;
        let signature = sign(&creds.api_secret, &query)?;

        debug!("[BINANCE] {} {}", method, path);
        let response = self
            .http
            .request(
                method,
                format!("{}{}?{}&signature={}", self.base_url, path, query, signature),
            )
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await?;
        let (status, body) = read_body(response).await?;
        parse_response(status.is_success(), &body)
    }
}

#[async_trait]
impl VenueApi for BinanceClient {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.public("/api/v3/ping", &[]).await.map(|_| ())
    }

    async fn balances(&self, _nonces: &NonceIssuer) -> BrokerResult<Balances> {
        let result = self
            .signed(Method::GET, "/api/v3/account", vec![("omitZeroBalances", "true".into())])
            .await?;
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
                "/api/v3/klines",
                &[
                    ("symbol", venue_symbol(ExchangeId::Binance, symbol)),
                    ("interval", venue_timeframe(ExchangeId::Binance, timeframe)),
                    ("limit", count.clamp(1, 1000).to_string()),
                ],
            )
            .await?;
        parse_klines(&result)
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        _reference_price: Price,
        _nonces: &NonceIssuer,
    ) -> BrokerResult<OrderHandle> {
        let mut params = vec![
            ("symbol", venue_symbol(ExchangeId::Binance, &request.symbol)),
            (
                "side",
                match request.side {
                    Side::Buy => "BUY",
                    Side::Sell => "SELL",
                }
                .to_string(),
            ),
            ("newClientOrderId", request.client_order_id.to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        match (request.order_type, request.size, request.limit_price) {
            (OrderType::Limit, size, Some(price)) => {
                let qty = match size {
                    OrderSize::Base(qty) => qty,
                    OrderSize::Quote(quote) => quote / price,
                };
                params.push(("type", "LIMIT".into()));
                params.push(("timeInForce", "GTC".into()));
                params.push(("quantity", quantity_string(qty)));
                params.push(("price", price.normalize().to_string()));
            }
            (_, OrderSize::Quote(quote), _) => {
                params.push(("type", "MARKET".into()));
                params.push(("quoteOrderQty", quote.round_dp(2).to_string()));
            }
            (_, OrderSize::Base(qty), _) => {
                params.push(("type", "MARKET".into()));
                params.push(("quantity", quantity_string(qty)));
            }
        }

        let result = self.signed(Method::POST, "/api/v3/order", params).await?;
        let order_id = result["orderId"]
            .as_i64()
            .ok_or_else(|| BrokerError::Unverified(format!("order response without id: {result}")))?;
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
        let result = self
            .signed(
                Method::GET,
                "/api/v3/order",
                vec![
                    ("symbol", venue_symbol(ExchangeId::Binance, &handle.symbol)),
                    ("orderId", handle.order_id.clone()),
                ],
            )
            .await?;
        parse_order(handle, &result)
    }

    async fn find_order(
        &self,
        symbol: &Symbol,
        client_order_id: Uuid,
        _nonces: &NonceIssuer,
    ) -> BrokerResult<Option<OrderHandle>> {
        let result = self
            .signed(
                Method::GET,
                "/api/v3/order",
                vec![
                    ("symbol", venue_symbol(ExchangeId::Binance, symbol)),
                    ("origClientOrderId", client_order_id.to_string()),
                ],
            )
            .await;
        match result {
            Ok(order) => Ok(order["orderId"].as_i64().map(|id| OrderHandle {
                order_id: id.to_string(),
                client_order_id,
                symbol: symbol.clone(),
            })),
            Err(BrokerError::Rejected(msg)) if msg.starts_with(&ORDER_DOES_NOT_EXIST.to_string()) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_order(&self, handle: &OrderHandle, _nonces: &NonceIssuer) -> BrokerResult<()> {
        self.signed(
            Method::DELETE,
            "/api/v3/order",
            vec![
                ("symbol", venue_symbol(ExchangeId::Binance, &handle.symbol)),
                ("orderId", handle.order_id.clone()),
            ],
        )
        .await
        .map(|_| ())
    }
}

fn sign(secret: &str, query: &str) -> BrokerResult<String> {
    Ok(hex::encode(hmac_sha256(secret.as_bytes(), query.as_bytes())?))
}

fn parse_response(success: bool, body: &str) -> BrokerResult<Value> {
    let value: Value = serde_json::from_str(body)?;
    if !success {
        let code = value["code"].as_i64().unwrap_or_default();
        let msg = value["msg"].as_str().unwrap_or(body);
        return Err(map_error(code, msg));
    }
    Ok(value)
}

fn map_error(code: i64, msg: &str) -> BrokerError {
    let detail = format!("{code} {msg}");
    match code {
        -1021 => BrokerError::InvalidNonce(detail),
        -1003 | -1015 => BrokerError::RateLimited(detail),
        -1001 => BrokerError::Connection(detail),
        -1007 => BrokerError::Timeout(detail),
        -1016 => BrokerError::ServiceUnavailable(detail),
        -1002 | -1022 | -2014 | -2015 => BrokerError::Authentication(detail),
        -2010 if msg.to_ascii_lowercase().contains("insufficient") => {
            BrokerError::InsufficientFunds(detail)
        }
        -1100 | -1102 | -1104 | -1106 | -1111 | -1121 => BrokerError::InvalidRequest(detail),
        _ => BrokerError::Rejected(detail),
    }
}

fn parse_balances(result: &Value) -> BrokerResult<Balances> {
    let rows = result["balances"]
        .as_array()
        .ok_or_else(|| BrokerError::Parse("account response has no `balances`".into()))?;
    let mut balances = Balances::default();
    for row in rows {
        let free = decimal(&row["free"]).unwrap_or_default();
        if free > Decimal::ZERO {
            balances.add(str_field(row, "asset")?.to_ascii_uppercase(), free);
        }
    }
    Ok(balances)
}

fn parse_klines(result: &Value) -> BrokerResult<Vec<Candle>> {
    let rows = result
        .as_array()
        .ok_or_else(|| BrokerError::Parse("klines response is not an array".into()))?;
    rows.iter()
        .map(|row| {
            let ms = row[0]
                .as_i64()
                .ok_or_else(|| BrokerError::Parse("kline missing open time".into()))?;
            let field = |idx: usize| {
                decimal(&row[idx]).ok_or_else(|| BrokerError::Parse(format!("kline field {idx}")))
            };
            Ok(Candle {
                timestamp: DateTime::<Utc>::from_timestamp_millis(ms)
                    .ok_or_else(|| BrokerError::Parse(format!("bad kline time {ms}")))?,
                open: field(1)?,
                high: field(2)?,
                low: field(3)?,
                close: field(4)?,
                volume: field(5)?,
            })
        })
        .collect()
}

fn parse_order(handle: &OrderHandle, order: &Value) -> BrokerResult<ExecutionReport> {
    let filled_qty = decimal(&order["executedQty"]).unwrap_or_default();
    let quote_filled = decimal(&order["cummulativeQuoteQty"]).unwrap_or_default();
    let status = match str_field(order, "status")? {
        "NEW" | "PENDING_NEW" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "PENDING_CANCEL" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
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
        avg_price: (filled_qty > Decimal::ZERO).then(|| quote_filled / filled_qty),
        // Commission is only reported per trade
        fee: Decimal::ZERO,
    })
}
