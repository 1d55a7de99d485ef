use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ExchangeConnector, ExchangeOrderStatus, OrderAck, OrderRequest, RequestLimiter, RetryPolicy};
use crate::config::ExchangeSettings;
use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{Balance, Candle, MarketSnapshot, OrderKind, Side, Timeframe};

const API_PREFIX: &str = "/api/v1";

/// Kline row: [open time ms, open, high, low, close, volume]
#[derive(Debug, Deserialize)]
struct KlineRow(i64, String, String, String, String, String);

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    asset: String,
    total: String,
    free: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderBody<'a> {
    symbol: &'a str,
    side: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    quantity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    take_profit_price: Option<String>,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: String,
    client_order_id: String,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    kind: String,
    status: String,
    orig_qty: String,
    executed_qty: String,
    avg_price: Option<String>,
    stop_price: Option<String>,
    update_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    msg: String,
}

/// JSON REST exchange connector
///
/// Every request goes through one token bucket and is retried with exponential
/// backoff while it fails transiently. Order submissions carry the client id
/// so the exchange de-duplicates resubmissions.
pub struct HttpExchange {
    name: String,
    base_url: String,
    api_key: String,
    quote_currency: String,
    call_timeout: Duration,
    client: RwLock<Client>,
    limiter: RequestLimiter,
    retry: RetryPolicy,
}

impl HttpExchange {
    pub fn new(settings: &ExchangeSettings, quote_currency: &str) -> ExchangeResult<Self> {
        let call_timeout = settings.call_timeout();
        let base_url = settings.endpoint().trim_end_matches('/').to_string();

        tracing::info!(
            exchange = %settings.name,
            url = %base_url,
            sandbox = settings.sandbox_mode,
            "HTTP exchange connector configured"
        );

        Ok(Self {
            name: settings.name.clone(),
            base_url,
            api_key: settings.api_key.clone(),
            quote_currency: quote_currency.to_string(),
            call_timeout,
            client: RwLock::new(build_client(call_timeout)?),
            limiter: RequestLimiter::per_second(settings.requests_per_second),
            retry: RetryPolicy::new(
                settings.max_retries,
                Duration::from_millis(settings.retry_base_ms),
            ),
        })
    }

    fn client(&self) -> Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One rate-limited request, no retries
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> ExchangeResult<String> {
        self.limiter.acquire().await;

        let mut request = self
            .client()
            .request(method, format!("{}{}{}", self.base_url, API_PREFIX, path))
            .query(query)
            .header("X-API-KEY", &self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            Ok(text)
        } else {
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|e| e.msg)
                .unwrap_or(text);
            Err(ExchangeError::from_status(status.as_u16(), &message))
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> ExchangeResult<T> {
        let text = self
            .retry
            .run(operation, move || {
                let method = method.clone();
                async move { self.send_once(method, path, query, body).await }
            })
            .await?;

        Ok(serde_json::from_str(&text)?)
    }

    async fn fetch_order_by_client_id(
        &self,
        symbol: &str,
        client_id: &str,
    ) -> ExchangeResult<OrderAck> {
        let query = [
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_id.to_string()),
        ];
        let response: OrderResponse = self
            .request("fetch_order", Method::GET, "/order", &query, None)
            .await?;
        response.into_ack()
    }
}

fn build_client(call_timeout: Duration) -> ExchangeResult<Client> {
    Client::builder()
        .timeout(call_timeout)
        .build()
        .map_err(|e| ExchangeError::Protocol(format!("failed to build HTTP client: {}", e)))
}

fn parse_num(field: &str, value: &str) -> ExchangeResult<f64> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::Protocol(format!("bad {} value: {:?}", field, value)))
}

fn parse_side(value: &str) -> ExchangeResult<Side> {
    match value.to_ascii_uppercase().as_str() {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(ExchangeError::Protocol(format!("unknown side {}", other))),
    }
}

fn parse_kind(value: &str) -> ExchangeResult<OrderKind> {
    match value.to_ascii_uppercase().as_str() {
        "MARKET" => Ok(OrderKind::Market),
        "LIMIT" | "TAKE_PROFIT_LIMIT" => Ok(OrderKind::Limit),
        "STOP" | "STOP_MARKET" | "STOP_LOSS" | "OCO" => Ok(OrderKind::Stop),
        other => Err(ExchangeError::Protocol(format!("unknown order type {}", other))),
    }
}

fn parse_status(value: &str) -> ExchangeResult<ExchangeOrderStatus> {
    match value.to_ascii_uppercase().as_str() {
        "NEW" => Ok(ExchangeOrderStatus::New),
        "PARTIALLY_FILLED" => Ok(ExchangeOrderStatus::PartiallyFilled),
        "FILLED" => Ok(ExchangeOrderStatus::Filled),
        "CANCELED" | "CANCELLED" | "EXPIRED" => Ok(ExchangeOrderStatus::Cancelled),
        "REJECTED" => Ok(ExchangeOrderStatus::Rejected),
        other => Err(ExchangeError::Protocol(format!("unknown order status {}", other))),
    }
}

fn millis_to_utc(ms: i64) -> ExchangeResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ExchangeError::Protocol(format!("bad timestamp {}", ms)))
}

impl KlineRow {
    fn into_candle(self) -> ExchangeResult<Candle> {
        Ok(Candle {
            timestamp: millis_to_utc(self.0)?,
            open: parse_num("open", &self.1)?,
            high: parse_num("high", &self.2)?,
            low: parse_num("low", &self.3)?,
            close: parse_num("close", &self.4)?,
            volume: parse_num("volume", &self.5)?,
        })
    }
}

impl OrderResponse {
    fn into_ack(self) -> ExchangeResult<OrderAck> {
        let avg_fill_price = match self.avg_price.as_deref() {
            Some(p) => Some(parse_num("avgPrice", p)?).filter(|p| *p > 0.0),
            None => None,
        };
        let stop_price = match self.stop_price.as_deref() {
            Some(p) => Some(parse_num("stopPrice", p)?).filter(|p| *p > 0.0),
            None => None,
        };
        let updated_at = match self.update_time {
            Some(ms) => millis_to_utc(ms)?,
            None => Utc::now(),
        };

        Ok(OrderAck {
            side: parse_side(&self.side)?,
            kind: parse_kind(&self.kind)?,
            status: parse_status(&self.status)?,
            size: parse_num("origQty", &self.orig_qty)?,
            filled_size: parse_num("executedQty", &self.executed_qty)?,
            id: self.order_id,
            client_id: self.client_order_id,
            symbol: self.symbol,
            avg_fill_price,
            stop_price,
            updated_at,
        })
    }
}

#[async_trait]
impl ExchangeConnector for HttpExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_conditional_orders(&self) -> bool {
        true
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<MarketSnapshot> {
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", timeframe.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<KlineRow> = self
            .request("fetch_ohlcv", Method::GET, "/klines", &query, None)
            .await?;

        let mut bars = rows
            .into_iter()
            .map(KlineRow::into_candle)
            .collect::<ExchangeResult<Vec<_>>>()?;
        bars.sort_by_key(|c| c.timestamp);

        Ok(MarketSnapshot::new(symbol, timeframe, bars))
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let body = serde_json::to_value(NewOrderBody {
            symbol: &request.symbol,
            side: request.side.as_str(),
            kind: request.kind.as_str(),
            quantity: request.size.to_string(),
            price: request.price.map(|p| p.to_string()),
            stop_price: request.stop_price.map(|p| p.to_string()),
            take_profit_price: request.take_profit_price.map(|p| p.to_string()),
            client_order_id: &request.client_id,
        })?;

        let result: ExchangeResult<OrderResponse> = self
            .request("create_order", Method::POST, "/order", &[], Some(&body))
            .await;

        match result {
            Ok(response) => response.into_ack(),
            // An earlier attempt reached the exchange; recover its ack
            Err(ExchangeError::Rejected(msg)) if msg.to_ascii_lowercase().contains("duplicate") => {
                tracing::info!(
                    client_id = %request.client_id,
                    "Duplicate client order id, fetching original order"
                );
                self.fetch_order_by_client_id(&request.symbol, &request.client_id)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_order(&self, symbol: &str, id: &str) -> ExchangeResult<()> {
        let query = [("symbol", symbol.to_string()), ("orderId", id.to_string())];
        let _: serde_json::Value = self
            .request("cancel_order", Method::DELETE, "/order", &query, None)
            .await?;
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderAck>> {
        let query = [("symbol", symbol.to_string())];
        let responses: Vec<OrderResponse> = self
            .request("fetch_open_orders", Method::GET, "/openOrders", &query, None)
            .await?;
        responses.into_iter().map(OrderResponse::into_ack).collect()
    }

    async fn fetch_order(&self, symbol: &str, id: &str) -> ExchangeResult<OrderAck> {
        let query = [("symbol", symbol.to_string()), ("orderId", id.to_string())];
        let response: OrderResponse = self
            .request("fetch_order", Method::GET, "/order", &query, None)
            .await?;
        response.into_ack()
    }

    async fn fetch_balance(&self) -> ExchangeResult<Balance> {
        let query = [("asset", self.quote_currency.clone())];
        let response: BalanceResponse = self
            .request("fetch_balance", Method::GET, "/balance", &query, None)
            .await?;

        Ok(Balance {
            total: parse_num("total", &response.total)?,
            free: parse_num("free", &response.free)?,
            currency: response.asset,
        })
    }

    async fn ping(&self) -> ExchangeResult<()> {
        // Single attempt: the health controller owns the backoff
        self.send_once(Method::GET, "/ping", &[], None).await?;
        Ok(())
    }

    async fn reconnect(&self) -> ExchangeResult<()> {
        let fresh = build_client(self.call_timeout)?;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        tracing::info!(exchange = %self.name, "HTTP client rebuilt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn settings(url: &str) -> ExchangeSettings {
        ExchangeSettings {
            sandbox_mode: true,
            sandbox_url: url.to_string(),
            api_key: "test-key".to_string(),
            max_retries: 2,
            retry_base_ms: 1,
            requests_per_second: 100,
            ..ExchangeSettings::default()
        }
    }

    const ORDER_JSON: &str = r#"{
        "orderId": "12345",
        "clientOrderId": "tl-abc",
        "symbol": "BTCUSDT",
        "side": "BUY",
        "type": "MARKET",
        "status": "FILLED",
        "origQty": "2",
        "executedQty": "2",
        "avgPrice": "1000.5",
        "updateTime": 1700000000000
    }"#;

    #[tokio::test]
    async fn test_fetch_ohlcv_parses_klines() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "5m".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .match_header("X-API-KEY", "test-key")
            .with_status(200)
            .with_body(
                r#"[[1700000300000,"101","103","100","102","10"],
                    [1700000000000,"100","102","99","101","12"]]"#,
            )
            .create_async()
            .await;

        let exchange = HttpExchange::new(&settings(&server.url()), "USDT").unwrap();
        let snapshot = exchange
            .fetch_ohlcv("BTCUSDT", Timeframe::M5, 2)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(snapshot.bars.len(), 2);
        // Sorted oldest first
        assert_eq!(snapshot.bars[0].close, 101.0);
        assert_eq!(snapshot.last_price(), Some(102.0));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_surface_transient() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/balance")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body(r#"{"msg":"maintenance"}"#)
            .expect(3)
            .create_async()
            .await;

        let exchange = HttpExchange::new(&settings(&server.url()), "USDT").unwrap();
        let err = exchange.fetch_balance().await.unwrap_err();

        mock.assert_async().await;
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal_and_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/balance")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"msg":"invalid api key"}"#)
            .expect(1)
            .create_async()
            .await;

        let exchange = HttpExchange::new(&settings(&server.url()), "USDT").unwrap();
        let err = exchange.fetch_balance().await.unwrap_err();

        mock.assert_async().await;
        assert!(err.is_fatal());
        assert_eq!(err, ExchangeError::Auth("HTTP 401: invalid api key".into()));
    }

    #[tokio::test]
    async fn test_create_order_forwards_client_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/order")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "symbol": "BTCUSDT",
                "side": "BUY",
                "type": "MARKET",
                "clientOrderId": "tl-abc"
            })))
            .with_status(200)
            .with_body(ORDER_JSON)
            .create_async()
            .await;

        let exchange = HttpExchange::new(&settings(&server.url()), "USDT").unwrap();
        let ack = exchange
            .create_order(&OrderRequest::market("tl-abc".into(), "BTCUSDT", Side::Buy, 2.0))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(ack.id, "12345");
        assert_eq!(ack.status, ExchangeOrderStatus::Filled);
        assert_eq!(ack.avg_fill_price, Some(1000.5));
    }

    #[tokio::test]
    async fn test_duplicate_client_id_resolves_to_original_order() {
        let mut server = mockito::Server::new_async().await;
        let _create = server
            .mock("POST", "/api/v1/order")
            .with_status(400)
            .with_body(r#"{"msg":"Duplicate clientOrderId"}"#)
            .create_async()
            .await;
        let lookup = server
            .mock("GET", "/api/v1/order")
            .match_query(Matcher::UrlEncoded(
                "origClientOrderId".into(),
                "tl-abc".into(),
            ))
            .with_status(200)
            .with_body(ORDER_JSON)
            .create_async()
            .await;

        let exchange = HttpExchange::new(&settings(&server.url()), "USDT").unwrap();
        let ack = exchange
            .create_order(&OrderRequest::market("tl-abc".into(), "BTCUSDT", Side::Buy, 2.0))
            .await
            .unwrap();

        lookup.assert_async().await;
        assert_eq!(ack.client_id, "tl-abc");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/balance")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"asset":"USDT","total":"lots","free":"1"}"#)
            .create_async()
            .await;

        let exchange = HttpExchange::new(&settings(&server.url()), "USDT").unwrap();
        let err = exchange.fetch_balance().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Protocol(_)));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(parse_status("CANCELED").unwrap(), ExchangeOrderStatus::Cancelled);
        assert_eq!(
            parse_status("partially_filled").unwrap(),
            ExchangeOrderStatus::PartiallyFilled
        );
        assert!(parse_status("WEIRD").is_err());
    }
}
