use crate::broker::{Broker, OrderView};
use crate::config::{BotConfig, WorkingType};
use crate::error::{BotError, Result};
use crate::models::{Candle, Side};
use crate::retry::retry_broker_operation;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_WINDOW_MS: u64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

/// Binance USDT-M futures REST client. Credentials are optional; without
/// them only the unsigned market-data endpoints are usable, which is what
/// paper mode relies on.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_secret: Option<String>,
    working_type: WorkingType,
    price_tick: f64,
}

impl BinanceClient {
    pub fn new(config: &BotConfig) -> Result<Self> {
        Self::build(config, Some((&config.api_key, &config.api_secret)))
    }

    /// Market-data-only client; signed calls return `BrokerPermanent`.
    pub fn public(config: &BotConfig) -> Result<Self> {
        Self::build(config, None)
    }

    fn build(config: &BotConfig, credentials: Option<(&str, &str)>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let api_secret = match credentials {
            Some((key, secret)) => {
                headers.insert(
                    "X-MBX-APIKEY",
                    HeaderValue::from_str(key)
                        .map_err(|_| BotError::Config("invalid API key".to_string()))?,
                );
                Some(secret.to_string())
            }
            None => None,
        };

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|err| BotError::Config(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            http,
            base_url: config.fapi_url.trim_end_matches('/').to_string(),
            api_secret,
            working_type: config.working_type,
            price_tick: config.price_tick,
        })
    }

    fn sign(&self, query: &str) -> Result<String> {
        let secret = self.api_secret.as_deref().ok_or_else(|| {
            BotError::BrokerPermanent("signed endpoint called without credentials".to_string())
        })?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BotError::Config("API secret unusable as HMAC key".to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if signed {
            let timestamp = Utc::now().timestamp_millis();
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!("recvWindow={}&timestamp={}", RECV_WINDOW_MS, timestamp));
            let signature = self.sign(&query)?;
            query.push_str(&format!("&signature={}", signature));
        }

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        debug!("{} {}", method, path);

        let response = self
            .http
            .request(method, url)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, path, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| BotError::TransientBroker(format!("malformed response from {path}: {err}")))
    }
}

/// Timeouts and connection problems are retryable; anything else from the
/// transport is treated the same way since no venue verdict was received.
fn classify_request_error(err: reqwest::Error) -> BotError {
    BotError::TransientBroker(format!("request failed: {err}"))
}

fn classify_status(status: StatusCode, path: &str, body: &str) -> BotError {
    let detail = venue_error_message(body).unwrap_or_else(|| body.chars().take(200).collect());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
        || status.is_server_error()
    {
        BotError::TransientBroker(format!("{} returned {}: {}", path, status, detail))
    } else {
        BotError::BrokerPermanent(format!("{} returned {}: {}", path, status, detail))
    }
}

fn venue_error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct VenueError {
        code: i64,
        msg: String,
    }
    serde_json::from_str::<VenueError>(body)
        .ok()
        .map(|err| format!("code {}: {}", err.code, err.msg))
}

#[async_trait]
impl Broker for BinanceClient {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        retry_broker_operation!(format!("set leverage for {symbol}"), async {
            let params = [
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ];
            self.request::<serde_json::Value>(Method::POST, "/fapi/v1/leverage", &params, true)
                .await
                .map(|_| ())
        })
    }

    async fn fetch_balance(&self) -> Result<f64> {
        retry_broker_operation!("fetch balance", async {
            let entries: Vec<BalanceEntry> = self
                .request(Method::GET, "/fapi/v2/balance", &[], true)
                .await?;
            Ok::<_, BotError>(entries
                .iter()
                .find(|entry| entry.asset == "USDT")
                .and_then(|entry| entry.available_balance)
                .unwrap_or(0.0))
        })
    }

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64> {
        retry_broker_operation!(format!("fetch last price for {symbol}"), async {
            let params = [("symbol", symbol.to_string())];
            let ticker: TickerPrice = self
                .request(Method::GET, "/fapi/v1/ticker/price", &params, false)
                .await?;
            ticker.price.ok_or_else(|| {
                BotError::TransientBroker(format!("ticker for {symbol} had no price"))
            })
        })
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        retry_broker_operation!(format!("fetch candles for {symbol}"), async {
            let params = [
                ("symbol", symbol.to_string()),
                ("interval", timeframe.to_string()),
                ("limit", limit.to_string()),
            ];
            let rows: Vec<Vec<serde_json::Value>> = self
                .request(Method::GET, "/fapi/v1/klines", &params, false)
                .await?;
            rows.iter().map(parse_kline_row).collect()
        })
    }

    async fn place_market(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderView> {
        // Never retried: a timeout here may have filled, and a second market
        // order would double the position. Ambiguity surfaces to the caller.
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.entry_order_side().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format_quantity(quantity)),
        ];
        let order: OrderResponse = self
            .request(Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        Ok(order.into_view())
    }

    async fn place_stop_market(
        &self,
        symbol: &str,
        close_side: &str,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<String> {
        self.place_protective(symbol, close_side, quantity, trigger_price, "STOP_MARKET")
            .await
    }

    async fn place_take_profit_market(
        &self,
        symbol: &str,
        close_side: &str,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<String> {
        self.place_protective(
            symbol,
            close_side,
            quantity,
            trigger_price,
            "TAKE_PROFIT_MARKET",
        )
        .await
    }

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Result<Option<OrderView>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        match self
            .request::<OrderResponse>(Method::GET, "/fapi/v1/order", &params, true)
            .await
        {
            Ok(order) => Ok(Some(order.into_view())),
            Err(err) if err.is_transient() => {
                warn!("Order {} lookup failed transiently: {}", order_id, err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn position_size(&self, symbol: &str) -> Result<f64> {
        retry_broker_operation!(format!("fetch position for {symbol}"), async {
            let params = [("symbol", symbol.to_string())];
            let positions: Vec<PositionRisk> = self
                .request(Method::GET, "/fapi/v2/positionRisk", &params, true)
                .await?;
            // Keep the sign: negative positionAmt is a short.
            Ok::<_, BotError>(positions
                .iter()
                .filter(|p| p.symbol.as_deref() == Some(symbol))
                .filter_map(|p| p.position_amt)
                .fold(0.0, |acc: f64, amt| {
                    if amt.abs() > acc.abs() {
                        amt
                    } else {
                        acc
                    }
                }))
        })
    }

    async fn cancel_reduce_only_orders(&self, symbol: &str) -> Result<()> {
        let open = self.open_reduce_only_orders(symbol).await?;
        for order in open {
            let Some(order_id) = order.order_id else {
                continue;
            };
            let params = [
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ];
            if let Err(err) = self
                .request::<serde_json::Value>(Method::DELETE, "/fapi/v1/order", &params, true)
                .await
            {
                // Best-effort: the order may already be gone.
                warn!("Failed to cancel reduce-only order on {}: {}", symbol, err);
            }
        }
        Ok(())
    }

    async fn no_open_reduce_only_orders(&self, symbol: &str) -> Result<bool> {
        Ok(self.open_reduce_only_orders(symbol).await?.is_empty())
    }
}

impl BinanceClient {
    async fn place_protective(
        &self,
        symbol: &str,
        close_side: &str,
        quantity: f64,
        trigger_price: f64,
        order_type: &str,
    ) -> Result<String> {
        retry_broker_operation!(format!("place {order_type} on {symbol}"), async {
            let params = [
                ("symbol", symbol.to_string()),
                ("side", close_side.to_string()),
                ("type", order_type.to_string()),
                ("quantity", format_quantity(quantity)),
                ("stopPrice", format_price(trigger_price, self.price_tick)),
                ("reduceOnly", "true".to_string()),
                ("positionSide", "BOTH".to_string()),
                ("workingType", self.working_type.as_str().to_string()),
            ];
            let order: OrderResponse = self
                .request(Method::POST, "/fapi/v1/order", &params, true)
                .await?;
            order.order_id.map(|id| id.to_string()).ok_or_else(|| {
                BotError::BrokerPermanent(format!("{order_type} response carried no order id"))
            })
        })
    }

    async fn open_reduce_only_orders(&self, symbol: &str) -> Result<Vec<OrderResponse>> {
        retry_broker_operation!(format!("list open orders for {symbol}"), async {
            let params = [("symbol", symbol.to_string())];
            let orders: Vec<OrderResponse> = self
                .request(Method::GET, "/fapi/v1/openOrders", &params, true)
                .await?;
            Ok::<_, BotError>(orders
                .into_iter()
                .filter(|order| order.reduce_only.unwrap_or(false))
                .collect())
        })
    }
}

fn format_quantity(quantity: f64) -> String {
    // Trailing zeros are accepted by the venue; precision filters are not
    // applied here because LOT_SIZE is operator-chosen per symbol.
    format!("{:.8}", quantity)
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Snaps a trigger price to the symbol's tick before formatting; the venue
/// rejects prices finer than the tick with "Precision is over the maximum".
fn format_price(price: f64, tick: f64) -> String {
    let snapped = if tick > 0.0 {
        (price / tick).round() * tick
    } else {
        price
    };
    format!("{:.8}", snapped)
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

fn parse_kline_row(row: &Vec<serde_json::Value>) -> Result<Candle> {
    if row.len() < 6 {
        return Err(BotError::TransientBroker(format!(
            "kline row had {} fields, expected at least 6",
            row.len()
        )));
    }
    let open_time_ms = row[0].as_i64().ok_or_else(|| {
        BotError::TransientBroker("kline open time was not an integer".to_string())
    })?;
    let open_time = parse_millis(open_time_ms)?;
    Ok(Candle {
        open_time,
        open: value_as_f64(&row[1], "open")?,
        high: value_as_f64(&row[2], "high")?,
        low: value_as_f64(&row[3], "low")?,
        close: value_as_f64(&row[4], "close")?,
        volume: value_as_f64(&row[5], "volume")?,
    })
}

fn parse_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| BotError::TransientBroker(format!("timestamp {} out of range", ms)))
}

fn value_as_f64(value: &serde_json::Value, field: &str) -> Result<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        BotError::TransientBroker(format!("kline field {} was not numeric: {}", field, value))
    })
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    #[serde(default)]
    asset: String,
    #[serde(
        default,
        rename = "availableBalance",
        deserialize_with = "deserialize_f64_opt"
    )]
    available_balance: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PositionRisk {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(
        default,
        rename = "positionAmt",
        deserialize_with = "deserialize_f64_opt"
    )]
    position_amt: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default, rename = "orderId")]
    order_id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price: Option<f64>,
    #[serde(default, rename = "avgPrice", deserialize_with = "deserialize_f64_opt")]
    avg_price: Option<f64>,
    #[serde(default, rename = "reduceOnly")]
    reduce_only: Option<bool>,
}

impl OrderResponse {
    fn into_view(self) -> OrderView {
        OrderView {
            order_id: self.order_id.map(|id| id.to_string()).unwrap_or_default(),
            status: self.status,
            average_price: self.avg_price,
            price: self.price,
        }
    }
}

/// Venue numerics arrive as quoted strings; accept either representation.
fn deserialize_f64_opt<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct F64OptVisitor;

    impl<'de> Visitor<'de> for F64OptVisitor {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or string")
        }

        fn visit_none<E>(self) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_f64<E>(self, value: f64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }

        fn visit_string<E>(self, value: String) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }
    }

    deserializer.deserialize_any(F64OptVisitor)
}
