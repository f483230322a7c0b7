use crate::error::Result;
use crate::models::{Candle, Side};
use async_trait::async_trait;

/// Normalized view of a venue order, enough to arbitrate an exit.
#[derive(Debug, Clone, Default)]
pub struct OrderView {
    pub order_id: String,
    pub status: Option<String>,
    pub average_price: Option<f64>,
    pub price: Option<f64>,
}

impl OrderView {
    pub fn normalized_status(&self) -> String {
        self.status
            .as_deref()
            .unwrap_or("unknown")
            .trim()
            .to_lowercase()
    }

    /// The venue reports the order as executed.
    pub fn is_filled(&self) -> bool {
        matches!(self.normalized_status().as_str(), "filled" | "closed")
    }

    /// Best available fill price: average, else the order price.
    pub fn fill_price(&self) -> Option<f64> {
        self.average_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .or(self.price.filter(|p| p.is_finite() && *p > 0.0))
    }
}

/// Capability contract against the derivatives venue. No strategy logic.
///
/// Implementations classify failures: transient network/rate-limit problems
/// are retried internally with bounded backoff and only surface as
/// `TransientBroker` once the cap is exhausted; venue rejections surface as
/// `BrokerPermanent` immediately.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent; called at startup and before each entry.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Available quote currency in the derivatives wallet.
    async fn fetch_balance(&self) -> Result<f64>;

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64>;

    /// Recent candles, most-recent-last; the final element is the forming bar.
    async fn fetch_candles(&self, symbol: &str, timeframe: &str, limit: usize)
        -> Result<Vec<Candle>>;

    /// Market order opening a position; returns the venue's view of it.
    async fn place_market(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderView>;

    /// Reduce-only STOP_MARKET order closing `close_side` of the position.
    async fn place_stop_market(
        &self,
        symbol: &str,
        close_side: &str,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<String>;

    /// Reduce-only TAKE_PROFIT_MARKET order.
    async fn place_take_profit_market(
        &self,
        symbol: &str,
        close_side: &str,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<String>;

    /// None on transient fetch problems; the caller treats the order as
    /// not-yet-known rather than failing the tick.
    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Result<Option<OrderView>>;

    /// Signed open contract quantity: positive long, negative short, 0.0
    /// flat.
    async fn position_size(&self, symbol: &str) -> Result<f64>;

    /// Cancels every open reduce-only order for the symbol, best-effort.
    async fn cancel_reduce_only_orders(&self, symbol: &str) -> Result<()>;

    /// True when no reduce-only order remains open for the symbol.
    async fn no_open_reduce_only_orders(&self, symbol: &str) -> Result<bool>;
}
