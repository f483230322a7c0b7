use crate::binance::BinanceClient;
use crate::broker::{Broker, OrderView};
use crate::config::BotConfig;
use crate::error::{BotError, Result};
use crate::models::{Candle, Side};
use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::Mutex;

/// Simulated broker: real market data through the unsigned venue endpoints,
/// everything stateful held in memory. Market orders fill at the last traded
/// price; protective triggers fire when the running candle's high/low crosses
/// them. The controller cannot tell it apart from the live broker.
pub struct PaperBroker {
    feed: BinanceClient,
    timeframe: String,
    state: Mutex<PaperState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtectiveKind {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    kind: ProtectiveKind,
    trigger_price: f64,
    filled: bool,
}

struct PaperState {
    balance: f64,
    position: Option<PaperPosition>,
    orders: HashMap<String, PaperOrder>,
    next_order_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct PaperPosition {
    side: Side,
    quantity: f64,
    entry_price: f64,
}

impl PaperBroker {
    pub fn new(config: &BotConfig) -> Result<Self> {
        Ok(Self {
            feed: BinanceClient::public(config)?,
            timeframe: config.timeframe.clone(),
            state: Mutex::new(PaperState {
                balance: config.starting_balance,
                position: None,
                orders: HashMap::new(),
                next_order_id: 1,
            }),
        })
    }

    fn next_order_id(state: &mut PaperState) -> String {
        let id = format!("paper-{}", state.next_order_id);
        state.next_order_id += 1;
        id
    }

    fn place_protective(&self, kind: ProtectiveKind, trigger_price: f64) -> String {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_order_id(&mut state);
        state.orders.insert(
            id.clone(),
            PaperOrder {
                kind,
                trigger_price,
                filled: false,
            },
        );
        id
    }

    /// Fills whichever protective trigger the running candle crossed. When
    /// one candle spans both triggers the stop is assumed to have fired
    /// first; simulation resolves intrabar ambiguity pessimistically.
    async fn simulate_triggers(&self, symbol: &str) -> Result<()> {
        let has_live_position = {
            let state = self.state.lock().unwrap();
            state.position.is_some() && state.orders.values().any(|o| !o.filled)
        };
        if !has_live_position {
            return Ok(());
        }

        let candles = self.feed.fetch_candles(symbol, &self.timeframe, 1).await?;
        let Some(running) = candles.last().copied() else {
            return Ok(());
        };

        let mut state = self.state.lock().unwrap();
        let Some(position) = state.position else {
            return Ok(());
        };

        let crossed = |order: &PaperOrder| match (position.side, order.kind) {
            (Side::Long, ProtectiveKind::StopLoss) => running.low <= order.trigger_price,
            (Side::Long, ProtectiveKind::TakeProfit) => running.high >= order.trigger_price,
            (Side::Short, ProtectiveKind::StopLoss) => running.high >= order.trigger_price,
            (Side::Short, ProtectiveKind::TakeProfit) => running.low <= order.trigger_price,
        };

        let mut fired: Option<(String, ProtectiveKind, f64)> = None;
        for (id, order) in state.orders.iter() {
            if order.filled || !crossed(order) {
                continue;
            }
            let replace = match &fired {
                None => true,
                // Stop beats take-profit inside one candle.
                Some((_, kind, _)) => {
                    *kind == ProtectiveKind::TakeProfit && order.kind == ProtectiveKind::StopLoss
                }
            };
            if replace {
                fired = Some((id.clone(), order.kind, order.trigger_price));
            }
        }

        if let Some((id, kind, trigger_price)) = fired {
            if let Some(order) = state.orders.get_mut(&id) {
                order.filled = true;
            }
            let pnl = position_pnl(position, trigger_price);
            state.balance += pnl;
            state.position = None;
            info!(
                "Paper fill: {:?} at {:.6}, pnl {:.6}, balance {:.6}",
                kind, trigger_price, pnl, state.balance
            );
        }

        Ok(())
    }
}

fn position_pnl(position: PaperPosition, exit_price: f64) -> f64 {
    match position.side {
        Side::Long => (exit_price - position.entry_price) * position.quantity,
        Side::Short => (position.entry_price - exit_price) * position.quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: Side) -> PaperPosition {
        PaperPosition {
            side,
            quantity: 0.02,
            entry_price: 103.0,
        }
    }

    #[test]
    fn pnl_sign_follows_the_position_side() {
        assert_eq!(position_pnl(position(Side::Long), 105.0), 0.04);
        assert_eq!(position_pnl(position(Side::Long), 101.0), -0.04);
        // A short loses when price rises.
        assert_eq!(position_pnl(position(Side::Short), 105.0), -0.04);
        assert_eq!(position_pnl(position(Side::Short), 101.0), 0.04);
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
        Ok(())
    }

    async fn fetch_balance(&self) -> Result<f64> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64> {
        self.feed.fetch_last_price(symbol).await
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.feed.fetch_candles(symbol, timeframe, limit).await
    }

    async fn place_market(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderView> {
        let price = self.feed.fetch_last_price(symbol).await?;
        let mut state = self.state.lock().unwrap();
        let id = Self::next_order_id(&mut state);

        match state.position {
            // Opposite-side market order while holding: this is the
            // emergency close path. Realize PnL and go flat.
            Some(position) if position.side != side => {
                let pnl = position_pnl(position, price);
                state.balance += pnl;
                state.position = None;
                info!("Paper emergency close at {:.6}, pnl {:.6}", price, pnl);
            }
            Some(_) => {
                return Err(BotError::BrokerPermanent(
                    "paper broker holds a position on this side already".to_string(),
                ));
            }
            None => {
                state.position = Some(PaperPosition {
                    side,
                    quantity,
                    entry_price: price,
                });
            }
        }

        Ok(OrderView {
            order_id: id,
            status: Some("FILLED".to_string()),
            average_price: Some(price),
            price: Some(price),
        })
    }

    async fn place_stop_market(
        &self,
        _symbol: &str,
        _close_side: &str,
        _quantity: f64,
        trigger_price: f64,
    ) -> Result<String> {
        Ok(self.place_protective(ProtectiveKind::StopLoss, trigger_price))
    }

    async fn place_take_profit_market(
        &self,
        _symbol: &str,
        _close_side: &str,
        _quantity: f64,
        trigger_price: f64,
    ) -> Result<String> {
        Ok(self.place_protective(ProtectiveKind::TakeProfit, trigger_price))
    }

    async fn fetch_order(&self, _symbol: &str, order_id: &str) -> Result<Option<OrderView>> {
        let state = self.state.lock().unwrap();
        Ok(state.orders.get(order_id).map(|order| OrderView {
            order_id: order_id.to_string(),
            status: Some(if order.filled { "FILLED" } else { "NEW" }.to_string()),
            average_price: order.filled.then_some(order.trigger_price),
            price: Some(order.trigger_price),
        }))
    }

    async fn position_size(&self, symbol: &str) -> Result<f64> {
        self.simulate_triggers(symbol).await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .position
            .map(|p| match p.side {
                Side::Long => p.quantity.abs(),
                Side::Short => -p.quantity.abs(),
            })
            .unwrap_or(0.0))
    }

    async fn cancel_reduce_only_orders(&self, _symbol: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.orders.retain(|_, order| order.filled);
        Ok(())
    }

    async fn no_open_reduce_only_orders(&self, _symbol: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.orders.values().all(|order| order.filled))
    }
}
