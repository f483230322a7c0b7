use crate::broker::Broker;
use crate::clock::Clock;
use crate::config::BotConfig;
use crate::error::{BotError, Result};
use crate::ledger::CsvLedger;
use crate::models::{
    ControllerState, Outcome, Position, ProtectiveBracket, Side, TradeRecord,
};
use crate::signal::SignalEngine;
use chrono::Duration as ChronoDuration;
use log::{error, info, warn};
use std::time::Duration;

const CANDLE_FETCH_LIMIT: usize = 200;
const SL_STREAK_COOLDOWN_THRESHOLD: u32 = 1;

/// The trading state machine. Owns the single in-memory position mirror;
/// the venue owns the authoritative position and order set, and wins every
/// disagreement. `tick()` is the only mutation point.
pub struct TradeController<'a> {
    broker: &'a dyn Broker,
    clock: &'a dyn Clock,
    ledger: &'a CsvLedger,
    config: &'a BotConfig,
    signal: SignalEngine,
    state: ControllerState,
    sl_streak: u32,
}

impl<'a> TradeController<'a> {
    pub fn new(
        broker: &'a dyn Broker,
        clock: &'a dyn Clock,
        ledger: &'a CsvLedger,
        config: &'a BotConfig,
    ) -> Self {
        Self {
            broker,
            clock,
            ledger,
            config,
            signal: SignalEngine::new(
                config.ema_fast,
                config.ema_slow,
                config.slope_window,
                config.slope_deg_min,
            ),
            state: ControllerState::Flat,
            sl_streak: 0,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn sl_streak(&self) -> u32 {
        self.sl_streak
    }

    /// One evaluation step. Returns how long the caller should sleep before
    /// the next tick.
    pub async fn tick(&mut self) -> Result<Duration> {
        match self.state.clone() {
            ControllerState::Cooldown { until } => {
                let now = self.clock.now();
                if now >= until {
                    info!("Cooldown over, resuming entries");
                    self.state = ControllerState::Flat;
                    Ok(self.config.poll_sleep_flat)
                } else {
                    info!(
                        "Cooldown active: {}s remaining",
                        (until - now).num_seconds().max(0)
                    );
                    Ok(self.config.candle_duration())
                }
            }
            ControllerState::Flat => self.tick_flat().await,
            ControllerState::InPosition(position) => self.tick_in_position(position).await,
        }
    }

    async fn tick_flat(&mut self) -> Result<Duration> {
        let venue_quantity = self.broker.position_size(&self.config.symbol).await?;
        if venue_quantity != 0.0 {
            self.adopt_venue_position(venue_quantity).await?;
            return Ok(self.config.poll_sleep_hold);
        }

        let candles = self
            .broker
            .fetch_candles(&self.config.symbol, &self.config.timeframe, CANDLE_FETCH_LIMIT)
            .await?;
        let Some(side) = self.signal.evaluate(&candles) else {
            return Ok(self.config.poll_sleep_flat);
        };

        self.broker
            .set_leverage(&self.config.symbol, self.config.leverage)
            .await?;

        let last_price = self.broker.fetch_last_price(&self.config.symbol).await?;
        let balance = self.broker.fetch_balance().await?;
        let required_margin = last_price * self.config.lot_size / self.config.leverage as f64;
        if balance < required_margin {
            let err = BotError::InsufficientBalance {
                required: required_margin,
                available: balance,
            };
            warn!("Skipping {:?} entry: {}", side, err);
            return Ok(self.config.poll_sleep_flat);
        }

        let order = self
            .broker
            .place_market(&self.config.symbol, side, self.config.lot_size)
            .await?;
        let entry_price = order.fill_price().unwrap_or(last_price);
        let opened_at = self.clock.now();
        info!("ENTRY {} @ {:.6}", side.as_str(), entry_price);

        let bracket = self
            .place_bracket(side, entry_price, self.config.lot_size)
            .await;
        match bracket {
            Ok(bracket) => {
                self.state = ControllerState::InPosition(Position {
                    side,
                    entry_price,
                    quantity: self.config.lot_size,
                    opened_at,
                    bracket,
                    adopted: false,
                });
                Ok(self.config.poll_sleep_hold)
            }
            Err(err) => {
                error!(
                    "Failed to protect {} position entered @ {:.6}: {}. Emergency closing.",
                    side.as_str(),
                    entry_price,
                    err
                );
                self.emergency_close(side, self.config.lot_size).await?;
                self.state = ControllerState::Flat;
                Ok(self.config.poll_sleep_flat)
            }
        }
    }

    /// Places the reduce-only SL/TP pair. On failure the partial bracket is
    /// cancelled so the caller can emergency-close a cleanly unprotected
    /// position.
    async fn place_bracket(
        &self,
        side: Side,
        entry_price: f64,
        quantity: f64,
    ) -> Result<ProtectiveBracket> {
        let (tp_price, sl_price) = match side {
            Side::Long => (
                entry_price + self.config.tp_points,
                entry_price - self.config.sl_points,
            ),
            Side::Short => (
                entry_price - self.config.tp_points,
                entry_price + self.config.sl_points,
            ),
        };
        let close_side = side.close_order_side();

        let sl_order_id = self
            .broker
            .place_stop_market(&self.config.symbol, close_side, quantity, sl_price)
            .await?;
        let tp_order_id = match self
            .broker
            .place_take_profit_market(&self.config.symbol, close_side, quantity, tp_price)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                if let Err(cancel_err) = self
                    .broker
                    .cancel_reduce_only_orders(&self.config.symbol)
                    .await
                {
                    warn!("Failed to cancel partial bracket: {}", cancel_err);
                }
                return Err(err);
            }
        };

        info!("Placed exits: TP @ {:.6} | SL @ {:.6}", tp_price, sl_price);
        Ok(ProtectiveBracket {
            sl_price,
            tp_price,
            sl_order_id: Some(sl_order_id),
            tp_order_id: Some(tp_order_id),
        })
    }

    /// Venue reported a position the controller did not open. Adopt it on
    /// the side the signed quantity indicates, with a synthetic bracket
    /// priced off the current last price; its eventual close is recorded as
    /// UNKNOWN.
    async fn adopt_venue_position(&mut self, signed_quantity: f64) -> Result<()> {
        let side = if signed_quantity < 0.0 {
            Side::Short
        } else {
            Side::Long
        };
        let quantity = signed_quantity.abs();
        warn!(
            "Venue reports an open {} position of {} {} the controller did not place; adopting",
            side.as_str(),
            quantity,
            self.config.symbol
        );
        let last_price = self.broker.fetch_last_price(&self.config.symbol).await?;

        let bracket = match self.place_bracket(side, last_price, quantity).await {
            Ok(bracket) => bracket,
            Err(err) => {
                error!("Could not protect adopted position: {}", err);
                self.emergency_close(side, quantity).await.map_err(|close_err| {
                    BotError::VenueDesync(format!(
                        "adopted position could not be protected ({err}) nor closed ({close_err})"
                    ))
                })?;
                return Ok(());
            }
        };

        self.state = ControllerState::InPosition(Position {
            side,
            entry_price: last_price,
            quantity,
            opened_at: self.clock.now(),
            bracket,
            adopted: true,
        });
        Ok(())
    }

    async fn tick_in_position(&mut self, position: Position) -> Result<Duration> {
        let venue_quantity = self.broker.position_size(&self.config.symbol).await?;
        if venue_quantity != 0.0 {
            return Ok(self.config.poll_sleep_hold);
        }

        let (outcome, exit_price) = self.arbitrate_exit(&position).await?;
        let pnl_base = match position.side {
            Side::Long => (exit_price - position.entry_price) * position.quantity,
            Side::Short => (position.entry_price - exit_price) * position.quantity,
        };
        info!(
            "EXIT {} @ {:.6} | PnL: {:.6}",
            outcome.as_str(),
            exit_price,
            pnl_base
        );

        // Best-effort: a failed cancel must not lose the trade record or the
        // cooldown.
        if let Err(err) = self
            .broker
            .cancel_reduce_only_orders(&self.config.symbol)
            .await
        {
            warn!("Failed to cancel the remaining protective order: {}", err);
        }

        let balance_after = match self.broker.fetch_balance().await {
            Ok(balance) => Some(balance),
            Err(err) => {
                warn!("Balance refresh after exit failed: {}", err);
                None
            }
        };

        let record = TradeRecord {
            opened_at: position.opened_at,
            closed_at: self.clock.now(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            outcome,
            pnl_base,
            balance_after,
        };
        if let Err(err) = self.ledger.append(&record) {
            // A lost ledger row must not corrupt trading state.
            error!("{}", err);
        }

        if outcome == Outcome::StopLoss {
            self.sl_streak += 1;
            if self.sl_streak >= SL_STREAK_COOLDOWN_THRESHOLD {
                let cooldown = self.config.candle_duration() * self.config.cooldown_after_sl;
                let until = self.clock.now()
                    + ChronoDuration::from_std(cooldown).unwrap_or(ChronoDuration::zero());
                info!(
                    "{} SL close(s) -> cooldown for {} candles",
                    self.sl_streak, self.config.cooldown_after_sl
                );
                self.sl_streak = 0;
                self.state = ControllerState::Cooldown { until };
                return Ok(self.config.candle_duration());
            }
        } else {
            self.sl_streak = 0;
        }

        self.state = ControllerState::Flat;
        Ok(self.config.poll_sleep_flat)
    }

    /// Determines how the position closed by asking the venue about both
    /// protective orders. A filled take-profit wins, then a filled stop;
    /// anything else (including adopted positions) is UNKNOWN at the last
    /// traded price.
    async fn arbitrate_exit(&self, position: &Position) -> Result<(Outcome, f64)> {
        let tp_order = match position.bracket.tp_order_id.as_deref() {
            Some(id) => self.broker.fetch_order(&self.config.symbol, id).await?,
            None => None,
        };
        let sl_order = match position.bracket.sl_order_id.as_deref() {
            Some(id) => self.broker.fetch_order(&self.config.symbol, id).await?,
            None => None,
        };

        let tp_filled = tp_order.as_ref().is_some_and(|order| order.is_filled());
        let sl_filled = sl_order.as_ref().is_some_and(|order| order.is_filled());
        if tp_filled && sl_filled {
            return Err(BotError::LogicInvariant(format!(
                "both protective orders report fills for {} position entered @ {:.6}",
                position.side.as_str(),
                position.entry_price
            )));
        }

        let fallback_price = self.broker.fetch_last_price(&self.config.symbol).await?;
        if position.adopted {
            return Ok((Outcome::Unknown, fallback_price));
        }

        if tp_filled {
            let price = tp_order
                .and_then(|order| order.fill_price())
                .unwrap_or(fallback_price);
            return Ok((Outcome::TakeProfit, price));
        }
        if sl_filled {
            let price = sl_order
                .and_then(|order| order.fill_price())
                .unwrap_or(fallback_price);
            return Ok((Outcome::StopLoss, price));
        }
        Ok((Outcome::Unknown, fallback_price))
    }

    /// Closes a live position with an opposite market order and clears any
    /// protective orders. Used when a position cannot be protected and on
    /// shutdown between fill and bracket placement.
    pub async fn emergency_close(&self, side: Side, quantity: f64) -> Result<()> {
        self.broker
            .place_market(&self.config.symbol, opposite(side), quantity)
            .await?;
        self.broker
            .cancel_reduce_only_orders(&self.config.symbol)
            .await?;
        warn!(
            "Emergency closed {} {} {}",
            quantity,
            self.config.symbol,
            side.as_str()
        );
        Ok(())
    }

    /// Logged on fatal errors so a human can reconcile at the venue.
    pub fn describe_last_state(&self) -> String {
        match &self.state {
            ControllerState::Flat => "flat".to_string(),
            ControllerState::Cooldown { until } => format!("cooldown until {}", until),
            ControllerState::InPosition(p) => format!(
                "{} {} @ {:.6} (SL {:.6} / TP {:.6})",
                p.side.as_str(),
                p.quantity,
                p.entry_price,
                p.bracket.sl_price,
                p.bracket.tp_price
            ),
        }
    }
}

fn opposite(side: Side) -> Side {
    match side {
        Side::Long => Side::Short,
        Side::Short => Side::Long,
    }
}
