use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Venue order side that opens a position on this side.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }

    /// Venue order side that closes a position on this side.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Side::Long => "SELL",
            Side::Short => "BUY",
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.entry_order_side()
    }
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Side::Long),
            "SELL" | "SHORT" => Ok(Side::Short),
            other => Err(anyhow!("Unknown side '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    TakeProfit,
    StopLoss,
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::TakeProfit => "TP",
            Outcome::StopLoss => "SL",
            Outcome::Unknown => "UNKNOWN",
        }
    }
}

/// Reduce-only SL/TP pair guarding a position. An order id is absent when the
/// matching order could not be confirmed at the venue.
#[derive(Debug, Clone)]
pub struct ProtectiveBracket {
    pub sl_price: f64,
    pub tp_price: f64,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
}

impl ProtectiveBracket {
    /// Price levels straddle the entry on the correct sides.
    pub fn is_valid_for(&self, side: Side, entry_price: f64) -> bool {
        match side {
            Side::Long => self.sl_price < entry_price && entry_price < self.tp_price,
            Side::Short => self.tp_price < entry_price && entry_price < self.sl_price,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub opened_at: DateTime<Utc>,
    pub bracket: ProtectiveBracket,
    /// Set when the position was adopted from venue state rather than opened
    /// by this process; its close is always recorded as UNKNOWN.
    pub adopted: bool,
}

#[derive(Debug, Clone)]
pub enum ControllerState {
    Flat,
    InPosition(Position),
    Cooldown { until: DateTime<Utc> },
}

impl ControllerState {
    pub fn label(&self) -> &'static str {
        match self {
            ControllerState::Flat => "flat",
            ControllerState::InPosition(_) => "in_position",
            ControllerState::Cooldown { .. } => "cooldown",
        }
    }
}

/// One closed trade, immutable once written to the ledger.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub outcome: Outcome,
    pub pnl_base: f64,
    pub balance_after: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_roundtrips_through_venue_strings() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Short);
        assert_eq!(Side::Long.close_order_side(), "SELL");
        assert_eq!(Side::Short.close_order_side(), "BUY");
        assert!("hold".parse::<Side>().is_err());
    }

    #[test]
    fn bracket_must_straddle_entry() {
        let long_bracket = ProtectiveBracket {
            sl_price: 99.0,
            tp_price: 103.0,
            sl_order_id: None,
            tp_order_id: None,
        };
        assert!(long_bracket.is_valid_for(Side::Long, 100.0));
        assert!(!long_bracket.is_valid_for(Side::Short, 100.0));

        let short_bracket = ProtectiveBracket {
            sl_price: 103.0,
            tp_price: 99.0,
            sl_order_id: None,
            tp_order_id: None,
        };
        assert!(short_bracket.is_valid_for(Side::Short, 100.0));
        assert!(!short_bracket.is_valid_for(Side::Long, 100.0));
    }
}
