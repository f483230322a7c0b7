use crate::indicators::{calculate_ema, ema_slope_degrees, is_strong_bearish, is_strong_bullish};
use crate::models::{Candle, Side};
use log::debug;

/// Entry-signal evaluation: EMA crossover gated by fast-EMA slope and a
/// candle-strength confirmation. Stateless; all history lives in the series
/// the caller fetched.
pub struct SignalEngine {
    ema_fast: usize,
    ema_slow: usize,
    slope_window: usize,
    slope_deg_min: f64,
}

impl SignalEngine {
    pub fn new(ema_fast: usize, ema_slow: usize, slope_window: usize, slope_deg_min: f64) -> Self {
        Self {
            ema_fast,
            ema_slow,
            slope_window,
            slope_deg_min,
        }
    }

    /// Evaluates the most recently closed candle of a series whose last
    /// element is the still-forming bar. Indicators never see the forming
    /// bar, so the decision cannot look ahead.
    pub fn evaluate(&self, candles: &[Candle]) -> Option<Side> {
        if candles.len() < 2 {
            return None;
        }
        let closed = &candles[..candles.len() - 1];
        if closed.len() < self.ema_slow.max(self.slope_window + 1).max(2) {
            return None;
        }

        let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();
        let fast = calculate_ema(&closes, self.ema_fast);
        let slow = calculate_ema(&closes, self.ema_slow);

        let i = closed.len() - 1;
        let bullish_cross = fast[i - 1] <= slow[i - 1] && fast[i] > slow[i];
        let bearish_cross = fast[i - 1] >= slow[i - 1] && fast[i] < slow[i];
        if !bullish_cross && !bearish_cross {
            return None;
        }

        let slope = ema_slope_degrees(&fast, self.slope_window)?;
        if slope < self.slope_deg_min {
            debug!(
                "Crossover rejected: slope {:.2} deg below minimum {:.2}",
                slope, self.slope_deg_min
            );
            return None;
        }

        let confirmation = &closed[i];
        let long_ok = bullish_cross && is_strong_bullish(confirmation);
        let short_ok = bearish_cross && is_strong_bearish(confirmation);
        match (long_ok, short_ok) {
            (true, false) => Some(Side::Long),
            (false, true) => Some(Side::Short),
            // Both directions qualifying on one bar is a float edge case;
            // stand aside rather than guess.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    /// Forty flat bars then a slow drift down. The fast EMA hugs the price
    /// while the slow EMA lags well above it, so a single breakout bar
    /// appended at the end produces a crossover exactly there.
    fn declining_prefix() -> Vec<f64> {
        let mut closes = vec![100.0; 40];
        for i in 0..20 {
            closes.push(100.0 - 0.05 * i as f64);
        }
        closes
    }

    fn series_from_closes(closes: &[f64], last_closed: Candle) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: base + Duration::minutes(i as i64),
                open: close,
                high: close + 0.05,
                low: close - 0.05,
                close,
                volume: 10.0,
            })
            .collect();
        let mut confirm = last_closed;
        confirm.open_time = base + Duration::minutes(closes.len() as i64);
        let forming_open = confirm.close;
        candles.push(confirm);
        // Forming bar with an extreme close that must not leak into the EMAs.
        candles.push(Candle {
            open_time: base + Duration::minutes(closes.len() as i64 + 1),
            open: forming_open,
            high: forming_open + 500.0,
            low: forming_open - 500.0,
            close: forming_open + 500.0,
            volume: 1.0,
        });
        candles
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open,
            high,
            low,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn bullish_breakout_with_slope_and_confirmation_enters_long() {
        let engine = SignalEngine::new(3, 20, 2, 5.0);
        // Strong body: 2.0 of a 2.2 range.
        let breakout = bar(101.0, 103.1, 100.9, 103.0);
        let candles = series_from_closes(&declining_prefix(), breakout);
        assert_eq!(engine.evaluate(&candles), Some(Side::Long));
    }

    #[test]
    fn bearish_breakdown_enters_short() {
        // Mirror image: drift up, then one strong down bar.
        let mut closes = vec![100.0; 40];
        for i in 0..20 {
            closes.push(100.0 + 0.05 * i as f64);
        }
        let engine = SignalEngine::new(3, 20, 2, 5.0);
        let breakdown = bar(100.0, 100.1, 97.9, 98.0);
        let candles = series_from_closes(&closes, breakdown);
        assert_eq!(engine.evaluate(&candles), Some(Side::Short));
    }

    #[test]
    fn shallow_slope_blocks_the_crossover() {
        // Same shape scaled down a thousandfold: the cross still happens but
        // the fast-EMA slope is a fraction of a degree.
        let mut closes = vec![100.0; 40];
        for i in 0..20 {
            closes.push(100.0 - 0.000_05 * i as f64);
        }
        let engine = SignalEngine::new(3, 20, 2, 20.0);
        // Strong body at millipoint scale.
        let breakout = bar(99.999, 100.003_1, 99.998_9, 100.003);
        let candles = series_from_closes(&closes, breakout);
        assert_eq!(engine.evaluate(&candles), None);
    }

    #[test]
    fn weak_confirmation_candle_blocks_entry() {
        let engine = SignalEngine::new(3, 20, 2, 5.0);
        // Crossover magnitude as in the long scenario, but body/range = 0.23
        // with the close mid-range and no wick bonus.
        let weak = bar(102.7, 103.7, 102.4, 103.0);
        let candles = series_from_closes(&declining_prefix(), weak);
        assert_eq!(engine.evaluate(&candles), None);
    }

    #[test]
    fn no_crossover_means_no_signal() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64 * 0.5).collect();
        let engine = SignalEngine::new(13, 55, 5, 5.0);
        let candles = series_from_closes(&closes, bar(139.5, 141.1, 139.4, 141.0));
        assert_eq!(engine.evaluate(&candles), None);
    }

    #[test]
    fn short_series_yields_none() {
        let engine = SignalEngine::new(13, 55, 5, 20.0);
        let candles = series_from_closes(&[100.0, 101.0], bar(101.0, 102.1, 100.9, 102.0));
        assert_eq!(engine.evaluate(&candles), None);
    }
}
