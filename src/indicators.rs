use crate::models::Candle;

/// Range floor used when a candle has high == low.
const RANGE_EPSILON: f64 = 1e-9;

/// Exponential moving average with smoothing 2/(period+1), seeded with the
/// first sample (unadjusted exponentially weighted mean).
pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_values = Vec::with_capacity(prices.len());
    ema_values.push(prices[0]);

    for i in 1..prices.len() {
        let ema = (prices[i] * multiplier) + (ema_values[i - 1] * (1.0 - multiplier));
        ema_values.push(ema);
    }

    ema_values
}

/// Absolute slope of the series over the trailing `window` samples, expressed
/// in degrees: |atan((last - last-window) / window)|. The run is measured in
/// candles, the rise in price units. Returns None until enough samples exist.
pub fn ema_slope_degrees(series: &[f64], window: usize) -> Option<f64> {
    if window == 0 || series.len() < window + 1 {
        return None;
    }
    let last = series[series.len() - 1];
    let reference = series[series.len() - 1 - window];
    let slope = (last - reference) / window as f64;
    Some(slope.atan().to_degrees().abs())
}

/// Directional-conviction test for a bullish candle: dominant body, hammer
/// structure, or a close in the top quarter of the range.
pub fn is_strong_bullish(candle: &Candle) -> bool {
    let body = candle.close - candle.open;
    if body <= 0.0 {
        return false;
    }
    let range = (candle.high - candle.low).max(RANGE_EPSILON);
    let upper_wick = candle.high - candle.open.max(candle.close);
    let lower_wick = candle.open.min(candle.close) - candle.low;

    body / range >= 0.55
        || (lower_wick >= 2.0 * body.abs() && upper_wick <= 0.5 * body.abs())
        || (candle.close - candle.low) / range >= 0.75
}

/// Mirror of [`is_strong_bullish`] for bearish candles: dominant body,
/// inverted-hammer structure, or a close in the bottom quarter of the range.
pub fn is_strong_bearish(candle: &Candle) -> bool {
    let body = candle.close - candle.open;
    if body >= 0.0 {
        return false;
    }
    let range = (candle.high - candle.low).max(RANGE_EPSILON);
    let upper_wick = candle.high - candle.open;
    let lower_wick = candle.close - candle.low;

    body.abs() / range >= 0.55
        || (upper_wick >= 2.0 * body.abs() && lower_wick <= 0.5 * body.abs())
        || (candle.high - candle.close) / range >= 0.75
}
