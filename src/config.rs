use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;

/// Venue price reference for protective-order triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingType {
    MarkPrice,
    LastPrice,
}

impl WorkingType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "MARK_PRICE" => Ok(Self::MarkPrice),
            "LAST_PRICE" | "CONTRACT_PRICE" => Ok(Self::LastPrice),
            other => Err(anyhow!(
                "WORKING_TYPE must be MARK_PRICE or LAST_PRICE (value: {})",
                other
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarkPrice => "MARK_PRICE",
            Self::LastPrice => "CONTRACT_PRICE",
        }
    }
}

/// Complete runtime configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub api_key: String,
    pub api_secret: String,
    pub symbol: String,
    pub timeframe: String,
    pub lot_size: f64,
    pub leverage: u32,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub tp_points: f64,
    pub sl_points: f64,
    pub slope_window: usize,
    pub slope_deg_min: f64,
    pub cooldown_after_sl: u32,
    pub working_type: WorkingType,
    pub price_tick: f64,
    pub log_csv: String,
    pub keepalive_url: Option<String>,
    pub poll_sleep_flat: Duration,
    pub poll_sleep_hold: Duration,
    pub fapi_url: String,
    pub starting_balance: f64,
}

impl BotConfig {
    /// Reads and validates the full configuration. `require_credentials` is
    /// false in paper mode, where no signed venue calls are made.
    pub fn from_env(require_credentials: bool) -> Result<Self> {
        let api_key = optional_env("API_KEY");
        let api_secret = optional_env("API_SECRET");
        if require_credentials && (api_key.is_none() || api_secret.is_none()) {
            return Err(anyhow!(
                "API_KEY / API_SECRET must be set to trade a live account"
            ));
        }

        let ema_fast = env_usize("EMA_FAST", 13, 1)?;
        let ema_slow = env_usize("EMA_SLOW", 55, 2)?;
        if ema_fast >= ema_slow {
            return Err(anyhow!(
                "EMA_FAST ({}) must be < EMA_SLOW ({})",
                ema_fast,
                ema_slow
            ));
        }

        let timeframe = optional_env("TIMEFRAME").unwrap_or_else(|| "1m".to_string());
        timeframe_duration(&timeframe)?;

        Ok(Self {
            api_key: api_key.unwrap_or_default(),
            api_secret: api_secret.unwrap_or_default(),
            symbol: optional_env("SYMBOL").unwrap_or_else(|| "ETHUSDT".to_string()),
            timeframe,
            lot_size: env_f64("LOT_SIZE", 0.01, Some(f64::MIN_POSITIVE), None)?,
            leverage: env_u32("LEVERAGE", 100, 1)?,
            ema_fast,
            ema_slow,
            tp_points: env_f64("TP_POINTS", 30.0, Some(f64::MIN_POSITIVE), None)?,
            sl_points: env_f64("SL_POINTS", 15.0, Some(f64::MIN_POSITIVE), None)?,
            slope_window: env_usize("SLOPE_WINDOW", 5, 1)?,
            slope_deg_min: env_f64("SLOPE_DEG_MIN", 20.0, Some(0.0), Some(90.0))?,
            cooldown_after_sl: env_u32("COOLDOWN_AFTER_1_SL", 60, 0)?,
            working_type: WorkingType::parse(
                optional_env("WORKING_TYPE")
                    .as_deref()
                    .unwrap_or("MARK_PRICE"),
            )?,
            price_tick: env_f64("PRICE_TICK", 0.01, Some(f64::MIN_POSITIVE), None)?,
            log_csv: optional_env("LOG_CSV").unwrap_or_else(|| "futures_trades.csv".to_string()),
            keepalive_url: optional_env("KEEPALIVE_URL"),
            poll_sleep_flat: Duration::from_secs(env_u64("POLL_SLEEP_FLAT_SECS", 2, 1)?),
            poll_sleep_hold: Duration::from_secs(env_u64("POLL_SLEEP_HOLD_SECS", 5, 1)?),
            fapi_url: optional_env("BINANCE_FAPI_URL")
                .unwrap_or_else(|| "https://fapi.binance.com".to_string()),
            starting_balance: env_f64("STARTING_BALANCE", 1000.0, Some(0.0), None)?,
        })
    }

    /// Duration of one candle of the configured timeframe.
    pub fn candle_duration(&self) -> Duration {
        // Validated at construction.
        timeframe_duration(&self.timeframe).unwrap_or(Duration::from_secs(60))
    }
}

/// Parses a venue timeframe string ("1m", "5m", "1h", "30s", "1d") into a
/// duration.
pub fn timeframe_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    if trimmed.len() < 2 {
        return Err(anyhow!("TIMEFRAME must look like 1m / 5m / 1h (value: {})", raw));
    }
    let (number, unit) = trimmed.split_at(trimmed.len() - 1);
    let count: u64 = number
        .parse()
        .map_err(|_| anyhow!("TIMEFRAME must start with a number (value: {})", raw))?;
    if count == 0 {
        return Err(anyhow!("TIMEFRAME must be a positive interval (value: {})", raw));
    }
    let seconds = match unit {
        "s" => count,
        "m" => count * 60,
        "h" => count * 3_600,
        "d" => count * 86_400,
        other => {
            return Err(anyhow!(
                "TIMEFRAME unit must be one of s/m/h/d (value: {})",
                other
            ))
        }
    };
    Ok(Duration::from_secs(seconds))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_f64(key: &str, default: f64, min: Option<f64>, max: Option<f64>) -> Result<f64> {
    let Some(raw) = optional_env(key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn env_u32(key: &str, default: u32, min: u32) -> Result<u32> {
    let Some(raw) = optional_env(key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<u32>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

fn env_u64(key: &str, default: u64, min: u64) -> Result<u64> {
    let Some(raw) = optional_env(key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<u64>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

fn env_usize(key: &str, default: usize, min: usize) -> Result<usize> {
    let Some(raw) = optional_env(key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<usize>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}
