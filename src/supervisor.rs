use crate::broker::Broker;
use crate::clock::Clock;
use crate::config::BotConfig;
use crate::controller::TradeController;
use crate::error::Result;
use crate::ledger::CsvLedger;
use anyhow::Context;
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const RESTART_DELAY: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the controller forever, restarting it after recoverable crashes.
/// A restart only happens when the venue confirms there is no position and
/// no open reduce-only order; anything else requires a human and exits.
pub async fn run(
    broker: &dyn Broker,
    clock: &dyn Clock,
    config: &BotConfig,
) -> anyhow::Result<()> {
    let balance = broker
        .fetch_balance()
        .await
        .context("initial balance fetch")?;
    broker
        .set_leverage(&config.symbol, config.leverage)
        .await
        .context("initial leverage setup")?;
    info!("Connected. Balance: {:.6} USDT", balance);
    info!(
        "Trading {} {} x{} | EMA {}/{} | TP {} / SL {} points",
        config.symbol,
        config.timeframe,
        config.leverage,
        config.ema_fast,
        config.ema_slow,
        config.tp_points,
        config.sl_points
    );

    let keepalive = config.keepalive_url.clone().map(spawn_keepalive);
    let ledger = CsvLedger::new(&config.log_csv);

    let result = supervise(broker, clock, config, &ledger).await;
    if let Some(task) = keepalive {
        task.abort();
    }
    result
}

async fn supervise(
    broker: &dyn Broker,
    clock: &dyn Clock,
    config: &BotConfig,
    ledger: &CsvLedger,
) -> anyhow::Result<()> {
    let mut shutdown = std::pin::pin!(shutdown_signal());
    loop {
        let mut controller = TradeController::new(broker, clock, ledger, config);
        let err = match drive(&mut controller, clock, shutdown.as_mut()).await {
            Ok(()) => {
                info!(
                    "Shutting down cleanly (last state: {})",
                    controller.describe_last_state()
                );
                return Ok(());
            }
            Err(err) => err,
        };
        error!(
            "Controller stopped: {} (last state: {})",
            err,
            controller.describe_last_state()
        );

        if !(err.is_transient() || err.is_restartable()) {
            return Err(err.into());
        }
        match venue_is_flat(broker, &config.symbol).await {
            Ok(true) => {}
            Ok(false) => {
                error!("Not restarting: venue still reports exposure, reconcile manually");
                return Err(err.into());
            }
            Err(check_err) => {
                error!("Not restarting: could not verify venue is flat: {}", check_err);
                return Err(err.into());
            }
        }
        warn!("Restarting in {}s", RESTART_DELAY.as_secs());
        clock.sleep(RESTART_DELAY).await;
    }
}

/// Ticks the controller until the shutdown future resolves. Shutdown is only
/// observed between ticks, so a tick in flight always completes; a position
/// opened during that tick is already protected (or emergency-closed) before
/// the loop exits.
pub async fn drive<F>(
    controller: &mut TradeController<'_>,
    clock: &dyn Clock,
    mut shutdown: Pin<&mut F>,
) -> Result<()>
where
    F: Future<Output = ()> + ?Sized,
{
    loop {
        let delay = controller.tick().await?;
        tokio::select! {
            biased;
            _ = shutdown.as_mut() => return Ok(()),
            _ = clock.sleep(delay) => {}
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => {
            error!("Failed to listen for the shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    }
}

async fn venue_is_flat(broker: &dyn Broker, symbol: &str) -> Result<bool> {
    let quantity = broker.position_size(symbol).await?;
    if quantity != 0.0 {
        return Ok(false);
    }
    broker.no_open_reduce_only_orders(symbol).await
}

/// Outbound liveness ping, fire and forget. Hosting watchdogs use it to
/// detect a wedged process.
fn spawn_keepalive(url: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            interval.tick().await;
            match client.get(&url).send().await {
                Ok(response) => debug!("Keepalive ping: {}", response.status()),
                Err(err) => debug!("Keepalive ping failed: {}", err),
            }
        }
    })
}
