use clap::{Parser, Subcommand};
use trendbot::binance::BinanceClient;
use trendbot::clock::SystemClock;
use trendbot::config::BotConfig;
use trendbot::paper::PaperBroker;
use trendbot::supervisor;

#[derive(Parser)]
#[command(name = "trendbot", about = "EMA crossover futures trading bot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trade live with signed venue credentials
    Run,
    /// Simulate fills against live market data, no credentials needed
    Paper,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run => {
            let config = BotConfig::from_env(true)?;
            let broker = BinanceClient::new(&config)?;
            supervisor::run(&broker, &SystemClock, &config).await
        }
        Command::Paper => {
            let config = BotConfig::from_env(false)?;
            let broker = PaperBroker::new(&config)?;
            supervisor::run(&broker, &SystemClock, &config).await
        }
    }
}
