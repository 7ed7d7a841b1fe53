use anyhow::Context;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tradewind::broker::PaperBroker;
use tradewind::config::AppConfig;
use tradewind::execution::{ExecutionEngine, StateStore};
use tradewind::signals::{StaticMarketData, StaticSignalProvider};
use tradewind::strategy::StrategyRegistry;
use tradewind::EventBus;

#[derive(Parser)]
#[command(name = "tradewind", version, about = "Autonomous equity trading engine")]
struct Cli {
    /// Path to a config file (defaults to ./tradewind.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the execution engine loop.
    Run {
        /// Analyze mode: evaluate everything, submit nothing.
        #[arg(long)]
        analyze: bool,
        /// Strategy to trade with (overrides the config file).
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Delete the persisted engine state.
    ResetState,
    /// List registered strategies.
    Strategies,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config =
        AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone())),
        )
        .init();

    match cli.command {
        Command::Run { analyze, strategy } => {
            if analyze {
                config.engine.analyze_mode = true;
            }
            if let Some(name) = strategy {
                config.strategy.name = name;
            }
            run_engine(config).await
        }
        Command::ResetState => {
            let store = StateStore::new(config.engine.state_path.clone());
            store.reset().context("failed to reset state")?;
            println!("state reset: {}", config.engine.state_path.display());
            Ok(())
        }
        Command::Strategies => {
            let registry = StrategyRegistry::builtin();
            for name in registry.list() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

async fn run_engine(config: AppConfig) -> anyhow::Result<()> {
    let registry = StrategyRegistry::builtin();
    let strategy = match &config.strategy.params {
        Some(params) => registry.get_with_config(&config.strategy.name, params),
        None => registry.get(&config.strategy.name),
    }
    .with_context(|| format!("strategy '{}' unavailable", config.strategy.name))?;

    // Live broker adapters plug in here; the default wiring drives the
    // in-memory paper broker.
    let broker = Arc::new(PaperBroker::new(Decimal::from(config.engine.paper_cash)));
    let signal_provider = Arc::new(StaticSignalProvider::new());
    let market_data = Arc::new(StaticMarketData::default());
    let events = Arc::new(EventBus::new());

    info!(
        strategy = %config.strategy.name,
        analyze_mode = config.engine.analyze_mode,
        interval_secs = config.engine.check_interval_secs,
        "starting tradewind"
    );

    let engine = Arc::new(ExecutionEngine::new(
        config.engine_config(),
        strategy,
        broker,
        signal_provider,
        market_data,
        events,
    ));

    let looper = engine.clone();
    let handle = tokio::spawn(async move { looper.run().await });

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown requested, draining");
    engine.stop();

    handle.await.context("engine task")??;
    Ok(())
}
