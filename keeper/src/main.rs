use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use engine::{Exchange, Scheduler};
use keeper::config;
use keeper::expiry::ExpiryBot;
use keeper::funding_rate_updater::FundingRateUpdaterBot;
use keeper::metrics::{run_metrics_loop, RuntimeSpec};
use keeper::slicer::SlicerBot;
use keeper::store_sink::JsonlSink;
use keeper::types::Bot;
use log::info;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every keeper duty
    Run {},

    /// Funding settlement only
    Funding {},

    /// TWAP/VWAP slicing only
    Slicer {},

    /// DAY-session expiry only
    Expiry {},
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenv().ok();
    env_logger::init();

    let config = config::load().expect("valid keeper config");
    let sink = Arc::new(JsonlSink::open(&config.bots.data_dir).expect("writable data dir"));
    let exchange = Arc::new(Exchange::new(config.engine.clone(), sink));
    for pair in &config.pairs {
        exchange
            .register_pair(pair.clone())
            .expect("valid pair config");
    }
    info!("registered {} pair(s)", config.pairs.len());
    let scheduler = Arc::new(Scheduler::new(exchange.clone()));

    let mut handles = Vec::new();
    let run_all = matches!(cli.command, Commands::Run {});

    if run_all || matches!(cli.command, Commands::Funding {}) {
        let bot = Arc::new(FundingRateUpdaterBot::new(
            scheduler.clone(),
            config.bots.funding_poll_ms,
            config.bots.dry_run,
        ));
        info!("starting {}", bot.name());
        handles.push(tokio::spawn(bot.start_interval_loop()));
    }
    if run_all || matches!(cli.command, Commands::Slicer {}) {
        let bot = Arc::new(SlicerBot::new(
            scheduler.clone(),
            config.bots.slice_poll_ms,
            config.bots.dry_run,
        ));
        info!("starting {}", bot.name());
        handles.push(tokio::spawn(bot.start_interval_loop()));
    }
    if run_all || matches!(cli.command, Commands::Expiry {}) {
        let bot = Arc::new(ExpiryBot::new(
            scheduler.clone(),
            config.bots.session_end_utc_ms,
        ));
        info!("starting {}", bot.name());
        handles.push(tokio::spawn(bot.start_interval_loop()));
    }
    handles.push(tokio::spawn(run_metrics_loop(
        exchange.clone(),
        RuntimeSpec::from_env(),
        config.bots.metrics_interval_ms,
    )));

    tokio::signal::ctrl_c().await.expect("signal handler");
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
}
