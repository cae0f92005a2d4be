//! RSI Sentinel - Main Entry Point

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rsi_sentinel::alert::{AlertSink, CommandResponder, LogSink, TelegramSink};
use rsi_sentinel::config::{Config, SinkKind};
use rsi_sentinel::exchange::{CandleHistory, MexcClient, MexcStreamConnector, SymbolSource};
use rsi_sentinel::pipeline::{evaluate_once, Monitor};
use rsi_sentinel::registry::{clean_symbol, write_symbols_file, FileSymbolSource, InstrumentRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// RSI Sentinel CLI
#[derive(Parser)]
#[command(name = "rsi-sentinel")]
#[command(version, about = "Price-shock and RSI momentum alerts for MEXC futures")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the real-time monitor (default)
    Run,

    /// Validate the configuration and print a summary
    CheckConfig,

    /// Write the active USDT contract list to a symbols file
    Symbols {
        /// Output file
        #[arg(short, long, default_value = "data/symbols_usdt.txt")]
        output: PathBuf,
    },

    /// Fetch history for one instrument and print its filter report
    Evaluate {
        /// Contract symbol, e.g. BTC_USDT
        symbol: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;
    for warning in config.warnings() {
        warn!("⚠️  {}", warning);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::CheckConfig => {
            log_config(&config);
            info!("✅ Configuration is valid");
            Ok(())
        }
        Commands::Symbols { output } => refresh_symbols_file(&config, &output).await,
        Commands::Evaluate { symbol } => evaluate(&config, &symbol).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║              RSI Sentinel v{} - MEXC futures             ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    let config = Arc::new(config);
    let client = Arc::new(MexcClient::new(&config.exchange)?);

    let source: Arc<dyn SymbolSource> = match &config.registry.symbols_file {
        Some(path) => {
            info!("📄 Reading instruments from {}", path.display());
            Arc::new(FileSymbolSource::new(path.clone()))
        }
        None => client.clone(),
    };
    let registry = InstrumentRegistry::new(
        source,
        &config.registry.whitelist,
        &config.registry.blacklist,
    );

    let sink: Arc<dyn AlertSink> = match config.alerts.sink {
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::Telegram => Arc::new(TelegramSink::new(&config.alerts)?),
    };

    let connector = Arc::new(MexcStreamConnector::new(
        config.exchange.ws_url.clone(),
        Duration::from_millis(config.feed.subscribe_delay_ms),
    ));
    let history: Arc<dyn CandleHistory> = client;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let monitor = Monitor::new(config.clone(), registry, connector, history, sink);
    if config.alerts.sink == SinkKind::Telegram && config.alerts.bot_commands {
        let responder = CommandResponder::new(&config.alerts, &config.monitor, monitor.stats())?;
        tokio::spawn(responder.run(shutdown_rx.clone()));
    }

    monitor.run(shutdown_rx).await
}

async fn refresh_symbols_file(config: &Config, output: &Path) -> Result<()> {
    let client = MexcClient::new(&config.exchange)?;
    let symbols: Vec<String> = client
        .get_usdt_contracts()
        .await
        .context("Failed to fetch contract list")?
        .iter()
        .filter_map(|raw| clean_symbol(raw))
        .collect();

    let written = write_symbols_file(output, &symbols).await?;
    info!("✅ Wrote {} symbols to {}", written, output.display());
    Ok(())
}

async fn evaluate(config: &Config, raw_symbol: &str) -> Result<()> {
    let symbol = clean_symbol(raw_symbol)
        .with_context(|| format!("Invalid symbol: {raw_symbol}"))?;
    let client = MexcClient::new(&config.exchange)?;

    let report = evaluate_once(&client, &symbol, &config.monitor, Utc::now()).await?;

    info!("🔎 {} evaluated at {}", report.symbol, report.evaluated_at);
    match &report.price_shock {
        Ok(shock) => info!(
            "   Price shock: {}% ({} -> {}) {}",
            shock.change_pct.round_dp(2),
            shock.reference,
            shock.last_price,
            if shock.passed { "✅" } else { "❌" }
        ),
        Err(reason) => info!("   Price shock: unavailable ({:?}) ❌", reason),
    }
    for (label, check) in [("RSI 1h", &report.momentum_1h), ("RSI 15m", &report.momentum_15m)] {
        match check.value {
            Some(value) => info!(
                "   {}: {} {}",
                label,
                value.round_dp(2),
                check.zone.map_or("neutral", |zone| zone.as_str())
            ),
            None => info!("   {}: not enough history", label),
        }
    }

    match report.to_event() {
        Some(event) => info!("🚨 Signal: {} {}", event.symbol, event.direction),
        None => info!("No signal"),
    }
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "rsi-sentinel.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("rsi_sentinel=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let m = &config.monitor;
    info!("📋 Configuration:");
    info!("   Check interval: {}s", m.check_interval_secs);
    info!(
        "   Price shock: {}% over {} minutes",
        m.price_change_threshold, m.price_check_period_minutes
    );
    info!(
        "   RSI period {}: overbought > {}, oversold < {}",
        m.rsi_period, m.rsi_overbought, m.rsi_oversold
    );
    info!("   Signal cooldown: {}s", m.signal_cooldown_secs);
    info!("   Evaluation shards: {}", m.evaluation_shards);
    info!(
        "   Symbols per connection: {}",
        config.feed.symbols_per_connection
    );
    info!("   Alert sink: {:?}", config.alerts.sink);
}
