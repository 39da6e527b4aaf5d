//! VPN Billing Daemon
//!
//! Wires the billing core over PostgreSQL, seeds servers and plans
//! from the config file and runs the background workers until interrupted.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vpnbill_chain::{ChainVerifier, TonCenterSource, TransferVerifier};
use vpnbill_core::workers::{self, shutdown_channel};
use vpnbill_core::{
    BillingConfig, ConfirmationWorker, ExpiryWorker, HealthWorker, Ledger, LogNotifier, Notifier,
    PaymentEngine, ReferralService, ServerRegistry, Settings, SubscriptionEngine,
    TelegramNotifier,
};
use vpnbill_panel::XuiFactory;
use vpnbill_store::{PgStore, Store};

/// VPN billing daemon
#[derive(Parser)]
#[command(name = "vpnbill")]
#[command(author, version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/vpnbill/config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the billing workers
    Start,

    /// Generate default config
    GenConfig {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the config file and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Start => cmd_start(cli.config).await,
        Commands::GenConfig { output } => cmd_gen_config(output).await,
        Commands::CheckConfig => cmd_check_config(cli.config).await,
    }
}

/// Services built at startup
struct Services {
    store: Arc<dyn Store>,
    registry: Arc<ServerRegistry>,
    subscriptions: Arc<SubscriptionEngine>,
    payments: Arc<PaymentEngine>,
    notifier: Arc<dyn Notifier>,
}

/// Build every service, leaves first
async fn build(config: &BillingConfig) -> Result<Services> {
    let pg = PgStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    pg.migrate().await.context("Failed to apply migrations")?;
    let store: Arc<dyn Store> = Arc::new(pg);
    let settings = Settings::new(store.clone());

    let notifier: Arc<dyn Notifier> = match config.telegram.bot_token.as_deref() {
        Some(token) if !token.is_empty() => Arc::new(
            TelegramNotifier::new(token).context("Failed to create Telegram notifier")?,
        ),
        _ => {
            warn!("No bot token configured, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    let source = match config.ton.api_url.as_deref() {
        Some(url) => TonCenterSource::new(
            url,
            config.ton.api_key.clone(),
            std::time::Duration::from_secs(config.ton.request_timeout_secs),
        ),
        None => TonCenterSource::for_network(
            config.ton.testnet,
            config.ton.api_key.clone(),
            std::time::Duration::from_secs(config.ton.request_timeout_secs),
        ),
    }
    .context("Failed to create TON client")?;
    let verifier: Arc<dyn TransferVerifier> = Arc::new(ChainVerifier::new(source));

    let factory = Arc::new(XuiFactory::new(config.panel.request_timeout()));
    let registry = Arc::new(ServerRegistry::new(store.clone(), factory));
    let ledger = Arc::new(Ledger::new(store.clone(), settings.clone()));
    let subscriptions = Arc::new(SubscriptionEngine::new(
        store.clone(),
        registry.clone(),
        config.panel.default_device_limit,
    ));
    let referrals = Arc::new(ReferralService::new(
        store.clone(),
        ledger.clone(),
        subscriptions.clone(),
        settings,
        notifier.clone(),
        config.pricing.stars_per_ton,
    ));
    let payments = Arc::new(PaymentEngine::new(
        store.clone(),
        ledger,
        subscriptions.clone(),
        referrals,
        verifier,
        notifier.clone(),
        config,
    ));

    Ok(Services {
        store,
        registry,
        subscriptions,
        payments,
        notifier,
    })
}

/// Register configured servers and plans not yet known by name
async fn seed(config: &BillingConfig, services: &Services) -> Result<()> {
    let known: Vec<String> = services
        .registry
        .list()
        .await?
        .into_iter()
        .map(|s| s.name)
        .collect();
    for seed in &config.servers {
        if known.contains(&seed.name) {
            continue;
        }
        services.registry.add_server(seed.clone().into_server()).await?;
    }

    let known: Vec<String> = services
        .store
        .plans()
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect();
    for seed in &config.plans {
        if known.contains(&seed.name) {
            continue;
        }
        let plan = seed
            .clone()
            .into_plan(config.panel.default_device_limit)
            .map_err(|e| anyhow!(e))?;
        info!("Registered plan {} ({} days)", plan.name, plan.duration_days);
        services.store.insert_plan(plan).await?;
    }
    Ok(())
}

async fn cmd_start(config_path: PathBuf) -> Result<()> {
    info!("Starting VPN billing daemon...");

    let config = config::load_config(&config_path).await?;
    info!("Service wallet: {}", config.ton.wallet_address);

    let services = build(&config).await?;
    seed(&config, &services).await?;
    services
        .registry
        .sync_loads()
        .await
        .context("Failed to sync server loads")?;

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let handles = vec![
        workers::spawn(
            Arc::new(ConfirmationWorker::new(
                services.store.clone(),
                services.payments.clone(),
                config.workers.confirmation_interval(),
            )),
            shutdown_rx.clone(),
        ),
        workers::spawn(
            Arc::new(ExpiryWorker::new(
                services.store.clone(),
                services.subscriptions.clone(),
                services.notifier.clone(),
                config.workers.expiry_interval(),
                config.workers.expiring_notice_days.clone(),
            )),
            shutdown_rx.clone(),
        ),
        workers::spawn(
            Arc::new(HealthWorker::new(
                services.registry.clone(),
                config.workers.health_interval(),
                config.workers.health_ping_timeout(),
            )),
            shutdown_rx,
        ),
    ];

    info!("Billing daemon started");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    shutdown_tx.send(true).ok();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Worker ended abnormally: {}", e);
        }
    }

    info!("Billing daemon stopped");
    Ok(())
}

async fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    if let Some(path) = output {
        config::write_default(&path).await?;
        println!("Config written to {:?}", path);
    } else {
        println!("{}", config::default_toml()?);
    }

    Ok(())
}

async fn cmd_check_config(config_path: PathBuf) -> Result<()> {
    let config = config::load_config(&config_path).await?;
    println!(
        "Config OK: {} servers, {} plans",
        config.servers.len(),
        config.plans.len()
    );
    Ok(())
}
