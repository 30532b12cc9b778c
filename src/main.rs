use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokencore::api;
use tokencore::config::Config;
use tokencore::db::init_db;
use tokencore::domain::TimeMs;
use tokencore::metering::{CallService, CooldownCache, MeteringScheduler};
use tokencore::notify::{HttpNotifier, NoopNotifier, Notifier};
use tokencore::reconcile::Reconciler;
use tokencore::settlement::{Auditor, SettlementEngine, TransferService};
use tokencore::withdrawals::WithdrawalService;
use tokencore::Repository;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let port = config.port;

    // Initialize database and dependencies
    let pool = match init_db(&config.database_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let repo = Arc::new(Repository::new(pool));
    let notifier: Arc<dyn Notifier> = match &config.notify_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    };
    let engine = Arc::new(SettlementEngine::new(
        repo.clone(),
        notifier,
        config.billing_interval_ms,
    ));
    let transfers = Arc::new(TransferService::new(
        repo.clone(),
        engine.clone(),
        config.platform_fee_bps,
    ));
    let calls = Arc::new(CallService::new(
        repo.clone(),
        engine.clone(),
        CooldownCache::new(config.call_cooldown_capacity, config.call_cooldown_ms),
    ));
    let withdrawals = Arc::new(WithdrawalService::new(
        repo.clone(),
        engine.clone(),
        config.withdrawal_ttl_ms,
    ));
    let scheduler = Arc::new(MeteringScheduler::new(
        repo.clone(),
        engine.clone(),
        withdrawals.clone(),
    ));
    let auditor = Arc::new(Auditor::new(repo.clone()));
    let reconciler = Arc::new(Reconciler::new(repo.clone(), engine.clone()));

    if config.billing_autorun {
        let scheduler = scheduler.clone();
        let interval_ms = config.billing_interval_ms;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(interval_ms as u64));
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.run_tick(TimeMs::now()).await {
                    tracing::error!(error = %e, "Billing tick failed");
                }
            }
        });
    }

    // Create router
    let app = api::create_router(api::AppState {
        repo,
        config,
        engine,
        transfers,
        calls,
        withdrawals,
        scheduler,
        auditor,
        reconciler,
    });

    // Bind to address
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", addr);

    // Run server
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
