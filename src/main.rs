//! OpenSASE Checkout - inventory holds and order commit service

use anyhow::{Context, Result};
use opensase_checkout::checkout::{NatsPaymentGateway, PgCheckoutStore};
use opensase_checkout::{api, ledger, CheckoutCoordinator, Clock, Config, PgLedger, Signals, SystemClock};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let database_url = config.database_url.as_deref().context("DATABASE_URL must be set")?;
    let db = PgPoolOptions::new().max_connections(config.database_max_connections).connect(database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let nats = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, payment hand-off and signals disabled");
                None
            }
        },
        None => None,
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stock = Arc::new(PgLedger::new(db.clone(), clock.clone(), config.checkout.hold_window));
    let sweeper = ledger::spawn_sweeper(stock.clone(), config.sweep_interval);
    let coordinator = CheckoutCoordinator::new(
        stock,
        Arc::new(PgCheckoutStore::new(db)),
        Arc::new(NatsPaymentGateway::new(nats.clone())),
        Signals::new(nats),
        clock,
        config.checkout.clone(),
    );
    let app = api::router(Arc::new(coordinator));

    tracing::info!("🚀 OpenSASE Checkout listening on 0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;
    Ok(())
}
