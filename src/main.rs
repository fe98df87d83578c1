use std::sync::Arc;

use evlog::{meta, LogEventConsolePrinter, Logger};

use slot_lottery::clock::SystemClock;
use slot_lottery::config::Config;
use slot_lottery::db::dbclient::DBClient;
use slot_lottery::engine::Engine;
use slot_lottery::runtime::{get_logger, set_logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let mut logger = Logger::default();
    logger.register(LogEventConsolePrinter::default());
    set_logger(logger);

    let config = Config::from_env()?;

    let db_client = DBClient::new(config.require_database_url()?, config.db_max_connections).await?;
    let engine = Engine::new(Arc::new(db_client), Arc::new(SystemClock), config.store_timeout);

    get_logger().info("Lifecycle monitor starting.", meta! {
        "IntervalSecs" => config.monitor_interval.as_secs(),
        "StoreTimeoutMs" => config.store_timeout.as_millis() as u64,
    });

    engine.monitor(config.monitor_interval).run_sweeps(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            get_logger().error_with_err("Could not listen for shutdown signal.", &e, None);
        }
    }).await;

    Ok(())
}
