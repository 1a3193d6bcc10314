use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use push_queue::config::AppConfig;
use push_queue::database::Database;
use push_queue::database::repositories::SqlxSubscriptionStore;
use push_queue::delivery::WebPushClient;
use push_queue::queue::{NotificationQueue, SqlxNotificationQueue};
use push_queue::worker::DequeueWorker;
use push_queue::{Error, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let _log_guard = logging::init_logging(config.log_dir.as_deref())?;

    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let queue = Arc::new(SqlxNotificationQueue::new(
        db.read.clone(),
        db.write.clone(),
        config.queue.clone(),
    ));
    let subscriptions = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));

    let counts = queue.status_counts().await?;
    tracing::info!(
        pending = counts.pending,
        processing = counts.processing,
        sent = counts.sent,
        failed = counts.failed,
        "Queue opened"
    );

    let client = WebPushClient::from_env()?.ok_or_else(|| {
        Error::config("WEB_PUSH_VAPID_PUBLIC_KEY and WEB_PUSH_VAPID_PRIVATE_KEY are required")
    })?;

    let cancellation_token = CancellationToken::new();
    let worker = DequeueWorker::new(
        queue,
        subscriptions,
        Arc::new(client),
        config.worker.clone(),
        cancellation_token.clone(),
    );
    let handle = worker.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    cancellation_token.cancel();

    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Dequeue worker task panicked");
    }
    db.close().await;

    Ok(())
}
