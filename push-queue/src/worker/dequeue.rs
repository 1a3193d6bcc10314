//! The claim / send / report loop.
//!
//! Every instance runs the same loop against the shared store. Exclusivity
//! comes from the queue's atomic claim and lease; a worker that dies mid-batch
//! simply lets its leases expire.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Backoff;
use crate::Result;
use crate::config::WorkerConfig;
use crate::database::models::{ClaimedDelivery, SubscriptionDescriptor};
use crate::database::time::now_ms;
use crate::database::repositories::SubscriptionStore;
use crate::delivery::{DeliveryClient, DeliveryError, PushMessage};
use crate::queue::NotificationQueue;

/// Running totals for one worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    batches: AtomicU64,
    sent: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    gone: AtomicU64,
    lease_expired: AtomicU64,
    storage_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    /// Non-empty batches claimed.
    pub batches: u64,
    pub sent: u64,
    /// Transient failures that left the delivery pending.
    pub retried: u64,
    /// Deliveries that became terminally `failed` (retries exhausted or no subscription).
    pub failed: u64,
    /// Deliveries whose endpoint the push service rejected permanently.
    pub gone: u64,
    /// Claimed deliveries skipped because their lease ran out before sending.
    pub lease_expired: u64,
    pub storage_errors: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            gone: self.gone.load(Ordering::Relaxed),
            lease_expired: self.lease_expired.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct DequeueWorker {
    queue: Arc<dyn NotificationQueue>,
    subscriptions: Arc<dyn SubscriptionStore>,
    client: Arc<dyn DeliveryClient>,
    config: WorkerConfig,
    cancellation_token: CancellationToken,
    stats: Arc<WorkerStats>,
}

impl DequeueWorker {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        subscriptions: Arc<dyn SubscriptionStore>,
        client: Arc<dyn DeliveryClient>,
        config: WorkerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            queue,
            subscriptions,
            client,
            config,
            cancellation_token,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Run the loop on a new task until the token is cancelled.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) {
        info!(
            instance_id = %self.config.instance_id,
            batch_size = self.config.batch_size,
            idle_delay_ms = self.config.idle_delay.as_millis() as u64,
            "Dequeue worker started"
        );

        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let delay = match self
                .queue
                .claim(self.config.batch_size, &self.config.instance_id)
                .await
            {
                Ok(batch) if batch.is_empty() => {
                    backoff.reset();
                    self.config.idle_delay
                }
                Ok(batch) => {
                    WorkerStats::incr(&self.stats.batches);
                    debug!(
                        instance_id = %self.config.instance_id,
                        count = batch.len(),
                        "Claimed deliveries"
                    );
                    if self.process_batch(batch).await {
                        backoff.next_delay()
                    } else {
                        backoff.reset();
                        self.config.idle_delay
                    }
                }
                Err(e) => {
                    WorkerStats::incr(&self.stats.storage_errors);
                    let delay = backoff.next_delay();
                    warn!(
                        instance_id = %self.config.instance_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to claim deliveries"
                    );
                    delay
                }
            };

            if !self.sleep_or_cancel(delay).await {
                break;
            }
        }

        let stats = self.stats.snapshot();
        info!(
            instance_id = %self.config.instance_id,
            batches = stats.batches,
            sent = stats.sent,
            retried = stats.retried,
            failed = stats.failed,
            gone = stats.gone,
            lease_expired = stats.lease_expired,
            storage_errors = stats.storage_errors,
            "Dequeue worker stopped"
        );
        match self.queue.status_counts().await {
            Ok(counts) => info!(
                pending = counts.pending,
                processing = counts.processing,
                sent = counts.sent,
                failed = counts.failed,
                "Queue status at shutdown"
            ),
            Err(e) => debug!(error = %e, "Could not read queue status at shutdown"),
        }
    }

    /// `false` when cancelled before the delay elapsed.
    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Items are independent; returns whether storage failed while reporting.
    async fn process_batch(&self, batch: Vec<ClaimedDelivery>) -> bool {
        let total = batch.len();
        let mut storage_failed = false;

        for (index, claimed) in batch.into_iter().enumerate() {
            if self.cancellation_token.is_cancelled() {
                info!(
                    instance_id = %self.config.instance_id,
                    remaining = total - index,
                    "Shutdown requested, leaving remaining deliveries to lease expiry"
                );
                break;
            }

            if let Err(e) = self.process_one(&claimed).await {
                if e.is_storage() {
                    storage_failed = true;
                    WorkerStats::incr(&self.stats.storage_errors);
                }
                warn!(
                    delivery_id = %claimed.delivery.id,
                    error = %e,
                    "Failed to record delivery outcome"
                );
            }
        }

        storage_failed
    }

    async fn process_one(&self, claimed: &ClaimedDelivery) -> Result<()> {
        let delivery_id = claimed.delivery.id.as_str();
        let instance_id = self.config.instance_id.as_str();

        // Earlier items can outlast the lease; another instance may own it now.
        if claimed
            .delivery
            .locked_until
            .is_some_and(|deadline| now_ms() > deadline)
        {
            WorkerStats::incr(&self.stats.lease_expired);
            debug!(
                delivery_id,
                lease_expired_at = ?claimed.delivery.lease_expires_at(),
                "Lease expired before send, leaving delivery to its next claimer"
            );
            return Ok(());
        }

        let Some(subscription) = claimed.subscription.as_ref() else {
            debug!(
                delivery_id,
                endpoint = %claimed.delivery.endpoint,
                "Subscription removed since enqueue, marking undeliverable"
            );
            self.queue.mark_undeliverable(delivery_id, instance_id).await?;
            WorkerStats::incr(&self.stats.failed);
            return Ok(());
        };

        let message = PushMessage::from_notification(&claimed.notification);
        match self.client.send(subscription, &message).await {
            Ok(()) => {
                self.queue.mark_sent(delivery_id, instance_id).await?;
                WorkerStats::incr(&self.stats.sent);
                debug!(delivery_id, endpoint = %subscription.endpoint, "Delivery sent");
            }
            Err(err) if err.is_permanent() => {
                // Reported only once the endpoint is gone from the store.
                self.remove_dead_subscription(subscription, &err).await?;
                self.queue.mark_undeliverable(delivery_id, instance_id).await?;
                WorkerStats::incr(&self.stats.gone);
            }
            Err(err) => match self.queue.mark_failed(delivery_id, instance_id).await? {
                Some(status) if status.is_terminal() => {
                    WorkerStats::incr(&self.stats.failed);
                    warn!(
                        delivery_id,
                        endpoint = %subscription.endpoint,
                        error = %err,
                        "Delivery failed permanently after retries"
                    );
                }
                Some(_) => {
                    WorkerStats::incr(&self.stats.retried);
                    debug!(
                        delivery_id,
                        endpoint = %subscription.endpoint,
                        error = %err,
                        "Delivery failed, will retry"
                    );
                }
                None => debug!(delivery_id, "Delivery already terminal or leased elsewhere"),
            },
        }

        Ok(())
    }

    async fn remove_dead_subscription(
        &self,
        subscription: &SubscriptionDescriptor,
        err: &DeliveryError,
    ) -> Result<()> {
        let deleted = self
            .subscriptions
            .delete_by_endpoint(&subscription.endpoint)
            .await?;
        if deleted {
            info!(
                endpoint = %subscription.endpoint,
                user_id = %subscription.user_id,
                reason = %err,
                "Deleted dead push subscription"
            );
        } else {
            debug!(endpoint = %subscription.endpoint, "Subscription already removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use crate::Error;
    use crate::config::QueueConfig;
    use crate::database::models::{DeliveryStatus, DeliveryStatusCounts, PushSubscriptionDbModel};
    use crate::database::repositories::SqlxSubscriptionStore;
    use crate::database::test_support::setup_test_db;
    use crate::queue::{NotificationPayload, SqlxNotificationQueue};

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Accept,
        Transient,
        Gone,
    }

    #[derive(Default)]
    struct ScriptedClient {
        behaviors: HashMap<String, Behavior>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedClient {
        fn new(behaviors: &[(&str, Behavior)]) -> Self {
            Self {
                behaviors: behaviors
                    .iter()
                    .map(|(endpoint, b)| (endpoint.to_string(), *b))
                    .collect(),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls(&self, endpoint: &str) -> usize {
            self.calls.lock().get(endpoint).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl DeliveryClient for ScriptedClient {
        async fn send(
            &self,
            subscription: &SubscriptionDescriptor,
            _message: &PushMessage,
        ) -> std::result::Result<(), DeliveryError> {
            *self
                .calls
                .lock()
                .entry(subscription.endpoint.clone())
                .or_default() += 1;
            match self.behaviors.get(&subscription.endpoint) {
                Some(Behavior::Accept) | None => Ok(()),
                Some(Behavior::Transient) => Err(DeliveryError::transient("503")),
                Some(Behavior::Gone) => Err(DeliveryError::Gone { status: 410 }),
            }
        }
    }

    /// Claim fails `failures` times, then the queue is empty.
    struct UnreachableQueue {
        failures: usize,
        claims: AtomicUsize,
    }

    #[async_trait]
    impl NotificationQueue for UnreachableQueue {
        async fn enqueue_single(&self, _: &str, _: &NotificationPayload) -> Result<String> {
            unimplemented!()
        }

        async fn enqueue_broadcast(&self, _: &NotificationPayload) -> Result<String> {
            unimplemented!()
        }

        async fn claim(&self, _: usize, _: &str) -> Result<Vec<ClaimedDelivery>> {
            if self.claims.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(Error::DatabaseSqlx(sqlx::Error::PoolTimedOut))
            } else {
                Ok(Vec::new())
            }
        }

        async fn mark_sent(&self, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }

        async fn mark_failed(&self, _: &str, _: &str) -> Result<Option<DeliveryStatus>> {
            unimplemented!()
        }

        async fn mark_undeliverable(&self, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }

        async fn status_counts(&self) -> Result<DeliveryStatusCounts> {
            Ok(DeliveryStatusCounts::default())
        }
    }

    /// Hands out deliveries whose lease already ran out, as a worker would
    /// see them after a long batch.
    struct ExpiredLeaseQueue {
        inner: Arc<SqlxNotificationQueue>,
    }

    #[async_trait]
    impl NotificationQueue for ExpiredLeaseQueue {
        async fn enqueue_single(&self, user_id: &str, p: &NotificationPayload) -> Result<String> {
            self.inner.enqueue_single(user_id, p).await
        }

        async fn enqueue_broadcast(&self, p: &NotificationPayload) -> Result<String> {
            self.inner.enqueue_broadcast(p).await
        }

        async fn claim(&self, batch_size: usize, instance_id: &str) -> Result<Vec<ClaimedDelivery>> {
            self.inner
                .claim_at(batch_size, instance_id, now_ms() - 120_000)
                .await
        }

        async fn mark_sent(&self, id: &str, instance_id: &str) -> Result<()> {
            self.inner.mark_sent(id, instance_id).await
        }

        async fn mark_failed(&self, id: &str, instance_id: &str) -> Result<Option<DeliveryStatus>> {
            self.inner.mark_failed(id, instance_id).await
        }

        async fn mark_undeliverable(&self, id: &str, instance_id: &str) -> Result<()> {
            self.inner.mark_undeliverable(id, instance_id).await
        }

        async fn status_counts(&self) -> Result<DeliveryStatusCounts> {
            self.inner.status_counts().await
        }
    }

    /// Subscription store whose deletes hit a storage error.
    struct BrokenDeleteStore {
        inner: SqlxSubscriptionStore,
        delete_attempts: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionStore for BrokenDeleteStore {
        async fn upsert(
            &self,
            user_id: &str,
            endpoint: &str,
            p256dh: &str,
            auth: &str,
        ) -> Result<PushSubscriptionDbModel> {
            self.inner.upsert(user_id, endpoint, p256dh, auth).await
        }

        async fn get(&self, id: &str) -> Result<PushSubscriptionDbModel> {
            self.inner.get(id).await
        }

        async fn list_for_user(&self, user_id: &str) -> Result<Vec<PushSubscriptionDbModel>> {
            self.inner.list_for_user(user_id).await
        }

        async fn delete_by_endpoint(&self, _: &str) -> Result<bool> {
            self.delete_attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::DatabaseSqlx(sqlx::Error::PoolTimedOut))
        }

        async fn unsubscribe(&self, user_id: &str, endpoint: &str) -> Result<()> {
            self.inner.unsubscribe(user_id, endpoint).await
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            instance_id: "test-worker".to_string(),
            batch_size: 10,
            idle_delay: Duration::from_millis(10),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        }
    }

    async fn wait_for_counts(queue: &SqlxNotificationQueue, expected: DeliveryStatusCounts) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let counts = queue.status_counts().await.unwrap();
            if counts == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {expected:?}, last {counts:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_sends_and_retries_until_terminal() {
        let (_dir, db) = setup_test_db().await;
        let queue = Arc::new(SqlxNotificationQueue::new(
            db.read.clone(),
            db.write.clone(),
            QueueConfig::default(),
        ));
        let store = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));
        store.upsert("u1", "https://push/ok", "k", "a").await.unwrap();
        store.upsert("u1", "https://push/flaky", "k", "a").await.unwrap();
        queue
            .enqueue_single("u1", &NotificationPayload::new("Hi", "there"))
            .await
            .unwrap();

        let client = Arc::new(ScriptedClient::new(&[
            ("https://push/ok", Behavior::Accept),
            ("https://push/flaky", Behavior::Transient),
        ]));
        let token = CancellationToken::new();
        let worker = DequeueWorker::new(
            queue.clone(),
            store.clone(),
            client.clone(),
            fast_config(),
            token.clone(),
        );
        let stats = worker.stats();
        let handle = worker.spawn();

        wait_for_counts(
            &queue,
            DeliveryStatusCounts {
                sent: 1,
                failed: 1,
                ..Default::default()
            },
        )
        .await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(client.calls("https://push/ok"), 1);
        assert_eq!(client.calls("https://push/flaky"), 3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.retried, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.storage_errors, 0);
    }

    #[tokio::test]
    async fn test_gone_endpoint_is_removed_and_not_retried() {
        let (_dir, db) = setup_test_db().await;
        let queue = Arc::new(SqlxNotificationQueue::new(
            db.read.clone(),
            db.write.clone(),
            QueueConfig::default(),
        ));
        let store = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));
        store.upsert("u1", "https://push/dead", "k", "a").await.unwrap();
        queue
            .enqueue_single("u1", &NotificationPayload::new("Hi", "there"))
            .await
            .unwrap();

        let client = Arc::new(ScriptedClient::new(&[("https://push/dead", Behavior::Gone)]));
        let token = CancellationToken::new();
        let worker = DequeueWorker::new(
            queue.clone(),
            store.clone(),
            client.clone(),
            fast_config(),
            token.clone(),
        );
        let stats = worker.stats();
        let handle = worker.spawn();

        wait_for_counts(
            &queue,
            DeliveryStatusCounts {
                failed: 1,
                ..Default::default()
            },
        )
        .await;
        // A few more idle polls must not resend.
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(client.calls("https://push/dead"), 1);
        assert!(store.list_for_user("u1").await.unwrap().is_empty());
        assert_eq!(stats.snapshot().gone, 1);

        let (retries,): (i64,) = sqlx::query_as("SELECT retries FROM notification_delivery")
            .fetch_one(&db.read)
            .await
            .unwrap();
        assert_eq!(retries, 1);
    }

    async fn wait_until(what: &str, done: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_failed_subscription_delete_leaves_delivery_leased() {
        let (_dir, db) = setup_test_db().await;
        let queue = Arc::new(SqlxNotificationQueue::new(
            db.read.clone(),
            db.write.clone(),
            QueueConfig::default(),
        ));
        let store = Arc::new(BrokenDeleteStore {
            inner: SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()),
            delete_attempts: AtomicUsize::new(0),
        });
        store.upsert("u1", "https://push/dead", "k", "a").await.unwrap();
        queue
            .enqueue_single("u1", &NotificationPayload::new("Hi", "there"))
            .await
            .unwrap();

        let client = Arc::new(ScriptedClient::new(&[("https://push/dead", Behavior::Gone)]));
        let token = CancellationToken::new();
        let worker = DequeueWorker::new(
            queue.clone(),
            store.clone(),
            client.clone(),
            fast_config(),
            token.clone(),
        );
        let stats = worker.stats();
        let handle = worker.spawn();

        wait_until("a storage error", || stats.snapshot().storage_errors >= 1).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(store.delete_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().gone, 0);
        assert_eq!(
            queue.status_counts().await.unwrap(),
            DeliveryStatusCounts {
                processing: 1,
                ..Default::default()
            }
        );
        assert_eq!(store.list_for_user("u1").await.unwrap().len(), 1);

        // Once the lease runs out the delivery comes back for another attempt.
        let retry = queue
            .claim_at(10, "next-worker", now_ms() + 61_000)
            .await
            .unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].delivery.retries, 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_not_sent_or_reported() {
        let (_dir, db) = setup_test_db().await;
        let inner = Arc::new(SqlxNotificationQueue::new(
            db.read.clone(),
            db.write.clone(),
            QueueConfig::default(),
        ));
        let store = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));
        store.upsert("u1", "https://push/slow", "k", "a").await.unwrap();
        inner
            .enqueue_single("u1", &NotificationPayload::new("Hi", "there"))
            .await
            .unwrap();

        let client = Arc::new(ScriptedClient::new(&[("https://push/slow", Behavior::Transient)]));
        let token = CancellationToken::new();
        let worker = DequeueWorker::new(
            Arc::new(ExpiredLeaseQueue {
                inner: inner.clone(),
            }),
            store,
            client.clone(),
            fast_config(),
            token.clone(),
        );
        let stats = worker.stats();
        let handle = worker.spawn();

        wait_until("a skipped delivery", || stats.snapshot().lease_expired >= 1).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(client.calls("https://push/slow"), 0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent + snapshot.retried + snapshot.failed, 0);

        let (status, retries): (String, i64) =
            sqlx::query_as("SELECT status, retries FROM notification_delivery")
                .fetch_one(&db.read)
                .await
                .unwrap();
        assert_eq!(status, "processing");
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn test_removed_subscription_is_not_sent() {
        let (_dir, db) = setup_test_db().await;
        let queue = Arc::new(SqlxNotificationQueue::new(
            db.read.clone(),
            db.write.clone(),
            QueueConfig::default(),
        ));
        let store = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));
        store.upsert("u1", "https://push/old", "k", "a").await.unwrap();
        queue
            .enqueue_single("u1", &NotificationPayload::new("Hi", "there"))
            .await
            .unwrap();
        store.unsubscribe("u1", "https://push/old").await.unwrap();

        let client = Arc::new(ScriptedClient::default());
        let token = CancellationToken::new();
        let handle = DequeueWorker::new(
            queue.clone(),
            store.clone(),
            client.clone(),
            fast_config(),
            token.clone(),
        )
        .spawn();

        wait_for_counts(
            &queue,
            DeliveryStatusCounts {
                failed: 1,
                ..Default::default()
            },
        )
        .await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(client.calls("https://push/old"), 0);
    }

    #[tokio::test]
    async fn test_claim_errors_back_off_and_recover() {
        let queue = Arc::new(UnreachableQueue {
            failures: 3,
            claims: AtomicUsize::new(0),
        });
        let (_dir, db) = setup_test_db().await;
        let store = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));

        let token = CancellationToken::new();
        let worker = DequeueWorker::new(
            queue.clone(),
            store,
            Arc::new(ScriptedClient::default()),
            fast_config(),
            token.clone(),
        );
        let stats = worker.stats();
        let handle = worker.spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.claims.load(Ordering::SeqCst) < 5 {
            assert!(tokio::time::Instant::now() < deadline, "worker stopped polling");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        handle.await.unwrap();

        assert_eq!(stats.snapshot().storage_errors, 3);
        assert_eq!(stats.snapshot().batches, 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_idle_sleep() {
        let (_dir, db) = setup_test_db().await;
        let queue = Arc::new(SqlxNotificationQueue::new(
            db.read.clone(),
            db.write.clone(),
            QueueConfig::default(),
        ));
        let store = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));

        let config = WorkerConfig {
            idle_delay: Duration::from_secs(3600),
            ..fast_config()
        };
        let token = CancellationToken::new();
        let handle = DequeueWorker::new(
            queue,
            store,
            Arc::new(ScriptedClient::default()),
            config,
            token.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not observe cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_start_claims_nothing() {
        let queue = Arc::new(UnreachableQueue {
            failures: 0,
            claims: AtomicUsize::new(0),
        });
        let (_dir, db) = setup_test_db().await;
        let store = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));

        let token = CancellationToken::new();
        token.cancel();
        DequeueWorker::new(
            queue.clone(),
            store,
            Arc::new(ScriptedClient::default()),
            fast_config(),
            token,
        )
        .run()
        .await;

        assert_eq!(queue.claims.load(Ordering::SeqCst), 0);
    }
}
