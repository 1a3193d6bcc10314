#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use push_queue::config::QueueConfig;
use push_queue::database::Database;
use push_queue::database::repositories::SqlxSubscriptionStore;
use push_queue::queue::SqlxNotificationQueue;

pub fn temp_db_url(dir: &TempDir) -> String {
    let path = dir.path().join("push-queue.db");
    format!(
        "sqlite:{}?mode=rwc",
        path.to_string_lossy().replace('\\', "/")
    )
}

/// One "process" worth of handles onto a shared database file.
pub struct Node {
    pub db: Database,
    pub queue: Arc<SqlxNotificationQueue>,
    pub store: Arc<SqlxSubscriptionStore>,
}

impl Node {
    pub async fn open(url: &str) -> Self {
        let db = Database::connect(url).await.unwrap();
        let queue = Arc::new(SqlxNotificationQueue::new(
            db.read.clone(),
            db.write.clone(),
            QueueConfig::default(),
        ));
        let store = Arc::new(SqlxSubscriptionStore::new(db.read.clone(), db.write.clone()));
        Self { db, queue, store }
    }
}

pub async fn setup() -> (TempDir, Node) {
    let dir = TempDir::new().unwrap();
    let node = Node::open(&temp_db_url(&dir)).await;
    (dir, node)
}
