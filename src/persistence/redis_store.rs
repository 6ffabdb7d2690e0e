use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

use super::{EngineSnapshot, PersistenceError, SnapshotStore};

/// Snapshot kept under a single Redis key
///
/// The previous value is copied to `{key}:previous` before each write.
pub struct RedisSnapshotStore {
    conn: ConnectionManager,
    key: String,
}

fn backend(err: redis::RedisError) -> PersistenceError {
    PersistenceError::Backend(err.to_string())
}

impl RedisSnapshotStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `key` - Key holding the snapshot JSON
    pub async fn new(redis_url: &str, key: impl Into<String>) -> Result<Self, PersistenceError> {
        let client = Client::open(redis_url).map_err(backend)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| PersistenceError::Backend("Redis connection timeout after 5 seconds".to_string()))?
            .map_err(backend)?;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: key.into(),
        })
    }

    fn previous_key(&self) -> String {
        format!("{}:previous", self.key)
    }

    /// Remove both the snapshot and its backup
    pub async fn clear(&self) -> Result<(), PersistenceError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&[self.key.as_str(), self.previous_key().as_str()])
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<(), PersistenceError> {
        let text = snapshot.to_json()?;
        let mut conn = self.conn.clone();

        let previous: Option<String> = conn.get(&self.key).await.map_err(backend)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(previous) = previous {
            pipe.set(self.previous_key(), previous).ignore();
        }
        pipe.set(&self.key, text).ignore();
        pipe.query_async::<()>(&mut conn).await.map_err(backend)?;

        tracing::debug!(key = %self.key, "Saved engine snapshot to Redis");
        Ok(())
    }

    async fn load(&self) -> Result<Option<EngineSnapshot>, PersistenceError> {
        let mut conn = self.conn.clone();
        let text: Option<String> = conn.get(&self.key).await.map_err(backend)?;

        text.as_deref().map(EngineSnapshot::from_json).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::fixtures;

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        // Try to connect to non-existent Redis
        let result = RedisSnapshotStore::new("redis://192.0.2.1:6379", "tierbot:test").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_save_and_load_snapshot() {
        let store = RedisSnapshotStore::new("redis://127.0.0.1:6379", "tierbot:test:snapshot")
            .await
            .expect("Failed to connect to Redis");
        store.clear().await.unwrap();

        assert!(store.load().await.unwrap().is_none());

        let snapshot = fixtures::snapshot();
        store.save(&snapshot).await.unwrap();
        store.save(&snapshot).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(snapshot));

        store.clear().await.unwrap();
    }
}
