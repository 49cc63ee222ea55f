//! PostgreSQL snapshot store

use super::attempt::{Asset, RefillAttempt};
use super::store::{SnapshotEvent, SnapshotStore};
use crate::config::DatabaseConfig;
use crate::error::{RefillError, RefillResult};

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notification channel shared by every process watching the same faucet
const SNAPSHOT_CHANNEL: &str = "refill_snapshots";

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
    origin: Uuid,
    events: broadcast::Sender<SnapshotEvent>,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RefillResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        let (events, _) = broadcast::channel(256);

        Ok(Self {
            pool,
            origin: Uuid::new_v4(),
            events,
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RefillResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refill_snapshots (
                asset VARCHAR(16) PRIMARY KEY,
                snapshot JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> RefillResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Relay snapshot notifications written by other processes
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = manager.listen().await {
                    warn!("Snapshot listener error: {}", e);
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        })
    }

    async fn listen(&self) -> RefillResult<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(SNAPSHOT_CHANNEL).await?;
        info!("Listening for snapshot changes on {}", SNAPSHOT_CHANNEL);

        loop {
            let notification = listener.recv().await?;
            let event: SnapshotEvent = match serde_json::from_str(notification.payload()) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Ignoring malformed snapshot notification: {}", e);
                    continue;
                }
            };

            // Local writes were already broadcast
            if event.origin == self.origin {
                continue;
            }

            debug!("Snapshot for {} changed in another process", event.asset);
            let _ = self.events.send(event);
        }
    }

    async fn publish(&self, event: SnapshotEvent) -> RefillResult<()> {
        let payload = serde_json::to_string(&event)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(SNAPSHOT_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;

        let _ = self.events.send(event);
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for StateManager {
    fn origin(&self) -> Uuid {
        self.origin
    }

    async fn save(&self, asset: Asset, attempt: &RefillAttempt) -> RefillResult<()> {
        let snapshot = serde_json::to_value(attempt)?;

        sqlx::query(
            r#"
            INSERT INTO refill_snapshots (asset, snapshot, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (asset)
            DO UPDATE SET snapshot = $2, updated_at = NOW()
            "#,
        )
        .bind(asset.as_str())
        .bind(snapshot)
        .execute(&self.pool)
        .await?;

        debug!(
            "Saved snapshot for {}: {} ({}%)",
            asset,
            attempt.status.as_str(),
            attempt.progress
        );

        self.publish(SnapshotEvent {
            origin: self.origin,
            asset,
            snapshot: Some(attempt.clone()),
        })
        .await
    }

    async fn load(&self, asset: Asset) -> RefillResult<Option<RefillAttempt>> {
        let row = sqlx::query("SELECT snapshot FROM refill_snapshots WHERE asset = $1")
            .bind(asset.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.get("snapshot");
                let attempt = serde_json::from_value(value).map_err(|e| {
                    RefillError::Internal(format!("corrupt snapshot for {}: {}", asset, e))
                })?;
                Ok(Some(attempt))
            }
            None => Ok(None),
        }
    }

    async fn clear(&self, asset: Asset) -> RefillResult<()> {
        sqlx::query("DELETE FROM refill_snapshots WHERE asset = $1")
            .bind(asset.as_str())
            .execute(&self.pool)
            .await?;

        debug!("Cleared snapshot for {}", asset);

        self.publish(SnapshotEvent {
            origin: self.origin,
            asset,
            snapshot: None,
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.events.subscribe()
    }
}
