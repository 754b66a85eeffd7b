use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Postgres>,
}

impl Database {
    pub async fn new(database_url: &str, pool_size: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    /// Ждём, пока PostgreSQL поднимется (актуально для docker-compose).
    pub async fn connect_with_retry(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::new(&config.url, config.pool_size).await {
                Ok(db) => return Ok(db),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "Waiting for PostgreSQL...");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("./src/migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}
