mod balances;
mod schema;
mod writer;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::Result;

pub use writer::{BatchReport, DurableWriter, InvalidEvent};

/// Explicitly constructed connection handle, owned by process startup and
/// injected into each component. No global singletons.
#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        tracing::info!("postgres connection pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(schema::SCHEMA).execute(&self.pool).await?;
        tracing::info!("durable schema ensured");
        Ok(())
    }
}
