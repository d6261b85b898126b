// Preflight checks run before the scheduler starts
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

pub async fn check_db_connection(pool: &PgPool, database: &DatabaseConfig) -> bool {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
        Ok(_) => {
            info!(host = %database.host, database = %database.database, "Connected to database");
            true
        }
        Err(e) => {
            warn!(host = %database.host, database = %database.database, error = %e, "Failed to connect to database");
            false
        }
    }
}
