use sqlx::{migrate::MigrateDatabase, postgres::PgPoolOptions, PgPool, Postgres};
use std::future::Future;
use std::time::Duration;

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),      // 10 minutes
            max_lifetime: Duration::from_secs(1800),     // 30 minutes
        }
    }
}

impl PoolConfig {
    /// Create config from `DB_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |var: &str, fallback: Duration| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            min_connections: std::env::var("DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_connections),
            acquire_timeout: secs("DB_ACQUIRE_TIMEOUT", defaults.acquire_timeout),
            idle_timeout: secs("DB_IDLE_TIMEOUT", defaults.idle_timeout),
            max_lifetime: secs("DB_MAX_LIFETIME", defaults.max_lifetime),
        }
    }
}

/// Create a database connection pool, creating the database if it is missing
pub async fn create_pool(database_url: &str, config: PoolConfig) -> anyhow::Result<PgPool> {
    if !Postgres::database_exists(database_url).await? {
        Postgres::create_database(database_url).await?;
        tracing::info!("Database created successfully");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    tracing::info!(
        "Database pool created: max={}, min={}, acquire_timeout={}s",
        config.max_connections,
        config.min_connections,
        config.acquire_timeout.as_secs()
    );

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check database health
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

/// Attempts made for a statement that keeps hitting serialization failures
pub const MAX_TX_ATTEMPTS: u32 = 3;

/// Serialization failure or deadlock; safe to re-run the statement.
pub fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
        _ => false,
    }
}

pub enum RetryError {
    Exhausted { attempts: u32 },
    Fatal(sqlx::Error),
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `MAX_TX_ATTEMPTS` is reached.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) => {
                if attempt >= MAX_TX_ATTEMPTS {
                    tracing::error!(attempts = attempt, "Giving up on conflicting statement: {}", err);
                    return Err(RetryError::Exhausted { attempts: attempt });
                }
                tracing::warn!(attempt, "Retrying conflicting statement: {}", err);
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
            }
            Err(err) => return Err(RetryError::Fatal(err)),
        }
    }
}
