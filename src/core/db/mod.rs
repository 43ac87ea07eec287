use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::models::DatasetRecord;

/// Approved samples carrying at least one image
const APPROVED_SAMPLES_QUERY: &str = r#"SELECT stain_image_url, label_image_url
    FROM washing_history
    WHERE estimation = 1
      AND (stain_image_url IS NOT NULL OR label_image_url IS NOT NULL)"#;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("record store unreachable: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("record store query failed: {0}")]
    Query(#[source] sqlx::Error),
}

/// Where the sync step gets its candidate samples from
pub trait RecordSource {
    fn fetch_records(&self) -> impl Future<Output = Result<Vec<DatasetRecord>, SyncError>>;
}

/// Connection settings parsed from a `mysql://` / `mariadb://` or `sqlite:` URL
#[derive(Debug, Clone)]
pub enum StoreOptions {
    MySql(MySqlConnectOptions),
    Sqlite(SqliteConnectOptions),
}

impl StoreOptions {
    pub fn parse(url: &str) -> Result<Self, SyncError> {
        let scheme = url.split_once(':').map(|(scheme, _)| scheme).unwrap_or_default();
        match scheme {
            "mysql" | "mariadb" => {
                // sqlx only knows the mysql scheme
                let url = match url.strip_prefix("mariadb") {
                    Some(rest) => format!("mysql{}", rest),
                    None => url.to_string(),
                };
                MySqlConnectOptions::from_str(&url)
                    .map(StoreOptions::MySql)
                    .map_err(SyncError::Connection)
            }
            "sqlite" => SqliteConnectOptions::from_str(url)
                .map(|opts| StoreOptions::Sqlite(opts.read_only(true)))
                .map_err(SyncError::Connection),
            other => Err(SyncError::Connection(sqlx::Error::Configuration(
                format!("unsupported record store scheme {:?}", other).into(),
            ))),
        }
    }
}

#[derive(Debug, Clone)]
enum StorePool {
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

impl StorePool {
    async fn connect(options: StoreOptions) -> Result<Self, SyncError> {
        let pool = match options {
            StoreOptions::MySql(opts) => MySqlPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(CONNECT_TIMEOUT)
                .connect_with(opts)
                .await
                .map(StorePool::MySql),
            StoreOptions::Sqlite(opts) => SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(CONNECT_TIMEOUT)
                .connect_with(opts)
                .await
                .map(StorePool::Sqlite),
        };
        pool.map_err(SyncError::Connection)
    }

    async fn approved_samples(&self) -> Result<Vec<(Option<String>, Option<String>)>, sqlx::Error> {
        match self {
            StorePool::MySql(pool) => sqlx::query_as(APPROVED_SAMPLES_QUERY).fetch_all(pool).await,
            StorePool::Sqlite(pool) => sqlx::query_as(APPROVED_SAMPLES_QUERY).fetch_all(pool).await,
        }
    }

    async fn close(&self) {
        match self {
            StorePool::MySql(pool) => pool.close().await,
            StorePool::Sqlite(pool) => pool.close().await,
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    Url(String),
    Pool(StorePool),
}

/// Record store reached through sqlx: MySQL/MariaDB in production, SQLite
/// for local copies
#[derive(Debug, Clone)]
pub struct SqlRecordStore {
    target: Target,
}

impl SqlRecordStore {
    /// Connect lazily on every fetch, so an unreachable store surfaces as
    /// [`SyncError::Connection`] at sync time rather than at startup
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            target: Target::Url(database_url.into()),
        }
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            target: Target::Pool(StorePool::Sqlite(pool)),
        }
    }

    pub fn from_mysql_pool(pool: MySqlPool) -> Self {
        Self {
            target: Target::Pool(StorePool::MySql(pool)),
        }
    }

    async fn pool(&self) -> Result<StorePool, SyncError> {
        match &self.target {
            Target::Pool(pool) => Ok(pool.clone()),
            Target::Url(url) => StorePool::connect(StoreOptions::parse(url)?).await,
        }
    }
}

impl RecordSource for SqlRecordStore {
    async fn fetch_records(&self) -> Result<Vec<DatasetRecord>, SyncError> {
        let pool = self.pool().await?;
        let rows = pool.approved_samples().await.map_err(SyncError::Query)?;
        if let Target::Url(_) = self.target {
            pool.close().await;
        }
        Ok(rows
            .into_iter()
            .map(|(stain_url, label_url)| DatasetRecord {
                stain_url,
                label_url,
                accepted: true,
            })
            .collect())
    }
}

/// Fixed list of records, for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticRecords(pub Vec<DatasetRecord>);

impl RecordSource for StaticRecords {
    async fn fetch_records(&self) -> Result<Vec<DatasetRecord>, SyncError> {
        Ok(self.0.clone())
    }
}
