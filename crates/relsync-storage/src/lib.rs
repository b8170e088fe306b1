//! Primary relationship store access + windowed record paging for relsync.

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use relsync_core::RelationshipRecord;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::info;

mod source;

pub use source::{RecordSource, SourceOutcome, SourceStats, Window};

pub const CRATE_NAME: &str = "relsync-storage";

/// SQLSTATE raised when `statement_timeout` cancels a running query.
const QUERY_CANCELED: &str = "57014";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Why a page stopped before yielding all of its rows.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("cursor timed out: {0}")]
    Timeout(String),
    #[error("cursor failed: {0}")]
    Cursor(String),
}

impl PageError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> PageError {
    let timed_out = match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Io(io) => io.kind() == std::io::ErrorKind::TimedOut,
        sqlx::Error::Database(db) => db.code().as_deref() == Some(QUERY_CANCELED),
        _ => false,
    };
    if timed_out {
        PageError::Timeout(err.to_string())
    } else {
        PageError::Cursor(err.to_string())
    }
}

/// Ordered, filtered relationship collection that can be read in skip/limit pages.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Number of rows in the filtered collection.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Open a cursor over `limit` rows starting at offset `skip`.
    fn open_page(&self, skip: u64, limit: u64) -> Box<dyn RelationshipPage + '_>;
}

#[async_trait]
pub trait RelationshipPage: Send {
    /// `Ok(None)` once the page is drained.
    async fn next_record(&mut self) -> Result<Option<RelationshipRecord>, PageError>;
}

#[derive(Debug, Clone, FromRow)]
struct RelationshipRow {
    id: String,
    source_id: String,
    source_name: String,
    target_id: String,
    target_name: String,
    #[sqlx(rename = "as")]
    rel_type: String,
}

impl From<RelationshipRow> for RelationshipRecord {
    fn from(row: RelationshipRow) -> Self {
        Self {
            id: row.id,
            source_id: row.source_id,
            source_name: row.source_name,
            target_id: row.target_id,
            target_name: row.target_name,
            rel_type: row.rel_type,
        }
    }
}

const COUNT_SQL: &str = r#"
    SELECT COUNT(*)
      FROM relationships
     WHERE NOT (source_name = ANY($1))
       AND NOT (target_name = ANY($1))
"#;

const PAGE_SQL: &str = r#"
    SELECT id, source_id, source_name, target_id, target_name, "as"
      FROM relationships
     WHERE NOT (source_name = ANY($1))
       AND NOT (target_name = ANY($1))
     ORDER BY id
    OFFSET $2
     LIMIT $3
"#;

/// `relationships` table in Postgres, minus rows whose endpoints are of an excluded kind.
#[derive(Debug, Clone)]
pub struct PgRelationshipStore {
    pool: PgPool,
    excluded_kinds: Vec<String>,
}

impl PgRelationshipStore {
    pub fn new(pool: PgPool, excluded_kinds: Vec<String>) -> Self {
        Self {
            pool,
            excluded_kinds,
        }
    }

    pub async fn connect(database_url: &str, excluded_kinds: Vec<String>) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to primary relationship store")?;
        info!(excluded_kinds = excluded_kinds.len(), "connected to primary relationship store");
        Ok(Self::new(pool, excluded_kinds))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying relationship store migrations")?;
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl RelationshipStore for PgRelationshipStore {
    async fn count(&self) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar(COUNT_SQL)
            .bind(&self.excluded_kinds)
            .fetch_one(&self.pool)
            .await?;
        u64::try_from(total).map_err(|_| StoreError::Message(format!("negative row count {total}")))
    }

    fn open_page(&self, skip: u64, limit: u64) -> Box<dyn RelationshipPage + '_> {
        let rows = sqlx::query_as::<_, RelationshipRow>(PAGE_SQL)
            .bind(self.excluded_kinds.clone())
            .bind(to_i64(skip))
            .bind(to_i64(limit))
            .fetch(&self.pool);
        Box::new(PgRelationshipPage { rows })
    }
}

struct PgRelationshipPage<'a> {
    rows: BoxStream<'a, Result<RelationshipRow, sqlx::Error>>,
}

#[async_trait]
impl RelationshipPage for PgRelationshipPage<'_> {
    async fn next_record(&mut self) -> Result<Option<RelationshipRecord>, PageError> {
        match self.rows.try_next().await {
            Ok(row) => Ok(row.map(RelationshipRecord::from)),
            Err(err) => Err(classify_sqlx_error(&err)),
        }
    }
}
