use crate::config::DatabaseConfig;
use anyhow::{bail, Context};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};

const COLUMNS: &str = "id, original_image_path, visualized_image_path, number_of_persons, \
     author_name, author_email, title, description, created_at, updated_at, status, processing_time";

/// Errors raised by the detection store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("database query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("detection {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: DetectionStatus,
        to: DetectionStatus,
    },

    #[error("detection {id} has corrupt column {column}")]
    Corrupt { id: i64, column: &'static str },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err),
            other => StoreError::Query(other),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Lifecycle of a detection job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    /// Upload stored, detection not started
    Pending,
    /// Detector is running
    Processing,
    /// Detection finished and results recorded
    Completed,
    /// Detection could not be finished
    Failed,
}

impl DetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionStatus::Pending => "pending",
            DetectionStatus::Processing => "processing",
            DetectionStatus::Completed => "completed",
            DetectionStatus::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: DetectionStatus) -> bool {
        matches!(
            (self, next),
            (DetectionStatus::Pending, DetectionStatus::Processing)
                | (DetectionStatus::Pending, DetectionStatus::Failed)
                | (DetectionStatus::Processing, DetectionStatus::Completed)
                | (DetectionStatus::Processing, DetectionStatus::Failed)
        )
    }
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DetectionStatus::Pending),
            "processing" => Ok(DetectionStatus::Processing),
            "completed" => Ok(DetectionStatus::Completed),
            "failed" => Ok(DetectionStatus::Failed),
            other => Err(format!("unknown detection status: {other}")),
        }
    }
}

/// A stored detection record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: i64,
    /// Path of the uploaded image
    pub original_image_path: String,
    /// Path of the annotated image, once the detector produced one
    pub visualized_image_path: Option<String>,
    /// Persons found, once the detector ran
    pub number_of_persons: Option<i64>,
    pub author_name: String,
    pub author_email: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DetectionStatus,
    /// Duration of the detection step in milliseconds
    pub processing_time: Option<i64>,
}

/// Raw row; timestamps are microseconds since the epoch so the schema is
/// identical on PostgreSQL and SQLite.
#[derive(Debug, FromRow)]
struct DetectionRow {
    id: i64,
    original_image_path: String,
    visualized_image_path: Option<String>,
    number_of_persons: Option<i64>,
    author_name: String,
    author_email: Option<String>,
    title: Option<String>,
    description: Option<String>,
    created_at: i64,
    updated_at: i64,
    status: String,
    processing_time: Option<i64>,
}

impl TryFrom<DetectionRow> for Detection {
    type Error = StoreError;

    fn try_from(row: DetectionRow) -> StoreResult<Self> {
        let id = row.id;
        let status = row
            .status
            .parse()
            .map_err(|_| StoreError::Corrupt { id, column: "status" })?;
        let created_at = from_micros(row.created_at)
            .ok_or(StoreError::Corrupt { id, column: "created_at" })?;
        let updated_at = from_micros(row.updated_at)
            .ok_or(StoreError::Corrupt { id, column: "updated_at" })?;

        Ok(Detection {
            id,
            original_image_path: row.original_image_path,
            visualized_image_path: row.visualized_image_path,
            number_of_persons: row.number_of_persons,
            author_name: row.author_name,
            author_email: row.author_email,
            title: row.title,
            description: row.description,
            created_at,
            updated_at,
            status,
            processing_time: row.processing_time,
        })
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Fields supplied when an upload is recorded
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub original_image_path: String,
    pub author_name: String,
    pub author_email: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Results written when a job completes
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub number_of_persons: i64,
    pub visualized_image_path: Option<String>,
    pub processing_time_ms: i64,
}

/// Columns a listing may be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    Id,
    #[default]
    CreatedAt,
    UpdatedAt,
    Title,
    AuthorName,
    AuthorEmail,
    NumberOfPersons,
    Status,
    ProcessingTime,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::Id => "id",
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Title => "title",
            SortField::AuthorName => "author_name",
            SortField::AuthorEmail => "author_email",
            SortField::NumberOfPersons => "number_of_persons",
            SortField::Status => "status",
            SortField::ProcessingTime => "processing_time",
        }
    }

    fn nullable(&self) -> bool {
        matches!(
            self,
            SortField::Title
                | SortField::AuthorEmail
                | SortField::NumberOfPersons
                | SortField::ProcessingTime
        )
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(SortField::Id),
            "created_at" | "createdAt" => Ok(SortField::CreatedAt),
            "updated_at" | "updatedAt" => Ok(SortField::UpdatedAt),
            "title" => Ok(SortField::Title),
            "author_name" | "authorName" => Ok(SortField::AuthorName),
            "author_email" | "authorEmail" => Ok(SortField::AuthorEmail),
            "number_of_persons" | "numberOfPersons" => Ok(SortField::NumberOfPersons),
            "status" => Ok(SortField::Status),
            "processing_time" | "processingTime" => Ok(SortField::ProcessingTime),
            other => Err(format!("Unsupported sort field: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(format!("Unsupported sort order: {s}")),
        }
    }
}

/// Listing parameters
#[derive(Debug, Clone)]
pub struct DetectionQuery {
    /// Case-insensitive substring matched against title, author and description
    pub search: Option<String>,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub offset: i64,
    pub limit: i64,
}

/// One page of a listing together with the unpaginated match count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPage {
    pub items: Vec<Detection>,
    pub total: i64,
}

/// Database backend selected by the connection URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> anyhow::Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Backend::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else {
            bail!("Unsupported database URL scheme; expected postgres:// or sqlite:")
        }
    }
}

/// Relational store of detection records
pub struct DetectionStore {
    pool: AnyPool,
    backend: Backend,
}

impl DetectionStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let backend = Backend::from_url(&config.url)?;

        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to detection database")?;

        info!(backend = ?backend, "Connected to detection database");

        Ok(Self { pool, backend })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!(backend = ?self.backend, "Running database migrations");

        let migrator = match self.backend {
            Backend::Postgres => sqlx::migrate!("./migrations/postgres"),
            Backend::Sqlite => sqlx::migrate!("./migrations/sqlite"),
        };

        migrator
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Record a freshly stored upload as a pending detection
    #[instrument(skip(self, new), fields(author = %new.author_name))]
    pub async fn insert(&self, new: &NewDetection) -> StoreResult<Detection> {
        let now = to_micros(Utc::now());

        let sql = format!(
            r#"
            INSERT INTO detections (
                original_image_path, author_name, author_email, title,
                description, created_at, updated_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $6, $7)
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, DetectionRow>(&sql)
            .bind(&new.original_image_path)
            .bind(&new.author_name)
            .bind(&new.author_email)
            .bind(&new.title)
            .bind(&new.description)
            .bind(now)
            .bind(DetectionStatus::Pending.as_str())
            .fetch_one(&self.pool)
            .await?;

        let detection = Detection::try_from(row)?;

        debug!(id = detection.id, "Detection recorded");

        Ok(detection)
    }

    /// Get a detection by ID
    pub async fn get(&self, id: i64) -> StoreResult<Option<Detection>> {
        let sql = format!("SELECT {COLUMNS} FROM detections WHERE id = $1");

        let row = sqlx::query_as::<_, DetectionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Detection::try_from).transpose()
    }

    /// List detections with search, ordering and pagination
    #[instrument(skip(self))]
    pub async fn list(&self, query: &DetectionQuery) -> StoreResult<DetectionPage> {
        let pattern = query
            .search
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        let mut filter = String::new();
        let mut param_count = 0;

        if pattern.is_some() {
            param_count += 1;
            filter.push_str(&format!(
                // Same LOWER on both sides; SQLite only folds ASCII
                r#" WHERE (LOWER(title) LIKE LOWER(${p}) ESCAPE '\'
                    OR LOWER(author_name) LIKE LOWER(${p}) ESCAPE '\'
                    OR LOWER(description) LIKE LOWER(${p}) ESCAPE '\')"#,
                p = param_count
            ));
        }

        let count_sql = format!("SELECT COUNT(*) FROM detections{filter}");
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        if let Some(ref pattern) = pattern {
            count_query = count_query.bind(pattern);
        }
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let column = query.sort_by.column();
        let direction = query.order.as_sql();

        let mut sql = format!("SELECT {COLUMNS} FROM detections{filter} ORDER BY ");
        // NULLs sort last on both backends
        if query.sort_by.nullable() {
            sql.push_str(&format!("CASE WHEN {column} IS NULL THEN 1 ELSE 0 END, "));
        }
        sql.push_str(&format!("{column} {direction}"));
        if query.sort_by != SortField::Id {
            sql.push_str(&format!(", id {direction}"));
        }

        param_count += 1;
        sql.push_str(&format!(" LIMIT ${}", param_count));
        param_count += 1;
        sql.push_str(&format!(" OFFSET ${}", param_count));

        let mut items_query = sqlx::query_as::<_, DetectionRow>(&sql);
        if let Some(ref pattern) = pattern {
            items_query = items_query.bind(pattern);
        }
        let rows = items_query
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(Detection::try_from)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(DetectionPage { items, total })
    }

    /// Move a detection between states; fails unless it is currently in `from`
    #[instrument(skip(self))]
    pub async fn transition(
        &self,
        id: i64,
        from: DetectionStatus,
        to: DetectionStatus,
    ) -> StoreResult<Detection> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { id, from, to });
        }

        let sql = format!(
            r#"
            UPDATE detections
            SET status = $1,
                updated_at = CASE WHEN updated_at > $2 THEN updated_at ELSE $2 END
            WHERE id = $3 AND status = $4
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, DetectionRow>(&sql)
            .bind(to.as_str())
            .bind(to_micros(Utc::now()))
            .bind(id)
            .bind(from.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Detection::try_from(row),
            None => Err(StoreError::InvalidTransition { id, from, to }),
        }
    }

    /// Record detection results and move a processing job to completed
    #[instrument(skip(self, result))]
    pub async fn complete(&self, id: i64, result: &DetectionResult) -> StoreResult<Detection> {
        let sql = format!(
            r#"
            UPDATE detections
            SET status = $1,
                number_of_persons = $2,
                visualized_image_path = $3,
                processing_time = $4,
                updated_at = CASE WHEN updated_at > $5 THEN updated_at ELSE $5 END
            WHERE id = $6 AND status = $7
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, DetectionRow>(&sql)
            .bind(DetectionStatus::Completed.as_str())
            .bind(result.number_of_persons)
            .bind(&result.visualized_image_path)
            .bind(result.processing_time_ms)
            .bind(to_micros(Utc::now()))
            .bind(id)
            .bind(DetectionStatus::Processing.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Detection::try_from(row),
            None => Err(StoreError::InvalidTransition {
                id,
                from: DetectionStatus::Processing,
                to: DetectionStatus::Completed,
            }),
        }
    }

    /// Fail every job left pending or processing by a previous run
    #[instrument(skip(self))]
    pub async fn fail_unfinished(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE detections
            SET status = $1,
                updated_at = CASE WHEN updated_at > $2 THEN updated_at ELSE $2 END
            WHERE status IN ($3, $4)
            "#,
        )
        .bind(DetectionStatus::Failed.as_str())
        .bind(to_micros(Utc::now()))
        .bind(DetectionStatus::Pending.as_str())
        .bind(DetectionStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Check database connectivity
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// `%needle%` with LIKE wildcards escaped
fn like_pattern(search: &str) -> String {
    let mut pattern = String::with_capacity(search.len() + 2);
    pattern.push('%');
    for c in search.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use DetectionStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            DetectionStatus::Pending,
            DetectionStatus::Processing,
            DetectionStatus::Completed,
            DetectionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DetectionStatus>(), Ok(status));
        }
        assert!("done".parse::<DetectionStatus>().is_err());
    }

    #[test]
    fn test_sort_field_whitelist() {
        assert_eq!("created_at".parse(), Ok(SortField::CreatedAt));
        assert_eq!("authorName".parse(), Ok(SortField::AuthorName));
        assert_eq!("author_name".parse::<SortField>().unwrap().column(), "author_name");
        assert!("author_name; DROP TABLE detections".parse::<SortField>().is_err());
        assert!("original_image_path".parse::<SortField>().is_err());
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!("asc".parse(), Ok(SortOrder::Asc));
        assert_eq!("DESC".parse(), Ok(SortOrder::Desc));
        assert!("sideways".parse::<SortOrder>().is_err());
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("Alice"), "%Alice%");
        assert_eq!(like_pattern("Élise"), "%Élise%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn test_micros_conversion() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        assert_eq!(from_micros(to_micros(ts)), Some(ts));
        assert!(from_micros(-1).is_some());
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            Backend::from_url("postgresql://postgres@localhost/db").unwrap(),
            Backend::Postgres
        );
        assert_eq!(Backend::from_url("sqlite://detections.db").unwrap(), Backend::Sqlite);
        assert_eq!(Backend::from_url("sqlite::memory:").unwrap(), Backend::Sqlite);
        assert!(Backend::from_url("mysql://localhost/db").is_err());
    }
}
