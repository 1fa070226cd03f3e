use crate::config::{ApiConfig, UploadConfig};
use crate::detection_store::{
    Detection, DetectionPage, DetectionQuery, DetectionStore, NewDetection, SortField, SortOrder,
};
use crate::error::ApiError;
use crate::file_store::{display_name, FileStore};
use crate::job_worker::{DetectionJob, DispatchError, JobDispatcher};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartError,
        rejection::{PathRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

const MAX_AUTHOR_NAME_CHARS: usize = 100;
const MAX_AUTHOR_EMAIL_CHARS: usize = 255;
const MAX_TITLE_CHARS: usize = 200;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DetectionStore>,
    pub files: Arc<FileStore>,
    pub dispatcher: JobDispatcher,
    pub pagination: Pagination,
}

/// Page size limits for the listing endpoint
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub default_limit: i64,
    pub max_limit: i64,
}

impl From<&ApiConfig> for Pagination {
    fn from(config: &ApiConfig) -> Self {
        Self {
            default_limit: config.default_page_size,
            max_limit: config.max_page_size,
        }
    }
}

/// Query parameters for the detection list
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Offset for pagination
    pub skip: Option<i64>,
    /// Page size
    pub limit: Option<i64>,
    /// Substring matched against title, author and description
    pub search: Option<String>,
    #[serde(alias = "sortBy")]
    pub sort_by: Option<String>,
    /// asc or desc
    pub order: Option<String>,
}

impl ListParams {
    /// Validate the raw parameters into a store query
    pub fn into_query(self, pagination: Pagination) -> Result<DetectionQuery, ApiError> {
        let offset = self.skip.unwrap_or(0);
        if offset < 0 {
            return Err(ApiError::validation("skip must not be negative"));
        }

        let limit = self.limit.unwrap_or(pagination.default_limit);
        if limit < 0 {
            return Err(ApiError::validation("limit must not be negative"));
        }

        let sort_by: SortField = match self.sort_by.as_deref() {
            Some(field) if !field.is_empty() => field.parse().map_err(ApiError::Validation)?,
            _ => SortField::default(),
        };

        let order: SortOrder = match self.order.as_deref() {
            Some(order) if !order.is_empty() => order.parse().map_err(ApiError::Validation)?,
            _ => SortOrder::default(),
        };

        Ok(DetectionQuery {
            search: self.search.filter(|s| !s.is_empty()),
            sort_by,
            order,
            offset,
            limit: limit.min(pagination.max_limit),
        })
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig, uploads: &UploadConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/detect", post(create_detection))
        .route("/api/detections", get(list_detections))
        .route("/api/detections/:id", get(get_detection))
        .layer(DefaultBodyLimit::max(uploads.max_upload_bytes));

    if config.serve_uploads {
        router = router.nest_service("/uploads", ServeDir::new(state.files.root()));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "detector-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected"
                })),
            )
        }
    }
}

struct UploadedFile {
    name: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct UploadForm {
    file: Option<UploadedFile>,
    author_name: Option<String>,
    author_email: Option<String>,
    title: Option<String>,
    description: Option<String>,
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::validation(format!("Invalid multipart body: {}", err.body_text()))
    }
}

/// Empty or whitespace-only form values count as absent
fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let key = field.name().unwrap_or("").to_string();
        match key.as_str() {
            "file" => {
                let name = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| ApiError::validation("file must have a filename"))?;
                let bytes = field.bytes().await.map_err(multipart_error)?.to_vec();
                form.file = Some(UploadedFile { name, bytes });
            }
            "author_name" | "authorName" => {
                form.author_name = non_empty(field.text().await.map_err(multipart_error)?);
            }
            "author_email" | "authorEmail" => {
                form.author_email = non_empty(field.text().await.map_err(multipart_error)?);
            }
            "title" => {
                form.title = non_empty(field.text().await.map_err(multipart_error)?);
            }
            "description" => {
                form.description = non_empty(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    Ok(form)
}

fn check_length(field: &str, value: Option<&String>, max: usize) -> Result<(), ApiError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ApiError::validation(format!(
            "{field} must be at most {max} characters"
        ))),
        _ => Ok(()),
    }
}

/// Accept an uploaded image and record a detection for it
#[instrument(skip(state, multipart))]
async fn create_detection(
    State(state): State<AppState>,
    multipart: Result<Multipart, axum::extract::multipart::MultipartRejection>,
) -> Result<Json<Detection>, ApiError> {
    let result = ingest(&state, multipart).await;

    match &result {
        Ok(detection) => {
            metrics::counter!("detector.uploads.accepted").increment(1);
            info!(id = detection.id, status = %detection.status, "Upload accepted");
        }
        Err(_) => metrics::counter!("detector.uploads.rejected").increment(1),
    }

    result.map(Json)
}

async fn ingest(
    state: &AppState,
    multipart: Result<Multipart, axum::extract::multipart::MultipartRejection>,
) -> Result<Detection, ApiError> {
    let multipart = multipart
        .map_err(|e| ApiError::validation(format!("Expected a multipart form: {}", e.body_text())))?;
    let form = read_upload_form(multipart).await?;

    let file = form
        .file
        .ok_or_else(|| ApiError::validation("file is required"))?;
    if file.bytes.is_empty() {
        return Err(ApiError::validation("file is empty"));
    }

    let author_name = form
        .author_name
        .ok_or_else(|| ApiError::validation("author_name is required"))?;
    check_length("author_name", Some(&author_name), MAX_AUTHOR_NAME_CHARS)?;
    check_length("author_email", form.author_email.as_ref(), MAX_AUTHOR_EMAIL_CHARS)?;
    check_length("title", form.title.as_ref(), MAX_TITLE_CHARS)?;

    let title = form.title.unwrap_or_else(|| {
        display_name(&file.name)
            .chars()
            .take(MAX_TITLE_CHARS)
            .collect()
    });

    let write_started = Instant::now();
    let upload = state.files.store_original(&file.name, &file.bytes).await?;
    let upload_elapsed = write_started.elapsed();

    let new = NewDetection {
        original_image_path: upload.original_path.to_string_lossy().into_owned(),
        author_name,
        author_email: form.author_email,
        title: Some(title),
        description: form.description,
    };

    let detection = match state.store.insert(&new).await {
        Ok(detection) => detection,
        Err(e) => {
            // Do not leave an original behind without a record
            state.files.remove(&upload.original_path).await;
            return Err(e.into());
        }
    };

    let job = DetectionJob {
        detection_id: detection.id,
        file_name: upload.file_name,
        original_path: upload.original_path,
        upload_elapsed,
    };

    match state.dispatcher.dispatch(job).await {
        Ok(Some(processed)) => Ok(processed),
        Ok(None) => Ok(detection),
        Err(DispatchError::QueueFull) | Err(DispatchError::QueueClosed) => {
            Err(ApiError::QueueUnavailable)
        }
        Err(DispatchError::Store(e)) => Err(e.into()),
    }
}

/// List detections with search, sorting and pagination
#[instrument(skip(state))]
async fn list_detections(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<DetectionPage>, ApiError> {
    let Query(params) = params
        .map_err(|e| ApiError::validation(format!("Invalid query parameters: {}", e.body_text())))?;
    let query = params.into_query(state.pagination)?;

    let page = state.store.list(&query).await?;

    Ok(Json(page))
}

/// Get a single detection
#[instrument(skip(state))]
async fn get_detection(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Detection>, ApiError> {
    let Path(id) = id.map_err(|_| ApiError::validation("Invalid detection id"))?;

    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// Start the API server; returns once `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    uploads: &UploadConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config, uploads);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting detector API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
