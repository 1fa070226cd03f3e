//! Detector Service
//!
//! Accepts uploaded images together with author metadata, stores them on
//! disk, records a detection record per upload in a relational database and
//! exposes searchable, sortable, paginated listing and retrieval over HTTP.
//!
//! ## Features
//!
//! - **Upload ingestion**: multipart uploads written to `original/` under a
//!   collision-free generated name
//! - **Detection jobs**: every upload runs through a
//!   pending → processing → completed/failed state machine, either inline
//!   with the request or on a background worker fed by a bounded queue
//! - **Pluggable detector**: the [`PersonDetector`] trait; the bundled
//!   [`PlaceholderDetector`] reports one person and copies the image as its
//!   visualization
//! - **Portable storage**: one schema for PostgreSQL and SQLite, selected by
//!   the connection URL
//!
//! ## Architecture
//!
//! ```text
//!  POST /api/detect           uploads/                 detections table
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Ingest       │──────────▶│ original/    │          │ pending      │
//! │ handler      │           └──────────────┘          │ processing   │
//! └──────────────┘                  │                  │ completed    │
//!        │ insert pending           │                  │ failed       │
//!        ├──────────────────────────┼─────────────────▶└──────────────┘
//!        ▼                          ▼                         ▲
//! ┌──────────────┐           ┌──────────────┐                 │
//! │ Job          │──────────▶│ Detection    │─────────────────┘
//! │ dispatcher   │  inline / │ processor    │
//! └──────────────┘  queued   └──────────────┘
//!                                   │
//!                                   ▼
//!                            ┌──────────────┐
//!                            │ visualized/  │
//!                            └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod detection_store;
pub mod detector;
pub mod error;
pub mod file_store;
pub mod job_worker;

pub use api::{create_router, AppState, Pagination};
pub use config::{Config, ProcessingMode};
pub use detection_store::{
    Detection, DetectionPage, DetectionQuery, DetectionStatus, DetectionStore, SortField,
    SortOrder, StoreError,
};
pub use detector::{DetectionOutcome, DetectorError, PersonDetector, PlaceholderDetector};
pub use error::ApiError;
pub use file_store::FileStore;
pub use job_worker::{DetectionJob, DetectionProcessor, JobDispatcher, JobWorker};

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Connect the store, prepare the upload directories and build the handler
/// state. In queued mode the returned worker must be spawned by the caller.
pub async fn init_state(
    config: &Config,
    detector: Arc<dyn PersonDetector>,
    shutdown: CancellationToken,
) -> anyhow::Result<(AppState, Option<JobWorker>)> {
    let store = Arc::new(
        DetectionStore::new(&config.database)
            .await
            .context("Failed to initialize detection store")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    if config.processing.fail_unfinished_on_startup {
        let failed = store
            .fail_unfinished()
            .await
            .context("Failed to fail unfinished detection jobs")?;
        if failed > 0 {
            warn!(failed, "Marked jobs left unfinished by a previous run as failed");
        }
    }

    let files = Arc::new(
        FileStore::new(&config.uploads.root_dir)
            .await
            .context("Failed to initialize file store")?,
    );

    let processor = Arc::new(DetectionProcessor::new(store.clone(), files.clone(), detector));

    let (dispatcher, worker) = match config.processing.mode {
        ProcessingMode::Inline => (JobDispatcher::Inline(processor), None),
        ProcessingMode::Queued => {
            let (sender, receiver) = job_worker::job_queue(config.processing.queue_capacity);
            let worker = JobWorker::new(
                receiver,
                processor.clone(),
                config.processing.worker_concurrency,
                shutdown,
            );
            (JobDispatcher::Queued { sender, processor }, Some(worker))
        }
    };

    let state = AppState {
        store,
        files,
        dispatcher,
        pagination: Pagination::from(&config.api),
    };

    Ok((state, worker))
}
