use crate::detection_store::{
    Detection, DetectionResult, DetectionStatus, DetectionStore, StoreError, StoreResult,
};
use crate::detector::PersonDetector;
use crate::file_store::FileStore;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A stored upload waiting for detection
#[derive(Debug, Clone)]
pub struct DetectionJob {
    pub detection_id: i64,
    /// Generated file name shared by the original and its visualization
    pub file_name: String,
    pub original_path: PathBuf,
    /// Time spent writing the original during ingestion
    pub upload_elapsed: Duration,
}

/// Errors raised while handing a job to the processor
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("detection queue is full")]
    QueueFull,

    #[error("detection queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs detection jobs through the pending → processing → completed/failed
/// state machine
pub struct DetectionProcessor {
    store: Arc<DetectionStore>,
    files: Arc<FileStore>,
    detector: Arc<dyn PersonDetector>,
}

impl DetectionProcessor {
    pub fn new(
        store: Arc<DetectionStore>,
        files: Arc<FileStore>,
        detector: Arc<dyn PersonDetector>,
    ) -> Self {
        Self {
            store,
            files,
            detector,
        }
    }

    /// Process one job and return the final record.
    ///
    /// Detector and file failures end in `failed`; only store errors are
    /// returned as errors. `processing_time` covers writing the original
    /// plus the detection step.
    #[instrument(skip(self, job), fields(detection_id = job.detection_id))]
    pub async fn process(&self, job: &DetectionJob) -> StoreResult<Detection> {
        self.store
            .transition(
                job.detection_id,
                DetectionStatus::Pending,
                DetectionStatus::Processing,
            )
            .await?;

        let started = Instant::now();

        match self.run_detection(job).await {
            Ok((number_of_persons, visualized_path)) => {
                let result = DetectionResult {
                    number_of_persons,
                    visualized_image_path: visualized_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    processing_time_ms: (job.upload_elapsed + started.elapsed()).as_millis()
                        as i64,
                };

                let detection = match self.store.complete(job.detection_id, &result).await {
                    Ok(detection) => detection,
                    Err(e) => {
                        self.abandon(job, visualized_path.as_deref()).await;
                        return Err(e);
                    }
                };

                info!(
                    number_of_persons,
                    processing_time_ms = result.processing_time_ms,
                    "Detection completed"
                );
                metrics::counter!("detector.jobs.completed").increment(1);

                Ok(detection)
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Detection failed");
                metrics::counter!("detector.jobs.failed").increment(1);

                self.store
                    .transition(
                        job.detection_id,
                        DetectionStatus::Processing,
                        DetectionStatus::Failed,
                    )
                    .await
            }
        }
    }

    async fn run_detection(&self, job: &DetectionJob) -> anyhow::Result<(i64, Option<PathBuf>)> {
        let image = self
            .files
            .read(&job.original_path)
            .await
            .context("Failed to read original image")?;

        let outcome = self
            .detector
            .detect(&image)
            .await
            .context("Detector error")?;

        let visualized_path = match outcome.visualization {
            Some(bytes) => Some(
                self.files
                    .store_visualization(&job.file_name, &bytes)
                    .await
                    .context("Failed to write visualization")?,
            ),
            None => None,
        };

        Ok((outcome.person_count, visualized_path))
    }

    /// Undo a job whose results could not be recorded
    async fn abandon(&self, job: &DetectionJob, visualized_path: Option<&Path>) {
        metrics::counter!("detector.jobs.failed").increment(1);

        if let Some(path) = visualized_path {
            self.files.remove(path).await;
        }

        if let Err(e) = self
            .store
            .transition(
                job.detection_id,
                DetectionStatus::Processing,
                DetectionStatus::Failed,
            )
            .await
        {
            warn!(
                error = %e,
                detection_id = job.detection_id,
                "Could not mark abandoned job failed"
            );
        }
    }

    /// Fail a job that never reached the processor
    pub async fn reject(&self, detection_id: i64) -> StoreResult<Detection> {
        metrics::counter!("detector.jobs.failed").increment(1);
        self.store
            .transition(detection_id, DetectionStatus::Pending, DetectionStatus::Failed)
            .await
    }
}

/// Create the bounded job queue used in queued mode
pub fn job_queue(capacity: usize) -> (mpsc::Sender<DetectionJob>, mpsc::Receiver<DetectionJob>) {
    mpsc::channel(capacity.max(1))
}

/// Routes new jobs either straight to the processor or onto the queue
#[derive(Clone)]
pub enum JobDispatcher {
    Inline(Arc<DetectionProcessor>),
    Queued {
        sender: mpsc::Sender<DetectionJob>,
        processor: Arc<DetectionProcessor>,
    },
}

impl JobDispatcher {
    /// Hand over a job.
    ///
    /// Inline dispatch returns the processed record; queued dispatch returns
    /// `None` once the job is enqueued.
    pub async fn dispatch(&self, job: DetectionJob) -> Result<Option<Detection>, DispatchError> {
        match self {
            JobDispatcher::Inline(processor) => Ok(Some(processor.process(&job).await?)),
            JobDispatcher::Queued { sender, processor } => {
                let detection_id = job.detection_id;

                match sender.try_send(job) {
                    Ok(()) => {
                        debug!(detection_id, "Detection job enqueued");
                        metrics::counter!("detector.jobs.enqueued").increment(1);
                        Ok(None)
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(detection_id, "Detection queue full");
                        processor.reject(detection_id).await?;
                        Err(DispatchError::QueueFull)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(detection_id, "Detection queue closed");
                        processor.reject(detection_id).await?;
                        Err(DispatchError::QueueClosed)
                    }
                }
            }
        }
    }
}

/// Background worker consuming queued detection jobs
pub struct JobWorker {
    receiver: mpsc::Receiver<DetectionJob>,
    processor: Arc<DetectionProcessor>,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl JobWorker {
    pub fn new(
        receiver: mpsc::Receiver<DetectionJob>,
        processor: Arc<DetectionProcessor>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let concurrency = concurrency.max(1);

        Self {
            receiver,
            processor,
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            shutdown,
        }
    }

    /// Consume jobs until shutdown is requested or every sender is gone,
    /// then wait for in-flight jobs to finish
    #[instrument(skip(self))]
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(concurrency = self.concurrency, "Starting detection worker");

        loop {
            let job = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                job = self.receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Worker semaphore closed")?;
            let processor = self.processor.clone();

            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = processor.process(&job).await {
                    error!(
                        error = %e,
                        detection_id = job.detection_id,
                        "Failed to process detection job"
                    );
                }
            });
        }

        // Jobs still buffered were accepted but will never run
        self.receiver.close();
        let mut rejected = 0usize;
        while let Some(job) = self.receiver.recv().await {
            match self.processor.reject(job.detection_id).await {
                Ok(_) => rejected += 1,
                Err(e) => warn!(
                    error = %e,
                    detection_id = job.detection_id,
                    "Failed to reject queued job"
                ),
            }
        }
        if rejected > 0 {
            warn!(rejected, "Rejected queued jobs at shutdown");
        }

        // Every permit back means every spawned job has finished
        let _drained = self
            .semaphore
            .acquire_many(self.concurrency as u32)
            .await
            .context("Worker semaphore closed")?;

        info!("Detection worker stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::detection_store::NewDetection;
    use crate::detector::{DetectionOutcome, DetectorError, MockPersonDetector, PlaceholderDetector};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<DetectionStore>,
        files: Arc<FileStore>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}?mode=rwc", dir.path().join("detections.db").display()),
            ..Default::default()
        };

        let store = DetectionStore::new(&config).await.unwrap();
        store.run_migrations().await.unwrap();
        let files = FileStore::new(dir.path().join("uploads")).await.unwrap();

        Fixture {
            _dir: dir,
            store: Arc::new(store),
            files: Arc::new(files),
        }
    }

    async fn pending_job(fx: &Fixture, bytes: &[u8]) -> DetectionJob {
        let upload = fx.files.store_original("people.jpg", bytes).await.unwrap();
        let detection = fx
            .store
            .insert(&NewDetection {
                original_image_path: upload.original_path.to_string_lossy().into_owned(),
                author_name: "Test Author".to_string(),
                author_email: None,
                title: Some("people.jpg".to_string()),
                description: None,
            })
            .await
            .unwrap();
        assert_eq!(detection.status, DetectionStatus::Pending);

        DetectionJob {
            detection_id: detection.id,
            file_name: upload.file_name,
            original_path: upload.original_path,
            upload_elapsed: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_process_records_detector_results() {
        let fx = fixture().await;
        let job = pending_job(&fx, b"fake image content").await;

        let mut detector = MockPersonDetector::new();
        detector.expect_detect().times(1).returning(|image| {
            Ok(DetectionOutcome {
                person_count: 3,
                visualization: Some(image.to_vec()),
            })
        });

        let processor = DetectionProcessor::new(fx.store.clone(), fx.files.clone(), Arc::new(detector));
        let detection = processor.process(&job).await.unwrap();

        assert_eq!(detection.status, DetectionStatus::Completed);
        assert_eq!(detection.number_of_persons, Some(3));
        // Includes the time spent writing the original
        assert!(detection.processing_time.unwrap() >= 5);
        assert!(detection.created_at <= detection.updated_at);

        let visualized = PathBuf::from(detection.visualized_image_path.unwrap());
        assert_eq!(visualized, fx.files.visualized_dir().join(&job.file_name));
        assert_eq!(std::fs::read(visualized).unwrap(), b"fake image content");
    }

    #[tokio::test]
    async fn test_detector_failure_marks_job_failed() {
        let fx = fixture().await;
        let job = pending_job(&fx, b"fake image content").await;

        let mut detector = MockPersonDetector::new();
        detector
            .expect_detect()
            .returning(|_| Err(DetectorError::Failed("model unavailable".to_string())));

        let processor = DetectionProcessor::new(fx.store.clone(), fx.files.clone(), Arc::new(detector));
        let detection = processor.process(&job).await.unwrap();

        assert_eq!(detection.status, DetectionStatus::Failed);
        assert_eq!(detection.number_of_persons, None);
        assert_eq!(detection.visualized_image_path, None);
    }

    #[tokio::test]
    async fn test_job_cannot_be_processed_twice() {
        let fx = fixture().await;
        let job = pending_job(&fx, b"fake image content").await;
        let processor = DetectionProcessor::new(
            fx.store.clone(),
            fx.files.clone(),
            Arc::new(PlaceholderDetector),
        );

        processor.process(&job).await.unwrap();
        let second = processor.process(&job).await;

        assert!(matches!(
            second,
            Err(StoreError::InvalidTransition {
                from: DetectionStatus::Pending,
                to: DetectionStatus::Processing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_job() {
        let fx = fixture().await;
        let processor = Arc::new(DetectionProcessor::new(
            fx.store.clone(),
            fx.files.clone(),
            Arc::new(PlaceholderDetector),
        ));
        let (sender, _receiver) = job_queue(1);
        let dispatcher = JobDispatcher::Queued { sender, processor };

        let first = pending_job(&fx, b"one").await;
        let second = pending_job(&fx, b"two").await;
        let second_id = second.detection_id;

        assert!(dispatcher.dispatch(first).await.unwrap().is_none());
        assert!(matches!(
            dispatcher.dispatch(second).await,
            Err(DispatchError::QueueFull)
        ));

        let rejected = fx.store.get(second_id).await.unwrap().unwrap();
        assert_eq!(rejected.status, DetectionStatus::Failed);
    }

    #[tokio::test]
    async fn test_worker_completes_queued_jobs() {
        let fx = fixture().await;
        let processor = Arc::new(DetectionProcessor::new(
            fx.store.clone(),
            fx.files.clone(),
            Arc::new(PlaceholderDetector),
        ));
        let (sender, receiver) = job_queue(8);
        let dispatcher = JobDispatcher::Queued {
            sender,
            processor: processor.clone(),
        };

        let mut ids = Vec::new();
        for payload in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            let job = pending_job(&fx, payload).await;
            ids.push(job.detection_id);
            dispatcher.dispatch(job).await.unwrap();
        }
        // Closing the queue lets the worker exit after draining it
        drop(dispatcher);

        let worker = JobWorker::new(receiver, processor, 2, CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(10), worker.run())
            .await
            .unwrap()
            .unwrap();

        for id in ids {
            let detection = fx.store.get(id).await.unwrap().unwrap();
            assert_eq!(detection.status, DetectionStatus::Completed);
            assert_eq!(detection.number_of_persons, Some(1));
        }
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let fx = fixture().await;
        let processor = Arc::new(DetectionProcessor::new(
            fx.store.clone(),
            fx.files.clone(),
            Arc::new(PlaceholderDetector),
        ));
        let (_sender, receiver) = job_queue(8);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(JobWorker::new(receiver, processor, 2, shutdown.clone()).run());
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_buffered_jobs() {
        let fx = fixture().await;
        let processor = Arc::new(DetectionProcessor::new(
            fx.store.clone(),
            fx.files.clone(),
            Arc::new(PlaceholderDetector),
        ));
        let (sender, receiver) = job_queue(8);
        let dispatcher = JobDispatcher::Queued {
            sender,
            processor: processor.clone(),
        };

        let mut ids = Vec::new();
        for payload in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            let job = pending_job(&fx, payload).await;
            ids.push(job.detection_id);
            dispatcher.dispatch(job).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let worker = JobWorker::new(receiver, processor, 2, shutdown);
        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .unwrap()
            .unwrap();

        for id in ids {
            let detection = fx.store.get(id).await.unwrap().unwrap();
            assert_eq!(detection.status, DetectionStatus::Failed);
        }

        // The queue stays closed for late dispatches
        let late = pending_job(&fx, b"late").await;
        let late_id = late.detection_id;
        assert!(matches!(
            dispatcher.dispatch(late).await,
            Err(DispatchError::QueueClosed)
        ));
        let late = fx.store.get(late_id).await.unwrap().unwrap();
        assert_eq!(late.status, DetectionStatus::Failed);
    }

    /// Fails the record while detection is running so completing it is refused
    struct FailingMidwayDetector {
        store: Arc<DetectionStore>,
        detection_id: i64,
    }

    #[async_trait::async_trait]
    impl PersonDetector for FailingMidwayDetector {
        async fn detect(&self, image: &[u8]) -> Result<DetectionOutcome, DetectorError> {
            self.store
                .transition(
                    self.detection_id,
                    DetectionStatus::Processing,
                    DetectionStatus::Failed,
                )
                .await
                .map_err(|e| DetectorError::Failed(e.to_string()))?;

            Ok(DetectionOutcome {
                person_count: 1,
                visualization: Some(image.to_vec()),
            })
        }
    }

    #[tokio::test]
    async fn test_unrecorded_result_removes_visualization() {
        let fx = fixture().await;
        let job = pending_job(&fx, b"fake image content").await;
        let detector = FailingMidwayDetector {
            store: fx.store.clone(),
            detection_id: job.detection_id,
        };

        let processor = DetectionProcessor::new(fx.store.clone(), fx.files.clone(), Arc::new(detector));
        let result = processor.process(&job).await;

        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                from: DetectionStatus::Processing,
                to: DetectionStatus::Completed,
                ..
            })
        ));
        assert!(!fx.files.visualized_dir().join(&job.file_name).exists());

        let detection = fx.store.get(job.detection_id).await.unwrap().unwrap();
        assert_eq!(detection.status, DetectionStatus::Failed);
        assert_eq!(detection.visualized_image_path, None);
    }

    #[tokio::test]
    async fn test_fail_unfinished_leaves_finished_jobs_alone() {
        let fx = fixture().await;
        let processor = DetectionProcessor::new(
            fx.store.clone(),
            fx.files.clone(),
            Arc::new(PlaceholderDetector),
        );

        let done = pending_job(&fx, b"done").await;
        processor.process(&done).await.unwrap();
        let waiting = pending_job(&fx, b"waiting").await;
        let running = pending_job(&fx, b"running").await;
        fx.store
            .transition(
                running.detection_id,
                DetectionStatus::Pending,
                DetectionStatus::Processing,
            )
            .await
            .unwrap();

        assert_eq!(fx.store.fail_unfinished().await.unwrap(), 2);

        let status = |id| {
            let store = fx.store.clone();
            async move { store.get(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(done.detection_id).await, DetectionStatus::Completed);
        assert_eq!(status(waiting.detection_id).await, DetectionStatus::Failed);
        assert_eq!(status(running.detection_id).await, DetectionStatus::Failed);
    }
}
