// THEORY:
// The parallel pipeline produces the same `Explanation` as the sequential one
// but overlaps the black-box queries, which dominate the run time. Only the
// scoring loop is parallel. Segmentation, sampling and the surrogate fit stay
// sequential and are shared with `pipeline`. Segmentation is CPU-bound, so it
// runs on the blocking thread pool like the scorer calls.
//
// Shape of the pool:
//   • one dispatcher task hands scoring tasks to workers round-robin
//   • each worker runs its scorer call on the blocking thread pool, so a slow
//     model never stalls the async runtime
//   • every call may carry a deadline; expiry is a scoring failure
//   • results come back through a oneshot per task and are joined in sample
//     order, so the dataset is index-aligned no matter which worker finished
//     first
//
// The video and the masks are shared read-only behind `Arc`. Each worker
// perturbs its own copy. The first failure aborts the whole explanation and
// the pool is torn down with it; no partial result is returned.

use crate::core_modules::dataset::{cosine_distance, Dataset};
use crate::core_modules::mask_sampler::PerturbationMask;
use crate::core_modules::oracle::{perturb, score_video, OutputVector, Scorer};
use crate::core_modules::video_volume::VideoVolume;
use crate::error::{LimeError, Result};
use crate::pipeline::{finish, prepare, ExplainConfig, Explanation};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Scored output and its cosine distance to the unperturbed video.
pub type ScoredSample = (OutputVector, f64);

pub struct ScoringTask {
    /// `None` for the unperturbed baseline.
    pub sample: Option<usize>,
    pub mask: Option<Arc<PerturbationMask>>,
    pub expected_len: Option<usize>,
    pub result_sender: oneshot::Sender<Result<ScoredSample>>,
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<ScoringTask>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` workers on the current tokio runtime.
    pub fn new<S>(
        scorer: Arc<S>,
        video: Arc<VideoVolume>,
        worker_count: usize,
        timeout: Option<Duration>,
    ) -> Self
    where
        S: Scorer + Send + Sync + 'static,
    {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<ScoringTask>();
        let mut workers = Vec::with_capacity(worker_count + 1);

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<ScoringTask>())
            .unzip();

        // Dispatcher
        workers.push(tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        }));

        for (worker_id, mut worker_receiver) in worker_receivers.into_iter().enumerate() {
            let scorer = Arc::clone(&scorer);
            let video = Arc::clone(&video);
            workers.push(tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    let ScoringTask {
                        sample,
                        mask,
                        expected_len,
                        result_sender,
                    } = task;
                    let result = Self::score_worker(
                        Arc::clone(&scorer),
                        Arc::clone(&video),
                        sample,
                        mask,
                        expected_len,
                        timeout,
                    )
                    .await;
                    if let Ok((_, distance)) = &result {
                        debug!(worker = worker_id, ?sample, distance, "perturbation scored");
                    }
                    let _ = result_sender.send(result);
                }
            }));
        }

        Self {
            task_sender,
            workers,
        }
    }

    async fn score_worker<S>(
        scorer: Arc<S>,
        video: Arc<VideoVolume>,
        sample: Option<usize>,
        mask: Option<Arc<PerturbationMask>>,
        expected_len: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<ScoredSample>
    where
        S: Scorer + Send + Sync + 'static,
    {
        let job = tokio::task::spawn_blocking(move || -> Result<ScoredSample> {
            match mask.as_deref() {
                Some(mask) => {
                    let perturbed = perturb(&video, mask);
                    let output = score_video(scorer.as_ref(), &perturbed, sample, expected_len)?;
                    Ok((output, cosine_distance(perturbed.data(), video.data())))
                }
                None => Ok((score_video(scorer.as_ref(), &video, sample, expected_len)?, 0.0)),
            }
        });

        let joined = match timeout {
            Some(limit) => tokio::time::timeout(limit, job).await.map_err(|_| {
                LimeError::scoring(sample, format!("timed out after {} ms", limit.as_millis()))
            })?,
            None => job.await,
        };
        joined.map_err(|e| LimeError::scoring(sample, format!("scoring task failed: {e}")))?
    }

    /// Queues one scoring call and waits for its result.
    pub async fn score(
        &self,
        sample: Option<usize>,
        mask: Option<Arc<PerturbationMask>>,
        expected_len: Option<usize>,
    ) -> Result<ScoredSample> {
        let (result_sender, result_receiver) = oneshot::channel();

        let task = ScoringTask {
            sample,
            mask,
            expected_len,
            result_sender,
        };

        self.task_sender
            .send(task)
            .map_err(|_| LimeError::scoring(sample, "worker pool is shut down"))?;

        result_receiver
            .await
            .map_err(|_| LimeError::scoring(sample, "worker dropped the task"))?
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Queued tasks are discarded; a scorer call already running on the
        // blocking pool finishes on its own.
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// The async explainer. Scores perturbations concurrently.
pub struct ParallelExplainPipeline {
    config: ExplainConfig,
}

impl ParallelExplainPipeline {
    pub fn new(config: ExplainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExplainConfig {
        &self.config
    }

    pub async fn explain_instance<S>(
        &self,
        scorer: Arc<S>,
        video: Arc<VideoVolume>,
    ) -> Result<Explanation>
    where
        S: Scorer + Send + Sync + 'static,
    {
        let (labeling, masks) = {
            let config = self.config.clone();
            let video = Arc::clone(&video);
            tokio::task::spawn_blocking(move || prepare(&config, &video)).await??
        };
        let pool = WorkerPool::new(
            scorer,
            Arc::clone(&video),
            self.config.workers,
            self.config.score_timeout,
        );

        // Stage 3: Black-box queries, baseline first so its length is known.
        let (baseline, _) = pool.score(None, None, None).await?;
        let expected_len = Some(baseline.len());

        let (activations, masks): (Vec<_>, Vec<_>) = masks
            .into_iter()
            .map(|sample| (sample.activation, Arc::new(sample.mask)))
            .unzip();
        let scored = try_join_all(
            masks
                .into_iter()
                .enumerate()
                .map(|(index, mask)| pool.score(Some(index), Some(mask), expected_len)),
        )
        .await?;
        drop(pool);

        let (outputs, distances): (Vec<_>, Vec<_>) = scored.into_iter().unzip();
        let dataset = Dataset::from_parts(
            activations,
            outputs,
            distances,
            baseline,
            self.config.kernel_width,
        )?;
        info!(
            samples = dataset.len(),
            workers = self.config.workers,
            "perturbations scored"
        );

        finish(&self.config, labeling, dataset)
    }
}
