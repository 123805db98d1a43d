//! Run-once mode: acquire the images of a fixed set of pods, then exit.
//!
//! Instead of a continuous sync loop, each pod is driven until every
//! container's image is available, retrying failed passes with a growing
//! delay. Registry back-off still applies: a retry that lands inside an
//! image's back-off window is refused by the puller and counts as an
//! attempt.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::image::{ImagePullError, ImagePuller};
use crate::pod::Pod;

/// Default number of passes per pod.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default delay before the second pass.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Run-once configuration.
#[derive(Debug, Clone)]
pub struct RunOnceConfig {
    /// Passes per pod before giving up. Zero is treated as one.
    pub max_retries: u32,

    /// Delay before the second pass.
    pub retry_delay: Duration,

    /// Multiplier applied to the delay after each pass.
    pub retry_backoff_factor: u32,
}

impl Default for RunOnceConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_backoff_factor: 2,
        }
    }
}

/// Why a pod did not get its images.
#[derive(Debug, Error)]
pub enum RunOnceError {
    /// A container's image can never be acquired on this node.
    #[error("container {container:?}: {source}")]
    Denied {
        container: String,
        #[source]
        source: ImagePullError,
    },

    /// Every pass failed.
    #[error("gave up after {attempts} attempts, container {container:?}: {source}")]
    RetriesExhausted {
        attempts: u32,
        container: String,
        #[source]
        source: ImagePullError,
    },
}

/// Result for one pod.
#[derive(Debug)]
pub struct RunPodResult {
    pub pod: Pod,
    pub result: Result<(), RunOnceError>,
}

impl RunPodResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Drives a fixed set of pods through image acquisition once.
pub struct RunOnce {
    puller: Arc<ImagePuller>,
    config: RunOnceConfig,
}

impl RunOnce {
    pub fn new(puller: Arc<ImagePuller>, config: RunOnceConfig) -> Self {
        Self { puller, config }
    }

    /// Acquire images for every pod. Pods are driven concurrently; results
    /// come back in input order.
    pub async fn run(&self, pods: &[Pod]) -> Vec<RunPodResult> {
        info!(pods = pods.len(), "Running pods once");

        let results = join_all(pods.iter().map(|pod| self.run_pod(pod))).await;

        pods.iter()
            .cloned()
            .zip(results)
            .map(|(pod, result)| RunPodResult { pod, result })
            .collect()
    }

    async fn run_pod(&self, pod: &Pod) -> Result<(), RunOnceError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut delay = self.config.retry_delay;
        let mut attempt = 1;

        loop {
            let (container, err) = match self.pull_all(pod).await {
                Ok(()) => {
                    info!(pod = %pod.full_name(), attempt, "Pod images ready");
                    return Ok(());
                }
                Err(failure) => failure,
            };

            if !is_retryable(&err) {
                warn!(
                    pod = %pod.full_name(),
                    container = %container,
                    error = %err,
                    "Pod image cannot be acquired"
                );
                return Err(RunOnceError::Denied {
                    container,
                    source: err,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    pod = %pod.full_name(),
                    attempts = attempt,
                    error = %err,
                    "Giving up on pod"
                );
                return Err(RunOnceError::RetriesExhausted {
                    attempts: attempt,
                    container,
                    source: err,
                });
            }

            debug!(
                pod = %pod.full_name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Pod images not ready, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(self.config.retry_backoff_factor.max(1));
            attempt += 1;
        }
    }

    /// One pass over the pod's containers, stopping at the first failure.
    async fn pull_all(&self, pod: &Pod) -> Result<(), (String, ImagePullError)> {
        for container in &pod.spec.containers {
            self.puller
                .pull(pod, container, &pod.spec.image_pull_secrets)
                .await
                .map_err(|e| (container.name.clone(), e))?;
        }
        Ok(())
    }
}

fn is_retryable(err: &ImagePullError) -> bool {
    !matches!(err, ImagePullError::NeverPullDenied { .. })
}
