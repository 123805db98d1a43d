//! Image puller: presence check, pull policy, registry back-off, pull events.
//!
//! The puller is called once per container per reconciliation pass. Each
//! call is terminal: it never retries internally. A failed pull puts the
//! image into back-off, and later passes are refused without touching the
//! registry until the back-off delay has elapsed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use podlet_backoff::{Backoff, BackoffConfig, BackoffConfigError, Clock, SystemClock};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::policy::{PullDecision, PullOutcome};
use super::reference::ImageName;
use crate::events::{reason, EventRecorder, EventTarget};
use crate::pod::{Container, ObjectReference, Pod, PullPolicy, PullSecret};
use crate::runtime::{ImageRuntime, ImageSpec, RuntimeError};

/// Errors from image pulling.
#[derive(Debug, Error)]
pub enum ImagePullError {
    /// The runtime could not report whether the image is present.
    #[error("failed to inspect image {image:?}: {source}")]
    InspectFailed {
        image: String,
        #[source]
        source: RuntimeError,
    },

    /// The image is missing and the pull policy is `Never`.
    #[error("container image {image:?} is not present with pull policy of Never")]
    NeverPullDenied { image: String },

    /// The image failed recently and is waiting out its back-off delay.
    #[error("back-off pulling image {image:?}, retry in {retry_in:?}")]
    BackedOff { image: String, retry_in: Duration },

    /// The runtime failed to fetch the image.
    #[error("failed to pull image {image:?}: {source}")]
    PullFailed {
        image: String,
        #[source]
        source: RuntimeError,
    },
}

impl ImagePullError {
    /// The outcome this error reports.
    pub fn outcome(&self) -> PullOutcome {
        match self {
            ImagePullError::InspectFailed { .. } => PullOutcome::InspectFailed,
            ImagePullError::NeverPullDenied { .. } => PullOutcome::NeverPullDenied,
            ImagePullError::BackedOff { .. } => PullOutcome::BackedOff,
            ImagePullError::PullFailed { .. } => PullOutcome::PullFailed,
        }
    }

    /// Returns true for the waiting state, as opposed to a failure.
    pub fn is_backoff(&self) -> bool {
        matches!(self, ImagePullError::BackedOff { .. })
    }

    /// The image the error is about.
    pub fn image(&self) -> &str {
        match self {
            ImagePullError::InspectFailed { image, .. }
            | ImagePullError::NeverPullDenied { image }
            | ImagePullError::BackedOff { image, .. }
            | ImagePullError::PullFailed { image, .. } => image,
        }
    }
}

/// Configuration for the image puller.
#[derive(Debug, Clone, Default)]
pub struct ImagePullerConfig {
    /// Back-off applied to images whose pulls fail.
    pub backoff: BackoffConfig,
}

/// Ensures container images are on the node before containers start.
pub struct ImagePuller {
    runtime: Arc<dyn ImageRuntime>,
    recorder: Arc<dyn EventRecorder>,
    /// Failed pulls keyed by image reference.
    backoff: Backoff,
}

impl ImagePuller {
    /// Create a new image puller.
    pub fn new(
        config: ImagePullerConfig,
        runtime: Arc<dyn ImageRuntime>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Result<Self, BackoffConfigError> {
        Self::with_clock(config, runtime, recorder, Arc::new(SystemClock))
    }

    /// Create a new image puller whose back-off reads `clock`.
    pub fn with_clock(
        config: ImagePullerConfig,
        runtime: Arc<dyn ImageRuntime>,
        recorder: Arc<dyn EventRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BackoffConfigError> {
        Ok(Self {
            runtime,
            recorder,
            backoff: Backoff::with_clock(config.backoff, clock)?,
        })
    }

    /// The back-off state for failed pulls.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Make sure the image of `container` is available on the node.
    ///
    /// Returns [`PullOutcome::AlreadyPresent`] or [`PullOutcome::Pulled`] on
    /// success. Every failure is also recorded as an event on the container
    /// when a reference to it can be built.
    pub async fn pull(
        &self,
        pod: &Pod,
        container: &Container,
        secrets: &[PullSecret],
    ) -> Result<PullOutcome, ImagePullError> {
        let image = container.image.as_str();
        let pod_name = pod.full_name();

        let object = match ObjectReference::for_container(pod, container) {
            Ok(object) => Some(object),
            Err(e) => {
                warn!(
                    pod = %pod_name,
                    container = %container.name,
                    error = %e,
                    "Couldn't make a reference to container, pull events will be dropped"
                );
                None
            }
        };
        let events = EventTarget::new(self.recorder.as_ref(), object);

        let spec = ImageSpec::new(image);
        let present = match self.runtime.is_image_present(&spec).await {
            Ok(present) => present,
            Err(source) => {
                warn!(
                    pod = %pod_name,
                    container = %container.name,
                    image = %image,
                    error = %source,
                    outcome = %PullOutcome::InspectFailed,
                    "Failed to inspect image"
                );
                events.warning(
                    reason::INSPECT_FAILED,
                    format!("Failed to inspect image {image:?}: {source}"),
                );
                return Err(ImagePullError::InspectFailed {
                    image: image.to_string(),
                    source,
                });
            }
        };

        let policy = container.pull_policy();
        match PullDecision::decide(policy, present) {
            PullDecision::PullRequired => {}
            PullDecision::SkipPresent => {
                return Ok(self.already_present(&events, &pod_name, container, policy));
            }
            PullDecision::SkipNeverPolicy if present => {
                return Ok(self.already_present(&events, &pod_name, container, policy));
            }
            PullDecision::SkipNeverPolicy => {
                warn!(
                    pod = %pod_name,
                    container = %container.name,
                    image = %image,
                    outcome = %PullOutcome::NeverPullDenied,
                    "Image missing and pull policy is Never"
                );
                events.warning(
                    reason::ERR_IMAGE_NEVER_PULL,
                    format!(
                        "Container image {image:?} is not present with pull policy of Never"
                    ),
                );
                return Err(ImagePullError::NeverPullDenied {
                    image: image.to_string(),
                });
            }
        }

        let name = ImageName::parse(image);
        if let Err(e) = &name {
            debug!(image = %image, error = %e, "Image reference did not parse");
        }
        let registry = name.as_ref().map_or("", |n| n.registry.as_str());
        let repository = name.as_ref().map_or(image, |n| n.repository.as_str());
        let reference = name.as_ref().map_or("", |n| n.reference());

        let now = self.backoff.now();
        if self.backoff.is_in_backoff(image, now) {
            let retry_in = self.backoff.remaining(image, now).unwrap_or_default();
            warn!(
                pod = %pod_name,
                container = %container.name,
                image = %image,
                retry_in_secs = retry_in.as_secs_f64(),
                outcome = %PullOutcome::BackedOff,
                "Image pull backed off"
            );
            events.warning(
                reason::BACK_OFF,
                format!("Back-off pulling image {image:?}"),
            );
            return Err(ImagePullError::BackedOff {
                image: image.to_string(),
                retry_in,
            });
        }

        info!(
            pod = %pod_name,
            container = %container.name,
            image = %image,
            registry,
            repository,
            reference,
            policy = %policy,
            "Pulling image"
        );
        events.normal(reason::PULLING, format!("Pulling image {image:?}"));

        let started = Instant::now();
        match self.runtime.pull_image(&spec, secrets).await {
            Ok(()) => {
                self.backoff.reset(image);
                let collected = self.backoff.gc_now();
                info!(
                    pod = %pod_name,
                    container = %container.name,
                    image = %image,
                    registry,
                    repository,
                    reference,
                    duration_ms = started.elapsed().as_millis() as u64,
                    collected,
                    outcome = %PullOutcome::Pulled,
                    "Image pulled"
                );
                events.normal(
                    reason::PULLED,
                    format!("Successfully pulled image {image:?}"),
                );
                Ok(PullOutcome::Pulled)
            }
            Err(source) => {
                let delay = self.backoff.record_failure_now(image);
                warn!(
                    pod = %pod_name,
                    container = %container.name,
                    image = %image,
                    registry,
                    repository,
                    reference,
                    error = %source,
                    delay_secs = delay.as_secs_f64(),
                    outcome = %PullOutcome::PullFailed,
                    "Image pull failed"
                );
                events.warning(
                    reason::FAILED,
                    format!("Failed to pull image {image:?}: {source}"),
                );
                Err(ImagePullError::PullFailed {
                    image: image.to_string(),
                    source,
                })
            }
        }
    }

    /// Report an image that is already on the node.
    fn already_present(
        &self,
        events: &EventTarget<'_>,
        pod_name: &str,
        container: &Container,
        policy: PullPolicy,
    ) -> PullOutcome {
        let image = container.image.as_str();
        debug!(
            pod = %pod_name,
            container = %container.name,
            image = %image,
            policy = %policy,
            outcome = %PullOutcome::AlreadyPresent,
            "Image already present"
        );
        events.normal(
            reason::PULLED,
            format!("Container image {image:?} already present on machine"),
        );
        PullOutcome::AlreadyPresent
    }
}
