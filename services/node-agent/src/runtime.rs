//! Container runtime image interface and mock implementation.
//!
//! The image puller only needs two things from the runtime: whether an
//! image is already on the node, and a way to fetch it. Both calls may block
//! on I/O; cancellation is done by dropping the future.
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::pod::PullSecret;

/// The image a runtime call is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageSpec {
    pub image: String,
}

impl ImageSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.image)
    }
}

/// Errors reported by the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime or registry could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The registry does not know the image.
    #[error("image not found: {0}")]
    NotFound(String),

    /// The registry rejected the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Image operations of a container runtime.
#[async_trait]
pub trait ImageRuntime: Send + Sync {
    /// Check whether the image is present on the node.
    async fn is_image_present(&self, image: &ImageSpec) -> Result<bool, RuntimeError>;

    /// Fetch the image from its registry.
    async fn pull_image(&self, image: &ImageSpec, secrets: &[PullSecret]) -> Result<(), RuntimeError>;
}

#[derive(Debug, Default)]
struct MockState {
    present: HashSet<String>,
    failing_pulls: HashSet<String>,
    failing_inspects: HashSet<String>,
    pull_calls: HashMap<String, usize>,
    inspect_calls: usize,
}

/// Mock runtime for testing and development.
///
/// Images are absent unless marked present. A successful pull makes the
/// image present.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Create a mock runtime with no images.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock runtime with `images` already present.
    pub fn with_images<I, S>(images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let runtime = Self::new();
        for image in images {
            runtime.add_image(image);
        }
        runtime
    }

    /// Mark an image as present.
    pub fn add_image(&self, image: impl Into<String>) {
        self.lock().present.insert(image.into());
    }

    /// Mark an image as absent.
    pub fn remove_image(&self, image: &str) {
        self.lock().present.remove(image);
    }

    /// Make pulls of `image` fail (or succeed again).
    pub fn set_pull_failing(&self, image: impl Into<String>, failing: bool) {
        let image = image.into();
        let mut state = self.lock();
        if failing {
            state.failing_pulls.insert(image);
        } else {
            state.failing_pulls.remove(&image);
        }
    }

    /// Make presence checks of `image` fail (or succeed again).
    pub fn set_inspect_failing(&self, image: impl Into<String>, failing: bool) {
        let image = image.into();
        let mut state = self.lock();
        if failing {
            state.failing_inspects.insert(image);
        } else {
            state.failing_inspects.remove(&image);
        }
    }

    /// Number of pull attempts made for `image`.
    pub fn pull_count(&self, image: &str) -> usize {
        self.lock().pull_calls.get(image).copied().unwrap_or(0)
    }

    /// Number of pull attempts across all images.
    pub fn total_pulls(&self) -> usize {
        self.lock().pull_calls.values().sum()
    }

    /// Number of presence checks made.
    pub fn inspect_count(&self) -> usize {
        self.lock().inspect_calls
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ImageRuntime for MockRuntime {
    async fn is_image_present(&self, image: &ImageSpec) -> Result<bool, RuntimeError> {
        let mut state = self.lock();
        state.inspect_calls += 1;

        if state.failing_inspects.contains(&image.image) {
            return Err(RuntimeError::Unavailable(
                "mock runtime configured to fail inspect".to_string(),
            ));
        }

        let present = state.present.contains(&image.image);
        debug!(image = %image, present, "[MOCK] Inspected image");
        Ok(present)
    }

    async fn pull_image(&self, image: &ImageSpec, secrets: &[PullSecret]) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        *state.pull_calls.entry(image.image.clone()).or_insert(0) += 1;

        if state.failing_pulls.contains(&image.image) {
            return Err(RuntimeError::Unavailable(format!(
                "mock registry refused {}",
                image.image
            )));
        }

        info!(image = %image, secrets = secrets.len(), "[MOCK] Pulled image");
        state.present.insert(image.image.clone());
        Ok(())
    }
}
