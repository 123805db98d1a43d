//! Container image acquisition.
//!
//! This module handles:
//! - Deciding from pull policy and presence whether an image must be pulled
//! - Pulling through the container runtime
//! - Backing off images whose pulls keep failing
//! - Reporting each outcome as an event on the container

mod policy;
mod puller;
mod reference;

pub use policy::{PullDecision, PullOutcome};
pub use puller::{ImagePullError, ImagePuller, ImagePullerConfig};
pub use reference::{ImageName, InvalidImageRef, DEFAULT_REGISTRY, DEFAULT_TAG};
