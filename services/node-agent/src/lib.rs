//! podlet Node Agent Library
//!
//! Image acquisition for the node agent: before a container starts, decide
//! whether its image must be fetched, fetch it without hammering a failing
//! registry, and report what happened as events on the container.
//!
//! ## Architecture
//!
//! ```text
//! caller (sync loop / RunOnce)
//! └── ImagePuller              (policy, back-off gate, pull events)
//!     ├── Backoff              (per-image exponential back-off, podlet-backoff)
//!     ├── ImageRuntime         (presence check and pull)
//!     └── EventRecorder        (fire-and-forget events)
//! ```
//!
//! ## Modules
//!
//! - `image`: pull decisions, the image puller, image reference parsing
//! - `pod`: pod and container descriptions, event object references
//! - `events`: event recorders
//! - `runtime`: container runtime image interface and mock
//! - `runonce`: drive a fixed set of pods through image acquisition once

pub mod config;
pub mod events;
pub mod image;
pub mod pod;
pub mod runonce;
pub mod runtime;

// Re-export commonly used types
pub use events::{EventRecorder, FakeRecorder, TracingRecorder};
pub use image::{ImagePullError, ImagePuller, ImagePullerConfig, PullDecision, PullOutcome};
pub use pod::{Container, Pod, PullPolicy, PullSecret};
pub use runtime::{ImageRuntime, MockRuntime};
