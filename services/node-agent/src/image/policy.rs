//! Pull decisions.

use crate::pod::PullPolicy;

/// What to do about a container's image on this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// The image is on the node and the policy does not force a pull.
    SkipPresent,

    /// The policy forbids pulling.
    SkipNeverPolicy,

    /// The image has to be fetched.
    PullRequired,
}

impl PullDecision {
    /// Decide from the pull policy and whether the image is present.
    pub fn decide(policy: PullPolicy, present: bool) -> Self {
        match policy {
            PullPolicy::Never => PullDecision::SkipNeverPolicy,
            PullPolicy::Always => PullDecision::PullRequired,
            PullPolicy::IfNotPresent if present => PullDecision::SkipPresent,
            PullPolicy::IfNotPresent => PullDecision::PullRequired,
        }
    }
}

/// Terminal result of one pull attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The image was already on the node.
    AlreadyPresent,

    /// A recent failure is still being waited out; nothing was attempted.
    BackedOff,

    /// The image was fetched.
    Pulled,

    /// The runtime could not report presence.
    InspectFailed,

    /// The runtime failed to fetch the image.
    PullFailed,

    /// The image is missing and the policy forbids pulling it.
    NeverPullDenied,
}

impl PullOutcome {
    /// Returns true if the container can proceed with its image.
    pub fn is_success(self) -> bool {
        matches!(self, PullOutcome::AlreadyPresent | PullOutcome::Pulled)
    }

    /// Stable name used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            PullOutcome::AlreadyPresent => "already_present",
            PullOutcome::BackedOff => "backed_off",
            PullOutcome::Pulled => "pulled",
            PullOutcome::InspectFailed => "inspect_failed",
            PullOutcome::PullFailed => "pull_failed",
            PullOutcome::NeverPullDenied => "never_pull_denied",
        }
    }
}

impl std::fmt::Display for PullOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
