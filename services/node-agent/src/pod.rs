//! Pod and container descriptions consumed by the image puller.
//!
//! These are the fields of a pod specification that image acquisition needs:
//! pod identity (for event targets), each container's image and pull policy,
//! and the pull secrets handed to the runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::ImageName;

/// Rule governing whether an image fetch is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PullPolicy {
    /// Pull on every start.
    Always,

    /// Pull only when the image is missing.
    IfNotPresent,

    /// Never pull; the image must already be on the node.
    Never,
}

impl PullPolicy {
    /// Policy applied to a container that does not declare one.
    ///
    /// Floating references (no tag, or `latest`) are re-pulled so updates are
    /// picked up; pinned tags and digests are pulled once.
    pub fn default_for_image(image: &str) -> Self {
        match ImageName::parse(image) {
            Ok(name) if !name.is_floating() => PullPolicy::IfNotPresent,
            _ => PullPolicy::Always,
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        };
        f.write_str(s)
    }
}

/// Pod identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodMeta {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub uid: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A container declared in a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,

    pub image: String,

    /// Declared pull policy; see [`Container::pull_policy`] for the
    /// effective one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<PullPolicy>,
}

impl Container {
    /// Create a container with an explicit pull policy.
    pub fn new(name: impl Into<String>, image: impl Into<String>, policy: PullPolicy) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            image_pull_policy: Some(policy),
        }
    }

    /// The effective pull policy.
    pub fn pull_policy(&self) -> PullPolicy {
        self.image_pull_policy
            .unwrap_or_else(|| PullPolicy::default_for_image(&self.image))
    }
}

/// Registry credentials handed to the runtime.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSecret {
    pub name: String,
    pub registry: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PullSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullSecret")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Desired contents of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub containers: Vec<Container>,

    #[serde(default)]
    pub image_pull_secrets: Vec<PullSecret>,
}

/// A pod as seen by the node agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: PodMeta,
    pub spec: PodSpec,
}

impl Pod {
    /// `namespace/name`, for logs.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Look up a declared container by name.
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.spec.containers.iter().find(|c| c.name == name)
    }
}

/// Reasons an [`ObjectReference`] cannot be built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("pod has no name")]
    MissingPodName,

    #[error("pod {0} has no uid")]
    MissingPodUid(String),

    #[error("container {container:?} is not declared in pod {pod}")]
    UnknownContainer { pod: String, container: String },
}

/// Identifies the object an event is about: a container within a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub field_path: String,
}

impl ObjectReference {
    /// Reference to `container` within `pod`.
    pub fn for_container(pod: &Pod, container: &Container) -> Result<Self, ReferenceError> {
        if pod.metadata.name.is_empty() {
            return Err(ReferenceError::MissingPodName);
        }
        if pod.metadata.uid.is_empty() {
            return Err(ReferenceError::MissingPodUid(pod.full_name()));
        }
        if pod.container(&container.name).is_none() {
            return Err(ReferenceError::UnknownContainer {
                pod: pod.full_name(),
                container: container.name.clone(),
            });
        }

        Ok(Self {
            kind: "Pod".to_string(),
            namespace: pod.metadata.namespace.clone(),
            name: pod.metadata.name.clone(),
            uid: pod.metadata.uid.clone(),
            field_path: format!("spec.containers{{{}}}", container.name),
        })
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({})",
            self.kind, self.namespace, self.name, self.field_path
        )
    }
}
