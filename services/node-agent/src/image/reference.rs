//! Image reference parsing.

use std::fmt;

use thiserror::Error;

/// Registry used for references that do not name one.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Tag implied by references that carry neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// A reference that could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid image reference {0:?}")]
pub struct InvalidImageRef(pub String);

/// The components of an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Registry hostname, with port if one was given.
    pub registry: String,

    /// Repository path within the registry.
    pub repository: String,

    /// Explicit tag, if any.
    pub tag: Option<String>,

    /// Explicit digest, if any.
    pub digest: Option<String>,
}

impl ImageName {
    /// Parse an image reference.
    ///
    /// Examples:
    /// - `alpine` -> (registry-1.docker.io, library/alpine, no tag)
    /// - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, tag v1)
    /// - `localhost:5000/app@sha256:abc` -> (localhost:5000, app, digest sha256:abc)
    pub fn parse(image_ref: &str) -> Result<Self, InvalidImageRef> {
        let trimmed = image_ref.trim();
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return Err(InvalidImageRef(image_ref.to_string()));
        }

        let (name_part, digest) = match trimmed.split_once('@') {
            Some((name, digest)) if !digest.is_empty() => (name, Some(digest.to_string())),
            Some(_) => return Err(InvalidImageRef(image_ref.to_string())),
            None => (trimmed, None),
        };

        // A colon after the last slash separates the tag; one before it is a
        // registry port.
        let (name_part, tag) = match name_part.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') && !name.ends_with(']') => {
                if tag.is_empty() {
                    return Err(InvalidImageRef(image_ref.to_string()));
                }
                (name, Some(tag.to_string()))
            }
            _ => (name_part, None),
        };

        if name_part.is_empty() || name_part.ends_with('/') {
            return Err(InvalidImageRef(image_ref.to_string()));
        }

        let (registry, repository) = match name_part.split_once('/') {
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name_part}")),
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Returns true if the reference floats: no digest and no tag or `latest`.
    pub fn is_floating(&self) -> bool {
        self.digest.is_none() && self.tag.as_deref().map_or(true, |tag| tag == DEFAULT_TAG)
    }

    /// The digest if pinned, else the tag (defaulting to `latest`).
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
