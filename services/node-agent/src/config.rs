//! Configuration for the node agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use podlet_backoff::{BackoffConfig, BackoffConfigError, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY};
use thiserror::Error;

use crate::pod::Pod;
use crate::runonce::{RunOnceConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: expected {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("invalid image back-off: {0}")]
    Backoff(#[from] BackoffConfigError),
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error) used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Pod manifest to run when none is given on the command line.
    pub pod_manifest: Option<PathBuf>,

    /// Back-off for failing image pulls.
    pub image_backoff: BackoffConfig,

    /// Run-once retry policy.
    pub run_once: RunOnceConfig,

    /// Images the mock runtime reports as present.
    pub mock_present_images: Vec<String>,

    /// Images whose pulls fail in the mock runtime.
    pub mock_failing_images: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("PODLET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let pod_manifest = lookup("PODLET_POD_MANIFEST")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let initial = parse_u64(&lookup, "PODLET_IMAGE_BACKOFF_INITIAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INITIAL_DELAY);
        let max = parse_u64(&lookup, "PODLET_IMAGE_BACKOFF_MAX_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAX_DELAY);
        let image_backoff = BackoffConfig::new(initial, max);
        image_backoff.validate()?;

        let max_retries = match parse_u64(&lookup, "PODLET_RUN_ONCE_MAX_RETRIES")? {
            Some(n) => u32::try_from(n).map_err(|_| ConfigError::Invalid {
                var: "PODLET_RUN_ONCE_MAX_RETRIES",
                value: n.to_string(),
                expected: "a 32-bit unsigned integer",
            })?,
            None => DEFAULT_MAX_RETRIES,
        };
        let retry_delay = parse_u64(&lookup, "PODLET_RUN_ONCE_RETRY_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_DELAY);

        Ok(Self {
            log_level,
            pod_manifest,
            image_backoff,
            run_once: RunOnceConfig {
                max_retries,
                retry_delay,
                ..Default::default()
            },
            mock_present_images: parse_list(lookup("PODLET_MOCK_PRESENT_IMAGES")),
            mock_failing_images: parse_list(lookup("PODLET_MOCK_FAILING_IMAGES")),
        })
    }
}

fn parse_u64<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };

    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid {
            var,
            value,
            expected: "an unsigned integer",
        })
}

fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Read pods from a JSON manifest holding either one pod or a list of pods.
pub fn load_manifest(path: &Path) -> anyhow::Result<Vec<Pod>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pod manifest {}", path.display()))?;

    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("pod manifest {} is not valid JSON", path.display()))?;

    let pods: Vec<Pod> = if value.is_array() {
        serde_json::from_value::<Vec<Pod>>(value)
    } else {
        serde_json::from_value::<Pod>(value).map(|pod| vec![pod])
    }
    .with_context(|| format!("pod manifest {} does not describe pods", path.display()))?;

    Ok(pods)
}
