//! podlet Node Agent
//!
//! Runs a manifest of pods once: acquires every container image through the
//! image puller, retrying failed pods with a growing delay, then exits.
//!
//! ## Usage
//!
//! ```text
//! node-agent [MANIFEST]
//! ```
//!
//! The manifest path falls back to `PODLET_POD_MANIFEST`. Images are served
//! by the in-process mock runtime, seeded from `PODLET_MOCK_PRESENT_IMAGES`
//! and `PODLET_MOCK_FAILING_IMAGES`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use podlet_node_agent::config::{load_manifest, Config};
use podlet_node_agent::events::TracingRecorder;
use podlet_node_agent::image::{ImagePuller, ImagePullerConfig};
use podlet_node_agent::runonce::RunOnce;
use podlet_node_agent::runtime::MockRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting podlet node agent");

    let manifest = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| config.pod_manifest.clone())
        .context("no pod manifest given (pass a path or set PODLET_POD_MANIFEST)")?;
    let pods = load_manifest(&manifest)?;
    info!(
        manifest = %manifest.display(),
        pods = pods.len(),
        backoff_initial_secs = config.image_backoff.initial.as_secs(),
        backoff_max_secs = config.image_backoff.max.as_secs(),
        "Configuration loaded"
    );

    // Create the runtime (mock for now)
    let runtime = Arc::new(MockRuntime::with_images(config.mock_present_images.iter().cloned()));
    for image in &config.mock_failing_images {
        runtime.set_pull_failing(image.clone(), true);
    }

    let puller = ImagePuller::new(
        ImagePullerConfig {
            backoff: config.image_backoff,
        },
        runtime,
        Arc::new(TracingRecorder),
    )?;
    let run_once = RunOnce::new(Arc::new(puller), config.run_once.clone());

    let results = tokio::select! {
        results = run_once.run(&pods) => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, abandoning run");
            anyhow::bail!("interrupted");
        }
    };

    let mut failed = 0;
    for result in &results {
        match &result.result {
            Ok(()) => info!(pod = %result.pod.full_name(), "Pod ready"),
            Err(e) => {
                failed += 1;
                error!(pod = %result.pod.full_name(), error = %e, "Pod failed");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} pods failed", results.len());
    }

    info!(pods = results.len(), "All pods ready");
    Ok(())
}
