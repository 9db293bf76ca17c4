//! Source separation engines.
//!
//! Two interchangeable backends implement [`Separator`]:
//!
//! - [`spleeter::SpleeterSeparator`] runs the `spleeter` command line tool as a subprocess.
//! - [`demucs::DemucsSeparator`] runs a pretrained waveform model in-process, drawing model
//!   instances from an exclusive-checkout pool.
//!
//! [`SeparationEngine`] wraps whichever backend is configured and bounds how many separations
//! run at once. Requests beyond the limit wait for a slot; nothing is rejected. A slot stays taken
//! until the separation's work has actually stopped, even when the caller gave up on it.

pub mod demucs;
pub mod model;
pub mod spleeter;

use crate::config::{EngineConfig, SeparationConfig};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, instrument, warn};

/// One separated stem written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stem {
    pub name: String,
    pub path: PathBuf,
}

/// A source separation backend.
#[async_trait]
pub trait Separator: Send + Sync {
    /// Split `input` into stems written below `output_dir`.
    ///
    /// Returns one entry per stem in [`Separator::stems`] order.
    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<Vec<Stem>>;

    /// [`Separator::separate`] while holding a concurrency slot.
    ///
    /// `slot` must not be released before the separation stops using CPU or the output directory.
    /// Backends that run work off the calling task move it along with that work.
    async fn separate_in_slot(&self, input: &Path, output_dir: &Path, slot: SeparationSlot) -> Result<Vec<Stem>> {
        let _slot = slot;
        self.separate(input, output_dir).await
    }

    /// Names of the stems this backend produces
    fn stems(&self) -> Vec<String>;

    /// Get the name of this separator (for logging)
    fn name(&self) -> &'static str;
}

/// One unit of the [`SeparationEngine`] concurrency limit, released on drop.
#[derive(Debug)]
pub struct SeparationSlot(Option<OwnedSemaphorePermit>);

impl SeparationSlot {
    /// A slot that belongs to no limiter.
    pub fn unbounded() -> Self {
        Self(None)
    }
}

/// Build the configured separation backend.
pub fn build_separator(config: &EngineConfig) -> anyhow::Result<Arc<dyn Separator>> {
    match config {
        EngineConfig::Spleeter { binary, preset } => Ok(Arc::new(spleeter::SpleeterSeparator::new(binary.clone(), *preset))),
        EngineConfig::Demucs {
            model_path,
            instances,
            sample_rate,
            stems,
            segment_samples,
            overlap,
        } => {
            let models = (0..*instances)
                .map(|_| model::load_model(model_path))
                .collect::<anyhow::Result<Vec<_>>>()?;
            info!("Loaded {} separation model instance(s) from {:?}", models.len(), model_path);

            let params = demucs::DemucsParams {
                stems: stems.clone(),
                sample_rate: *sample_rate,
                segment_samples: *segment_samples,
                overlap: *overlap,
            };
            Ok(Arc::new(demucs::DemucsSeparator::new(models, params)))
        }
    }
}

/// The configured separator plus the concurrency and time limits applied around it.
#[derive(Clone)]
pub struct SeparationEngine {
    separator: Arc<dyn Separator>,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl SeparationEngine {
    pub fn new(separator: Arc<dyn Separator>, config: &SeparationConfig) -> Self {
        Self {
            separator,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            timeout: config.timeout,
        }
    }

    pub fn stems(&self) -> Vec<String> {
        self.separator.stems()
    }

    pub fn name(&self) -> &'static str {
        self.separator.name()
    }

    /// Run one separation once a concurrency slot is free.
    #[instrument(skip_all, fields(engine = self.separator.name()), err)]
    pub async fn separate(&self, input: &Path, output_dir: &Path) -> Result<Vec<Stem>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("Separation limiter closed: {e}")))?;
        let slot = SeparationSlot(Some(permit));

        let engine = self.separator.name();
        let started = Instant::now();

        let work = self.separator.separate_in_slot(input, output_dir, slot);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.unwrap_or_else(|_| {
                warn!("Separation exceeded {}s, abandoning it", limit.as_secs());
                Err(Error::Separation {
                    message: format!("Separation timed out after {}s", limit.as_secs()),
                })
            }),
            None => work.await,
        };

        let elapsed = started.elapsed();
        crate::metrics::record_separation(engine, result.is_ok(), elapsed);
        info!("Separation finished in {:.2}s", elapsed.as_secs_f64());

        result
    }
}
