//! Render-job orchestration for the external scene renderer.
//!
//! A job writes the scene source to a scratch directory, runs the renderer,
//! turns its stderr into [`ProgressEvent`]s, and publishes the finished
//! artifact through an [`ArtifactPublisher`].

pub mod frame;
pub mod frames;
pub mod job;
pub mod progress;
pub mod publish;
pub mod runner;

use std::sync::Arc;

use animo_core::config::{Config, StorageBackend};
use animo_core::error::{AnimoError, Result};

pub use frame::{AspectRatio, FrameConfig};
pub use frames::PreviewFrame;
pub use job::{DEFAULT_CLASS_NAME, JobHandle, RenderOutcome, RenderRequest, Renderer};
pub use progress::{ProgressEvent, ProgressParser};
pub use publish::{ArtifactPublisher, AzureBlobPublisher, LocalPublisher};

/// Publisher selected by the storage section of the config.
pub fn publisher_from_config(config: &Config) -> Result<Arc<dyn ArtifactPublisher>> {
    match config.storage_backend() {
        StorageBackend::Local => Ok(Arc::new(LocalPublisher::new(
            config.public_dir(),
            config.base_url(),
        ))),
        StorageBackend::Azure => {
            let azure = config
                .azure_storage()
                .filter(|a| !a.container_url.is_empty())
                .ok_or_else(|| {
                    AnimoError::Config("azure storage selected without a container_url".into())
                })?;
            Ok(Arc::new(AzureBlobPublisher::new(
                azure.container_url.clone(),
                azure.resolve_sas_token(),
            )))
        }
    }
}

/// Renderer wired to the configured publisher.
pub fn renderer_from_config(config: &Config) -> Result<Renderer> {
    Ok(Renderer::new(
        config.render_config(),
        publisher_from_config(config)?,
    ))
}
