//! Media-typed processor pipeline.
//!
//! Each media type has one stateless processor implementing
//! [`MediaProcessor`]; the [`ProcessorRegistry`] dispatches on a
//! document's media type. Processors extract text and locators and hand
//! back [`ProcessOutput`]; embedding and storage happen in the scheduler,
//! which also imposes all concurrency and deadlines.

mod audio;
mod document;
mod image;
mod video;

pub use audio::AudioProcessor;
pub use document::DocumentProcessor;
pub use image::ImageProcessor;
pub use video::VideoProcessor;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::models::{MediaType, ProcessOutput};
use crate::transcribe::{Transcriber, WhisperCli};

/// Capability interface for one media type.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    fn media_type(&self) -> MediaType;

    /// Whether this processor accepts the given file.
    fn can_process(&self, path: &Path) -> bool;

    /// Extract chunk drafts and document metadata. The cancel token is
    /// checked between stages and before external calls.
    async fn process(&self, path: &Path, cancel: &CancellationToken) -> Result<ProcessOutput>;
}

/// Dispatch table keyed by media type.
pub struct ProcessorRegistry {
    processors: Vec<Box<dyn MediaProcessor>>,
}

impl ProcessorRegistry {
    /// Build the default registry: document (with the PDF pipeline),
    /// image (VLM), audio (Whisper), video (ffmpeg + Whisper).
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let transcriber: Arc<dyn Transcriber> =
            Arc::new(WhisperCli::new(&settings.whisper_model));
        Self::with_transcriber(settings, transcriber)
    }

    /// Same registry with an injected transcriber (tests script it).
    pub fn with_transcriber(
        settings: &Settings,
        transcriber: Arc<dyn Transcriber>,
    ) -> Result<Self> {
        let mut registry = Self {
            processors: Vec::new(),
        };
        registry.register(Box::new(DocumentProcessor::new(settings)?));
        registry.register(Box::new(ImageProcessor::new(settings)?));
        registry.register(Box::new(AudioProcessor::new(settings, Arc::clone(&transcriber))));
        registry.register(Box::new(VideoProcessor::new(settings, transcriber)));
        Ok(registry)
    }

    pub fn register(&mut self, processor: Box<dyn MediaProcessor>) {
        self.processors.push(processor);
    }

    pub fn get(&self, media_type: MediaType) -> Option<&dyn MediaProcessor> {
        self.processors
            .iter()
            .find(|p| p.media_type() == media_type)
            .map(|p| p.as_ref())
    }

    /// Dispatch to the processor for `media_type`.
    pub async fn process(
        &self,
        media_type: MediaType,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        let processor = self.get(media_type).ok_or_else(|| {
            Error::Other(format!("no processor registered for {media_type}"))
        })?;
        if !processor.can_process(path) {
            return Err(Error::Extraction {
                path: path.to_path_buf(),
                message: format!("unsupported {media_type} file"),
            });
        }
        processor.process(path, cancel).await
    }
}
