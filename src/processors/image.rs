//! Image processor: the VLM produces a description and an OCR pass, and
//! ffprobe supplies pixel dimensions.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::chunker::Chunker;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::models::{MediaType, ProcessOutput};
use crate::processors::MediaProcessor;
use crate::transcribe::probe_media;
use crate::vlm::VlmClient;

pub struct ImageProcessor {
    vlm: VlmClient,
    chunker: Chunker,
}

impl ImageProcessor {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            vlm: VlmClient::new(
                &settings.ollama_host,
                &settings.vlm_model,
                Duration::from_secs(60),
            )?,
            chunker: Chunker::new(settings.chunk_size, settings.chunk_overlap),
        })
    }
}

#[async_trait]
impl MediaProcessor for ImageProcessor {
    fn media_type(&self) -> MediaType {
        MediaType::Image
    }

    fn can_process(&self, path: &Path) -> bool {
        MediaType::from_extension(path) == Some(MediaType::Image)
    }

    async fn process(&self, path: &Path, cancel: &CancellationToken) -> Result<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let description = self.vlm.describe_image(path).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // OCR is best-effort on top of the description; a failure here
        // must not lose the image.
        let ocr = self.vlm.extract_text(path).await.unwrap_or_default();

        let mut text = description;
        if !ocr.trim().is_empty() {
            text.push_str("\n\n[OCR] ");
            text.push_str(ocr.trim());
        }

        let info = probe_media(path).await;

        Ok(ProcessOutput {
            chunks: self.chunker.chunk_text(&text),
            width: info.width,
            height: info.height,
            ..Default::default()
        })
    }
}
