//! Document processor: PDFs through the two-pass pipeline, Office files
//! through the native extractors, everything else as plain text.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::chunker::Chunker;
use crate::config::Settings;
use crate::error::Result;
use crate::extract;
use crate::models::{MediaType, ProcessOutput};
use crate::pdf::PdfPipeline;
use crate::processors::MediaProcessor;

pub struct DocumentProcessor {
    chunker: Chunker,
    pdf: PdfPipeline,
}

impl DocumentProcessor {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            chunker: Chunker::new(settings.chunk_size, settings.chunk_overlap),
            pdf: PdfPipeline::new(settings)?,
        })
    }

    fn is_pdf(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
    }
}

#[async_trait]
impl MediaProcessor for DocumentProcessor {
    fn media_type(&self) -> MediaType {
        MediaType::Document
    }

    fn can_process(&self, path: &Path) -> bool {
        match MediaType::from_extension(path) {
            Some(MediaType::Document) => true,
            Some(_) => false,
            // Unknown extension: accept if the head decodes as text.
            None => extract::looks_like_text(path),
        }
    }

    async fn process(&self, path: &Path, cancel: &CancellationToken) -> Result<ProcessOutput> {
        if Self::is_pdf(path) {
            let extraction = self.pdf.extract(path, cancel).await?;
            let chunks = self.chunker.chunk_pages(&extraction.pages);
            return Ok(ProcessOutput {
                chunks,
                vlm_pages: extraction.vlm_pages,
                ..Default::default()
            });
        }

        let owned = path.to_path_buf();
        let text =
            tokio::task::spawn_blocking(move || extract::extract_document_text(&owned))
                .await
                .map_err(|e| crate::error::Error::Other(e.to_string()))??;

        if cancel.is_cancelled() {
            return Err(crate::error::Error::Cancelled);
        }

        Ok(ProcessOutput {
            chunks: self.chunker.chunk_text(&text),
            ..Default::default()
        })
    }
}
