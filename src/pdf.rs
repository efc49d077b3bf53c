//! PDF extraction with a per-page VLM fallback.
//!
//! Two passes: a text pass pulls per-page text with `pdf-extract`, then
//! pages under the character threshold are treated as image-heavy,
//! rendered to PNG with `pdftoppm`, and transcribed by the VLM. VLM pages
//! run under a bounded worker pool with a per-page deadline; a failed
//! page keeps the document indexable through a placeholder, and only a
//! document with no readable page at all is treated as failed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::vlm::VlmClient;

/// Marker recorded when a document had no extractable page.
pub const EXTRACTION_FAILED: &str = "extraction_failed";

/// Extraction output: 1-based page numbers with their final text.
#[derive(Debug, Clone)]
pub struct PdfExtraction {
    pub pages: Vec<(i64, String)>,
    /// How many pages went through the VLM fallback.
    pub vlm_pages: usize,
}

pub struct PdfPipeline {
    vlm: Arc<VlmClient>,
    min_chars_per_page: usize,
    max_pages: usize,
    dpi: u32,
    workers: usize,
    page_timeout: Duration,
}

impl PdfPipeline {
    pub fn new(settings: &Settings) -> Result<Self> {
        let page_timeout = Duration::from_secs(settings.pdf_vlm_timeout_secs);
        let vlm = VlmClient::new(&settings.ollama_host, &settings.pdf_vlm_model, page_timeout)?;
        Ok(Self {
            vlm: Arc::new(vlm),
            min_chars_per_page: settings.pdf_min_chars_per_page,
            max_pages: settings.pdf_vlm_max_pages,
            dpi: settings.pdf_vlm_dpi,
            workers: settings.pdf_vlm_workers,
            page_timeout,
        })
    }

    /// Run both passes over one PDF.
    pub async fn extract(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PdfExtraction> {
        let bytes = tokio::fs::read(path).await?;
        let owned_path = path.to_path_buf();

        let page_texts = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem_by_pages(&bytes).map_err(|e| Error::Extraction {
                path: owned_path,
                message: e.to_string(),
            })
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))??;

        let mut pages: Vec<(i64, String)> = page_texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| (i as i64 + 1, text))
            .collect();

        let image_heavy: Vec<i64> = pages
            .iter()
            .filter(|(_, text)| text.trim().chars().count() < self.min_chars_per_page)
            .map(|(n, _)| *n)
            .collect();

        let mut selected = image_heavy.clone();
        if self.max_pages > 0 && selected.len() > self.max_pages {
            tracing::warn!(
                path = %path.display(),
                needed = image_heavy.len(),
                limit = self.max_pages,
                "VLM page limit reached; processing the first pages only"
            );
            selected.truncate(self.max_pages);
        }

        let vlm_results = self.run_vlm_pages(path, &selected, cancel).await?;
        let vlm_pages = vlm_results.len();

        let mut succeeded = 0usize;
        for (page_no, text) in pages.iter_mut() {
            match vlm_results.get(page_no) {
                Some(Ok(vlm_text)) if !vlm_text.trim().is_empty() => {
                    *text = vlm_text.clone();
                    succeeded += 1;
                }
                Some(Ok(_)) | Some(Err(_)) => {
                    *text = format!("[page {page_no}: extraction failed]");
                }
                None => {
                    if !text.trim().is_empty() {
                        succeeded += 1;
                    }
                }
            }
        }

        if succeeded == 0 {
            return Err(Error::Extraction {
                path: path.to_path_buf(),
                message: EXTRACTION_FAILED.to_string(),
            });
        }

        Ok(PdfExtraction { pages, vlm_pages })
    }

    /// Render and transcribe the selected pages, at most `workers` at a
    /// time, each under the per-page deadline. Returns per-page results
    /// keyed by page number; an error entry means that page keeps its
    /// placeholder.
    async fn run_vlm_pages(
        &self,
        path: &Path,
        page_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<HashMap<i64, Result<String>>> {
        let mut results = HashMap::new();
        if page_numbers.is_empty() {
            return Ok(results);
        }

        tracing::info!(
            path = %path.display(),
            pages = page_numbers.len(),
            workers = self.workers,
            "running VLM fallback"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<(i64, Result<String>)> = JoinSet::new();

        for &page_no in page_numbers {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let semaphore = Arc::clone(&semaphore);
            let vlm = Arc::clone(&self.vlm);
            let pdf_path = path.to_path_buf();
            let dpi = self.dpi;
            let deadline = self.page_timeout;
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => return (page_no, Err(Error::Cancelled)),
                };
                if cancel.is_cancelled() {
                    return (page_no, Err(Error::Cancelled));
                }

                let result = tokio::time::timeout(
                    deadline,
                    transcribe_page(&vlm, &pdf_path, page_no, dpi),
                )
                .await
                .unwrap_or(Err(Error::ModelTimeout {
                    seconds: deadline.as_secs(),
                }));
                (page_no, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (page_no, result) = joined.map_err(|e| Error::Other(e.to_string()))?;
            match &result {
                Ok(text) => {
                    tracing::info!(page = page_no, chars = text.chars().count(), "VLM page done")
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => tracing::warn!(page = page_no, %err, "VLM page failed"),
            }
            results.insert(page_no, result);
        }

        Ok(results)
    }
}

async fn transcribe_page(
    vlm: &VlmClient,
    pdf_path: &Path,
    page_no: i64,
    dpi: u32,
) -> Result<String> {
    let image = render_page(pdf_path, page_no, dpi).await?;
    let text = vlm.transcribe_page(&image).await;
    let _ = std::fs::remove_file(&image);
    text
}

/// Render one page to PNG with `pdftoppm -singlefile`. Returns the
/// temporary image path; the caller removes it.
async fn render_page(pdf_path: &Path, page_no: i64, dpi: u32) -> Result<PathBuf> {
    let dir = std::env::temp_dir();
    let prefix = dir.join(format!(
        "lds-page-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4()
    ));

    let output = tokio::process::Command::new("pdftoppm")
        .arg("-png")
        .arg("-r")
        .arg(dpi.to_string())
        .arg("-f")
        .arg(page_no.to_string())
        .arg("-l")
        .arg(page_no.to_string())
        .arg("-singlefile")
        .arg(pdf_path)
        .arg(&prefix)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Extraction {
            path: pdf_path.to_path_buf(),
            message: format!(
                "pdftoppm exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }

    Ok(prefix.with_extension("png"))
}
