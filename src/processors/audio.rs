//! Audio processor: Whisper transcription with segment timestamps.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::chunker::Chunker;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::models::{MediaType, ProcessOutput, TranscriptDraft};
use crate::processors::MediaProcessor;
use crate::transcribe::{Transcriber, Transcription};

pub struct AudioProcessor {
    transcriber: Arc<dyn Transcriber>,
    chunker: Chunker,
}

impl AudioProcessor {
    pub fn new(settings: &Settings, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            transcriber,
            chunker: Chunker::new(settings.chunk_size, settings.chunk_overlap),
        }
    }
}

/// Shared by the audio and video processors once a transcription exists.
pub(super) fn output_from_transcription(
    chunker: &Chunker,
    transcription: Transcription,
) -> ProcessOutput {
    let mut chunks = chunker.chunk_segments(&transcription.segments);
    if chunks.is_empty() {
        // No usable timestamps; fall back to plain text chunking.
        chunks = chunker.chunk_text(&transcription.text);
    }

    let word_count = transcription.text.split_whitespace().count() as i64;
    let transcript = (!transcription.text.trim().is_empty()).then(|| TranscriptDraft {
        full_text: transcription.text,
        language: transcription.language,
        duration_seconds: transcription.duration,
        word_count,
    });

    ProcessOutput {
        chunks,
        duration_seconds: transcript.as_ref().map(|t| t.duration_seconds),
        transcript,
        ..Default::default()
    }
}

#[async_trait]
impl MediaProcessor for AudioProcessor {
    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }

    fn can_process(&self, path: &Path) -> bool {
        MediaType::from_extension(path) == Some(MediaType::Audio)
    }

    async fn process(&self, path: &Path, cancel: &CancellationToken) -> Result<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let transcription = self.transcriber.transcribe(path).await?;
        Ok(output_from_transcription(&self.chunker, transcription))
    }
}
