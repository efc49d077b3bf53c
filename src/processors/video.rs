//! Video processor: ffmpeg extracts a mono 16 kHz WAV track, ffprobe
//! reports dimensions, and the audio path handles the rest.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::chunker::Chunker;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::models::{MediaType, ProcessOutput};
use crate::processors::audio::output_from_transcription;
use crate::processors::MediaProcessor;
use crate::transcribe::{extract_audio, probe_media, Transcriber};

pub struct VideoProcessor {
    transcriber: Arc<dyn Transcriber>,
    chunker: Chunker,
}

impl VideoProcessor {
    pub fn new(settings: &Settings, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            transcriber,
            chunker: Chunker::new(settings.chunk_size, settings.chunk_overlap),
        }
    }
}

#[async_trait]
impl MediaProcessor for VideoProcessor {
    fn media_type(&self) -> MediaType {
        MediaType::Video
    }

    fn can_process(&self, path: &Path) -> bool {
        MediaType::from_extension(path) == Some(MediaType::Video)
    }

    async fn process(&self, path: &Path, cancel: &CancellationToken) -> Result<ProcessOutput> {
        let info = probe_media(path).await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let workdir = tempfile::tempdir()?;
        let wav_path = workdir.path().join("audio.wav");
        extract_audio(path, &wav_path).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let transcription = self.transcriber.transcribe(&wav_path).await?;
        let mut output = output_from_transcription(&self.chunker, transcription);
        output.width = info.width;
        output.height = info.height;
        if output.duration_seconds.is_none() {
            output.duration_seconds = info.duration_seconds;
        }
        Ok(output)
    }
}
