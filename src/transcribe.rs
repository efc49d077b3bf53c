//! Audio transcription and media probing via external tools.
//!
//! The Whisper runtime is a pluggable capability behind the
//! [`Transcriber`] trait; the default implementation shells out to a
//! Whisper CLI that writes JSON (`whisper <file> --output_format json`).
//! `ffmpeg` extracts mono 16 kHz WAV from video containers and `ffprobe`
//! reports duration and dimensions. All subprocess calls carry deadlines.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::chunker::Segment;
use crate::error::{Error, Result};

/// Whole-file transcription deadline.
pub const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const FFMPEG_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const FFPROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of transcribing one audio file.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub language: String,
    pub duration: f64,
    pub segments: Vec<Segment>,
}

/// Narrow transcription interface; tests substitute a scripted fake.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcription>;
}

/// Shells out to a Whisper CLI producing OpenAI-style JSON
/// (`{text, language, segments: [{start, end, text}]}`).
pub struct WhisperCli {
    command: String,
    model: String,
}

impl WhisperCli {
    pub fn new(model: &str) -> Self {
        Self {
            command: std::env::var("WHISPER_COMMAND").unwrap_or_else(|_| "whisper".to_string()),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperCli {
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcription> {
        let out_dir = tempfile::tempdir()?;

        let output = run_with_timeout(
            Command::new(&self.command)
                .arg(audio_path)
                .arg("--model")
                .arg(&self.model)
                .arg("--output_format")
                .arg("json")
                .arg("--output_dir")
                .arg(out_dir.path()),
            TRANSCRIBE_TIMEOUT,
        )
        .await?;

        if !output.status.success() {
            return Err(Error::Extraction {
                path: audio_path.to_path_buf(),
                message: format!(
                    "transcriber exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }

        let stem = audio_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let json_path = out_dir.path().join(format!("{stem}.json"));
        let raw = std::fs::read_to_string(&json_path)?;

        parse_whisper_json(&raw).ok_or_else(|| Error::Extraction {
            path: audio_path.to_path_buf(),
            message: "transcriber produced unparseable JSON".to_string(),
        })
    }
}

/// Parse the Whisper JSON output into a [`Transcription`].
pub fn parse_whisper_json(raw: &str) -> Option<Transcription> {
    let json: serde_json::Value = serde_json::from_str(raw).ok()?;

    let segments: Vec<Segment> = json
        .get("segments")
        .and_then(|s| s.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|seg| {
                    let text = seg.get("text")?.as_str()?.trim().to_string();
                    if text.is_empty() {
                        return None;
                    }
                    Some(Segment {
                        text,
                        start: seg.get("start")?.as_f64()?,
                        end: seg.get("end")?.as_f64()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut text = json
        .get("text")
        .and_then(|t| t.as_str())
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if text.is_empty() && !segments.is_empty() {
        text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
    }

    let language = json
        .get("language")
        .and_then(|l| l.as_str())
        .unwrap_or("unknown")
        .to_string();

    let duration = segments.last().map(|s| s.end).unwrap_or(0.0);

    Some(Transcription {
        text,
        language,
        duration,
        segments,
    })
}

/// Extract a mono 16 kHz WAV track from any media container.
pub async fn extract_audio(input: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = run_with_timeout(
        Command::new("ffmpeg")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-acodec")
            .arg("pcm_s16le")
            .arg("-ar")
            .arg("16000")
            .arg("-ac")
            .arg("1")
            .arg("-y")
            .arg(output),
        FFMPEG_TIMEOUT,
    )
    .await?;

    if !result.status.success() {
        return Err(Error::Extraction {
            path: input.to_path_buf(),
            message: format!(
                "ffmpeg exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr)
            ),
        });
    }
    Ok(())
}

/// Dimensions and duration reported by ffprobe.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaInfo {
    pub duration_seconds: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// Probe a media or image file with ffprobe. Absent fields stay `None`;
/// a failed probe is not an error, just an empty result.
pub async fn probe_media(path: &Path) -> MediaInfo {
    let result = run_with_timeout(
        Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration:stream=width,height")
            .arg("-of")
            .arg("json")
            .arg(path),
        FFPROBE_TIMEOUT,
    )
    .await;

    let Ok(output) = result else {
        return MediaInfo::default();
    };
    if !output.status.success() {
        return MediaInfo::default();
    }

    parse_ffprobe_json(&String::from_utf8_lossy(&output.stdout))
}

fn parse_ffprobe_json(raw: &str) -> MediaInfo {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(raw) else {
        return MediaInfo::default();
    };

    let duration_seconds = json
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|d| d.as_str())
        .and_then(|d| d.parse::<f64>().ok());

    let (mut width, mut height) = (None, None);
    if let Some(streams) = json.get("streams").and_then(|s| s.as_array()) {
        for stream in streams {
            if width.is_none() {
                width = stream.get("width").and_then(|w| w.as_i64());
            }
            if height.is_none() {
                height = stream.get("height").and_then(|h| h.as_i64());
            }
        }
    }

    MediaInfo {
        duration_seconds,
        width,
        height,
    }
}

async fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<std::process::Output> {
    let future = command
        .kill_on_drop(true)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output();

    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(Error::Io),
        Err(_) => Err(Error::ModelTimeout {
            seconds: timeout.as_secs(),
        }),
    }
}
