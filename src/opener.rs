//! OS integration: open a file with its default handler, optionally at a
//! media timestamp, and reveal a file in the platform file manager.

use std::path::Path;

use crate::error::{Error, Result};
use crate::models::MediaType;

/// Open a file with the OS default handler. For audio/video with a
/// start time, hand the opener a `file://` URL with a time fragment so
/// players that understand media fragments jump straight there.
pub async fn open_file(path: &Path, start_time: Option<f64>) -> Result<()> {
    if !path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("file not found: {}", path.display()),
        )));
    }

    let is_media = matches!(
        MediaType::from_extension(path),
        Some(MediaType::Audio | MediaType::Video)
    );

    let target = match start_time {
        Some(start) if is_media => {
            format!("file://{}#t={}", path.display(), start.floor() as i64)
        }
        _ => path.display().to_string(),
    };

    run_opener(&target).await
}

/// Reveal a file in the platform file manager.
pub async fn reveal_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("file not found: {}", path.display()),
        )));
    }

    #[cfg(target_os = "macos")]
    {
        run_command("open", &["-R", &path.display().to_string()]).await
    }

    #[cfg(not(target_os = "macos"))]
    {
        // No portable "select in file manager" on other platforms; open
        // the containing directory instead.
        let parent = path.parent().unwrap_or(path);
        run_opener(&parent.display().to_string()).await
    }
}

async fn run_opener(target: &str) -> Result<()> {
    #[cfg(target_os = "macos")]
    let command = "open";
    #[cfg(all(unix, not(target_os = "macos")))]
    let command = "xdg-open";
    #[cfg(windows)]
    let command = "explorer";

    run_command(command, &[target]).await
}

async fn run_command(command: &str, args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new(command)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Other(format!(
            "{command} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = open_file(Path::new("/no/such/file.mp4"), Some(12.0)).await;
        assert!(matches!(err, Err(Error::Io(_))));
        let err = reveal_file(Path::new("/no/such/file.mp4")).await;
        assert!(matches!(err, Err(Error::Io(_))));
    }
}
