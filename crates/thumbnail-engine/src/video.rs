//! Video frame extraction through external tools.
//!
//! A representative frame comes from ffmpeg writing a single PNG to stdout;
//! no temp files. Seek offsets are a ladder: 1s in (skips leading black
//! frames), then 10% of the probed duration for clips shorter than that,
//! then no seek at all for whatever ffmpeg can still make sense of. Each
//! invocation is bounded by a timeout and killed on cancellation.

use image::DynamicImage;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Result, ThumbError};

/// Ceiling on the duration probe; it reads container headers and should be
/// far quicker than frame extraction.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FrameExtractor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FrameExtractor {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf, timeout: Duration) -> FrameExtractor {
        FrameExtractor {
            ffmpeg,
            ffprobe,
            timeout,
        }
    }

    /// Pull one frame from `path` through the seek ladder. Cancellation and
    /// per-attempt timeouts are terminal; ordinary attempt failures fall
    /// through to the next rung and only exhausting the ladder is a decode
    /// failure.
    #[instrument(skip(self, token))]
    pub async fn extract_frame(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<DynamicImage> {
        let mut failures: Vec<String> = Vec::new();

        if let Some(img) = self.attempt(path, Some(1.0), token, &mut failures).await? {
            return Ok(img);
        }

        // The clip may be shorter than a second. Ask how long it is and seek
        // to 10%, never earlier than 0.1s.
        match self.probe_duration(path, token).await? {
            Some(duration) => {
                let offset = seek_offset(duration);
                debug!(
                    "retrying {} at {offset:.2}s ({duration:.2}s clip)",
                    path.display()
                );
                if let Some(img) = self
                    .attempt(path, Some(offset), token, &mut failures)
                    .await?
                {
                    return Ok(img);
                }
            }
            None => debug!("duration probe failed for {}", path.display()),
        }

        // Last resort: decode from the top, no seek. Slowest, most
        // compatible.
        if let Some(img) = self.attempt(path, None, token, &mut failures).await? {
            return Ok(img);
        }

        Err(ThumbError::DecodeExhausted {
            path: path.to_path_buf(),
            detail: failures.join("; "),
        })
    }

    /// One ffmpeg invocation. `Ok(None)` means the attempt failed but the
    /// ladder may continue; `Err` is terminal (cancelled or timed out).
    async fn attempt(
        &self,
        path: &Path,
        seek: Option<f64>,
        token: &CancellationToken,
        failures: &mut Vec<String>,
    ) -> Result<Option<DynamicImage>> {
        if token.is_cancelled() {
            return Err(ThumbError::Cancelled("frame extraction"));
        }

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-nostdin").args(["-loglevel", "error"]);
        if let Some(offset) = seek {
            // -ss before -i: keyframe seek, cheap even on long files.
            cmd.args(["-ss", &format!("{offset:.3}")]);
        }
        cmd.arg("-i")
            .arg(path)
            .args(["-frames:v", "1", "-an", "-f", "image2pipe", "-vcodec", "png", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let seek_desc = match seek {
            Some(offset) => format!("{offset:.1}s"),
            None => "none".to_string(),
        };
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("ffmpeg spawn failed: {e}");
                failures.push(format!("seek {seek_desc}: spawn: {e}"));
                return Ok(None);
            }
        };

        let output = tokio::select! {
            _ = token.cancelled() => return Err(ThumbError::Cancelled("frame extraction")),
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    failures.push(format!("seek {seek_desc}: wait: {e}"));
                    return Ok(None);
                }
                Err(_) => {
                    return Err(ThumbError::ToolTimeout {
                        tool: "ffmpeg",
                        secs: self.timeout.as_secs(),
                        path: path.to_path_buf(),
                    })
                }
            },
        };

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                "ffmpeg (seek {seek_desc}) produced no frame for {}: {}",
                path.display(),
                stderr.trim()
            );
            failures.push(format!("seek {seek_desc}: {}", first_line(&stderr)));
            return Ok(None);
        }

        match image::load_from_memory_with_format(&output.stdout, image::ImageFormat::Png) {
            Ok(img) => Ok(Some(img)),
            Err(e) => {
                failures.push(format!("seek {seek_desc}: frame decode: {e}"));
                Ok(None)
            }
        }
    }

    /// Clip duration in seconds, or `None` when ffprobe can't say. Probe
    /// failures are soft: the ladder still has its no-seek rung.
    async fn probe_duration(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Option<f64>> {
        if token.is_cancelled() {
            return Err(ThumbError::Cancelled("duration probe"));
        }

        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("ffprobe spawn failed: {e}");
                return Ok(None);
            }
        };

        let output = tokio::select! {
            _ = token.cancelled() => return Err(ThumbError::Cancelled("duration probe")),
            result = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    debug!("ffprobe wait failed for {}: {e}", path.display());
                    return Ok(None);
                }
                Err(_) => {
                    debug!("ffprobe timed out for {}", path.display());
                    return Ok(None);
                }
            },
        };

        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_duration(&output.stdout))
    }
}

fn seek_offset(duration: f64) -> f64 {
    (duration * 0.1).max(0.1)
}

fn parse_duration(stdout: &[u8]) -> Option<f64> {
    let value: f64 = std::str::from_utf8(stdout).ok()?.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

fn first_line(s: &Cow<'_, str>) -> String {
    s.lines().next().unwrap_or("no output").to_string()
}
