use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use image::{ImageFormat, ImageReader};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::permissions::{ScreenRecordingStatus, screen_recording_status};

/// One raw screen image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            captured_at: Utc::now(),
        }
    }

    pub fn format(&self) -> Option<ImageFormat> {
        image::guess_format(&self.bytes).ok()
    }

    pub fn extension(&self) -> &'static str {
        match self.format() {
            Some(ImageFormat::Jpeg) => "jpg",
            _ => "png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self.format() {
            Some(ImageFormat::Jpeg) => "image/jpeg",
            _ => "image/png",
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        ImageReader::new(Cursor::new(&self.bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Permission revoked or the source has nothing more to give. Stops the scheduler.
    #[error("{0}")]
    Unavailable(String),
    /// A single acquisition went wrong; the next tick may succeed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn acquire(&self) -> Result<Frame, CaptureError>;

    /// Give the underlying capture resource back. Called once per lease.
    fn release(&self) {}

    fn name(&self) -> &'static str;
}

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Native display capture through the macOS `screencapture` tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScreencaptureFrameSource;

#[async_trait]
impl FrameSource for ScreencaptureFrameSource {
    async fn acquire(&self) -> Result<Frame, CaptureError> {
        if screen_recording_status() == ScreenRecordingStatus::Denied {
            return Err(CaptureError::Unavailable(
                "Screen Recording permission was revoked".to_string(),
            ));
        }

        let output = tempfile::Builder::new()
            .prefix("screen-timeline-")
            .suffix(".png")
            .tempfile()
            .context("failed to create temporary capture file")?;

        let mut command = Command::new("screencapture");
        command.arg("-x").arg("-t").arg("png").arg(output.path());

        let status = match timeout(SCREENSHOT_TIMEOUT, command.status()).await {
            Err(_) => {
                return Err(anyhow!(
                    "screencapture timed out after {:.0}s, check Screen Recording permission",
                    SCREENSHOT_TIMEOUT.as_secs_f32()
                )
                .into());
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaptureError::Unavailable(
                    "screencapture is not available on this system".to_string(),
                ));
            }
            Ok(result) => result.context("failed to execute screencapture")?,
        };

        if !status.success() {
            return Err(anyhow!("screencapture exited with status {status}").into());
        }

        let bytes = tokio::fs::read(output.path())
            .await
            .with_context(|| format!("failed to read capture {}", output.path().display()))?;
        if bytes.is_empty() {
            return Err(anyhow!("screencapture produced an empty image").into());
        }

        Ok(Frame::new(bytes))
    }

    fn name(&self) -> &'static str {
        "screencapture"
    }
}

const STREAM_FRAME_WAIT: Duration = Duration::from_secs(5);

/// Capture from a media stream owned by another component (for example a
/// renderer sharing the screen). The producer publishes its latest frame; each
/// acquisition reads whatever frame is current. Dropping the sender ends the
/// stream.
pub struct StreamFrameSource {
    rx: tokio::sync::Mutex<watch::Receiver<Option<Vec<u8>>>>,
    wait: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamFrameSender {
    tx: watch::Sender<Option<Vec<u8>>>,
}

pub fn stream_frame_source() -> (StreamFrameSender, StreamFrameSource) {
    let (tx, rx) = watch::channel(None);
    (
        StreamFrameSender { tx },
        StreamFrameSource {
            rx: tokio::sync::Mutex::new(rx),
            wait: STREAM_FRAME_WAIT,
        },
    )
}

impl StreamFrameSource {
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

impl StreamFrameSender {
    pub fn push(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        if bytes.is_empty() {
            bail!("refusing to publish an empty frame");
        }
        self.tx
            .send(Some(bytes))
            .map_err(|_| anyhow!("frame stream has no reader"))
    }

    /// Publish a base64 payload, with or without a `data:image/...;base64,` prefix.
    pub fn push_base64(&self, payload: &str) -> anyhow::Result<()> {
        let encoded = match payload.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => payload,
        };
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .context("frame payload is not valid base64")?;
        self.push(bytes)
    }
}

#[async_trait]
impl FrameSource for StreamFrameSource {
    async fn acquire(&self) -> Result<Frame, CaptureError> {
        let mut rx = self.rx.lock().await;
        if rx.has_changed().is_err() {
            return Err(CaptureError::Unavailable("media stream ended".to_string()));
        }

        if let Some(bytes) = rx.borrow_and_update().clone() {
            return Ok(Frame::new(bytes));
        }

        match timeout(self.wait, rx.changed()).await {
            Err(_) => Err(anyhow!(
                "no frame published within {}ms",
                self.wait.as_millis()
            )
            .into()),
            Ok(Err(_)) => Err(CaptureError::Unavailable("media stream ended".to_string())),
            Ok(Ok(())) => rx
                .borrow_and_update()
                .clone()
                .map(Frame::new)
                .ok_or_else(|| anyhow!("media stream published an empty frame").into()),
        }
    }

    fn name(&self) -> &'static str {
        "media-stream"
    }
}

/// Plays back a fixed script of frames, then reports itself exhausted.
#[derive(Debug, Default)]
pub struct SyntheticFrameSource {
    frames: Mutex<VecDeque<Vec<u8>>>,
    delay: Option<Duration>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl SyntheticFrameSource {
    pub fn from_frames(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            frames: Mutex::new(frames.into_iter().collect()),
            ..Self::default()
        }
    }

    /// One small PNG per color; equal colors give byte-identical frames.
    pub fn solid_colors(colors: &[[u8; 3]]) -> anyhow::Result<Self> {
        let frames = colors
            .iter()
            .map(|color| solid_png(*color))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::from_frames(frames))
    }

    /// Make every acquisition take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for SyntheticFrameSource {
    async fn acquire(&self) -> Result<Frame, CaptureError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.frames.lock().expect("frame script poisoned").pop_front();
        next.map(Frame::new)
            .ok_or_else(|| CaptureError::Unavailable("frame script exhausted".to_string()))
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

fn solid_png(color: [u8; 3]) -> anyhow::Result<Vec<u8>> {
    let image = image::RgbImage::from_pixel(8, 8, image::Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .context("failed to encode synthetic frame")?;
    Ok(bytes.into_inner())
}
