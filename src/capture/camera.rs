//! Camera access
//!
//! The recording worker only talks to the camera through [`CameraDriver`] and
//! [`CameraSession`]. The shipped driver runs an encoder command per segment.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::process::{ProcessGroup, Signal};
use super::recording::Bitrate;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("camera device {0:?} is not available")]
    Unavailable(PathBuf),

    #[error("failed to start recording command: {0}")]
    Spawn(#[source] io::Error),

    #[error("recording command exited unexpectedly ({0})")]
    Exited(ExitStatus),

    #[error("no recording in progress")]
    NotRecording,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opens exclusive sessions on the capture device
#[async_trait]
pub trait CameraDriver: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn CameraSession>, DeviceError>;
}

/// An open camera. Closed explicitly with [`CameraSession::close`].
#[async_trait]
pub trait CameraSession: Send {
    /// Begin encoding into `output`
    async fn start_recording(&mut self, output: &Path, bitrate: Bitrate)
        -> Result<(), DeviceError>;

    /// Finish the current file and continue into `output`
    async fn split_recording(&mut self, output: &Path) -> Result<(), DeviceError>;

    /// Block for up to `timeout`, failing early if the encoder stops
    async fn wait_recording(&mut self, timeout: Duration) -> Result<(), DeviceError>;

    /// Stop recording and release the device
    async fn close(&mut self) -> Result<(), DeviceError>;
}

/// Driver that runs an encoder command line for each segment.
///
/// `{output}` and `{bitrate}` in the template are replaced by the quoted output
/// path and the bitrate in bits per second. The encoder is stopped with SIGINT
/// so it can finalize its file.
///
/// Segments do not overlap: the device is exclusive, so on a split the next
/// encoder only starts once the previous one has exited. Frames between the
/// two are lost. The gap is however long the encoder takes to finalize, and
/// never longer than `grace` plus a SIGKILL.
pub struct CommandCamera {
    device: PathBuf,
    command: String,
    grace: Duration,
}

impl CommandCamera {
    pub fn new(device: impl Into<PathBuf>, command: impl Into<String>, grace: Duration) -> Self {
        Self {
            device: device.into(),
            command: command.into(),
            grace,
        }
    }
}

#[async_trait]
impl CameraDriver for CommandCamera {
    async fn acquire(&self) -> Result<Box<dyn CameraSession>, DeviceError> {
        if !tokio::fs::try_exists(&self.device).await.unwrap_or(false) {
            return Err(DeviceError::Unavailable(self.device.clone()));
        }
        debug!("Acquired camera {:?}", self.device);
        Ok(Box::new(CommandSession {
            command: self.command.clone(),
            grace: self.grace,
            bitrate: Bitrate::default(),
            process: None,
        }))
    }
}

struct CommandSession {
    command: String,
    grace: Duration,
    bitrate: Bitrate,
    process: Option<ProcessGroup>,
}

impl CommandSession {
    fn spawn(&mut self, output: &Path) -> Result<(), DeviceError> {
        let command = render_command(&self.command, output, self.bitrate);
        let process =
            ProcessGroup::spawn_shell("recording encoder", &command).map_err(DeviceError::Spawn)?;
        self.process = Some(process);
        Ok(())
    }

    async fn stop_encoder(&mut self) -> Result<(), DeviceError> {
        if let Some(mut process) = self.process.take() {
            let status = process.shutdown(Signal::Interrupt, self.grace).await?;
            debug!("Recording encoder exited with {}", status);
        }
        Ok(())
    }
}

#[async_trait]
impl CameraSession for CommandSession {
    async fn start_recording(
        &mut self,
        output: &Path,
        bitrate: Bitrate,
    ) -> Result<(), DeviceError> {
        self.stop_encoder().await?;
        self.bitrate = bitrate;
        self.spawn(output)
    }

    async fn split_recording(&mut self, output: &Path) -> Result<(), DeviceError> {
        if self.process.is_none() {
            return Err(DeviceError::NotRecording);
        }
        let paused = Instant::now();
        self.stop_encoder().await?;
        self.spawn(output)?;
        debug!("Segment switch paused capture for {:?}", paused.elapsed());
        Ok(())
    }

    async fn wait_recording(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let Some(process) = self.process.as_mut() else {
            return Err(DeviceError::NotRecording);
        };
        match tokio::time::timeout(timeout, process.wait()).await {
            Err(_) => Ok(()),
            Ok(Ok(status)) => {
                self.process = None;
                Err(DeviceError::Exited(status))
            }
            Ok(Err(e)) => Err(DeviceError::Io(e)),
        }
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if self.process.is_some() {
            info!("Closing camera");
        }
        self.stop_encoder().await
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        if self.process.is_some() {
            warn!("Camera session dropped while recording, killing encoder");
        }
    }
}

fn render_command(template: &str, output: &Path, bitrate: Bitrate) -> String {
    template
        .replace("{output}", &shell_quote(&output.to_string_lossy()))
        .replace("{bitrate}", &bitrate.value().to_string())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
