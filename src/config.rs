//! Configuration management for camctl
//!
//! Values come from an optional TOML file and are overridden by command line
//! flags. The preview command, preview URL and recordings folder have no
//! sensible defaults and must be provided by one of the two.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::Bitrate;

/// Command line arguments
#[derive(Debug, Default, Parser)]
#[command(name = "camctl", version, about = "HTTP control plane for a capture device")]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "CAMCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host used for the server, most likely its IP in the local network
    #[arg(long)]
    pub host: Option<String>,

    /// Port used for the server
    #[arg(long)]
    pub port: Option<u16>,

    /// Shell command that starts the video preview (e.g. an mjpg-streamer invocation)
    #[arg(long)]
    pub video_preview_cmd: Option<String>,

    /// Preview URL the browser client embeds
    #[arg(long)]
    pub video_preview_url: Option<String>,

    /// Folder recorded segments are written to
    #[arg(long)]
    pub recorded_videos_folder: Option<PathBuf>,

    /// Length of one recorded segment in seconds
    #[arg(long)]
    pub recorded_videos_length_seconds: Option<u64>,

    /// Bitrate of recorded videos in Mbit/s (1, 2.5 or 4.5)
    #[arg(long, value_parser = parse_bitrate)]
    pub bitrate: Option<Bitrate>,

    /// Recording command template with {output} and {bitrate} placeholders
    #[arg(long)]
    pub recording_cmd: Option<String>,

    /// Camera device node checked before each recording attempt
    #[arg(long)]
    pub camera_device: Option<PathBuf>,
}

fn parse_bitrate(name: &str) -> std::result::Result<Bitrate, String> {
    Bitrate::from_name(name).ok_or_else(|| {
        let names: Vec<&str> = Bitrate::ALL.iter().map(|b| b.name()).collect();
        format!("unknown bitrate {name}, expected one of {}", names.join(", "))
    })
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub preview: PreviewConfig,

    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub timings: Timings,

    /// Path the config was loaded from (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Shell command of the preview streamer
    pub command: Option<String>,

    /// URL the browser client shows the preview from
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Folder recorded segments are written to
    pub folder: Option<PathBuf>,

    /// Segment length before rotating to a new file
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u64,

    /// Bitrate used until changed over HTTP
    #[serde(default)]
    pub bitrate: Bitrate,

    /// Encoder command template, `{output}` and `{bitrate}` are substituted
    #[serde(default = "default_recording_command")]
    pub command: String,

    /// Camera device node that must exist before recording starts
    #[serde(default = "default_camera_device")]
    pub device: PathBuf,

    /// Recording refuses to start (and stops) at or below this much free space
    #[serde(default = "default_min_free_space_bytes")]
    pub min_free_space_bytes: u64,
}

/// Timing constants of the control loops, in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timings {
    /// Check interval of background loops and waiting requests
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound a request waits for a start/stop transition
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL when stopping the preview
    #[serde(default = "default_preview_grace_ms")]
    pub preview_grace_ms: u64,

    /// First recording retry delay
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Recording retry delay cap
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_segment_duration_secs() -> u64 {
    600
}

fn default_recording_command() -> String {
    "rpicam-vid -t 0 --inline -b {bitrate} -o {output}".to_string()
}

fn default_camera_device() -> PathBuf {
    PathBuf::from("/dev/video0")
}

fn default_min_free_space_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_preview_grace_ms() -> u64 {
    3000
}

fn default_retry_initial_ms() -> u64 {
    1000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            folder: None,
            segment_duration_secs: default_segment_duration_secs(),
            bitrate: Bitrate::default(),
            command: default_recording_command(),
            device: default_camera_device(),
            min_free_space_bytes: default_min_free_space_bytes(),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            preview_grace_ms: default_preview_grace_ms(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl Timings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn preview_grace(&self) -> Duration {
        Duration::from_millis(self.preview_grace_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    /// Same proportions as the defaults with `unit` in place of one second
    #[cfg(test)]
    pub fn scaled(unit: Duration) -> Self {
        let unit_ms = unit.as_millis() as u64;
        Self {
            poll_interval_ms: unit_ms,
            request_timeout_ms: 10 * unit_ms,
            preview_grace_ms: 3 * unit_ms,
            retry_initial_ms: unit_ms,
            retry_max_ms: 60 * unit_ms,
        }
    }
}

/// Fully resolved settings the controller runs with
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub preview_command: String,
    pub preview_url: String,
    pub recordings_folder: PathBuf,
    pub segment_duration: Duration,
    pub bitrate: Bitrate,
    pub min_free_space_bytes: u64,
    pub timings: Timings,
}

impl Config {
    /// Load configuration from an explicit path, or from the default location
    /// if a file exists there
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let default_path = Self::default_config_path()?;
                if default_path.exists() {
                    Self::load_from(&default_path)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load the file named by the CLI (if any) and apply CLI overrides on top
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = Self::load(cli.config.as_deref())?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// Command line flags win over file values
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(command) = &cli.video_preview_cmd {
            self.preview.command = Some(command.clone());
        }
        if let Some(url) = &cli.video_preview_url {
            self.preview.url = Some(url.clone());
        }
        if let Some(folder) = &cli.recorded_videos_folder {
            self.recording.folder = Some(folder.clone());
        }
        if let Some(secs) = cli.recorded_videos_length_seconds {
            self.recording.segment_duration_secs = secs;
        }
        if let Some(bitrate) = cli.bitrate {
            self.recording.bitrate = bitrate;
        }
        if let Some(command) = &cli.recording_cmd {
            self.recording.command = command.clone();
        }
        if let Some(device) = &cli.camera_device {
            self.recording.device = device.clone();
        }
    }

    /// Where the config was read from, if it came from a file
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Address the HTTP server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Validate required values and resolve the controller settings
    pub fn control_settings(&self) -> Result<ControlSettings> {
        let Some(preview_command) = self.preview.command.clone() else {
            bail!("No preview command configured (--video-preview-cmd or [preview].command)");
        };
        let Some(preview_url) = self.preview.url.clone() else {
            bail!("No preview URL configured (--video-preview-url or [preview].url)");
        };
        let Some(recordings_folder) = self.recording.folder.clone() else {
            bail!("No recordings folder configured (--recorded-videos-folder or [recording].folder)");
        };
        if self.recording.segment_duration_secs == 0 {
            bail!("Segment duration must be at least one second");
        }
        if !self.recording.command.contains("{output}") {
            bail!("Recording command must contain an {{output}} placeholder");
        }

        Ok(ControlSettings {
            preview_command,
            preview_url,
            recordings_folder,
            segment_duration: Duration::from_secs(self.recording.segment_duration_secs),
            bitrate: self.recording.bitrate,
            min_free_space_bytes: self.recording.min_free_space_bytes,
            timings: self.timings,
        })
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "camctl", "camctl")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
