use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::DuplexStream;
use tokio::sync::Mutex;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::worker::{await_state, SharedState};
use super::{Activity, ControlError, VideoState};
use crate::capture::{
    archive_entries, folder_size, run_preview, run_recording, write_archive, Bitrate, BitrateInfo,
    CameraDriver, DiskSpace, RecordingJob,
};
use crate::config::ControlSettings;

/// Archive bytes buffered between the zip writer and the HTTP body
const ARCHIVE_PIPE_CAPACITY: usize = 64 * 1024;

/// Point-in-time view of the device and its storage
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub video_preview_url: String,
    pub video_state: VideoState,
    /// `None` when the filesystem could not be queried
    pub free_space_bytes: Option<u64>,
    pub recorded_videos_size_bytes: u64,
    pub bitrate: Bitrate,
    pub supported_bitrates: Vec<BitrateInfo>,
}

/// State only touched while holding the request gate
struct Gated {
    bitrate: Bitrate,
}

/// Owns the capture device and serializes every request that may change
/// what it is doing
pub struct Controller {
    settings: ControlSettings,
    gate: Mutex<Gated>,
    shared: Arc<SharedState>,
    camera: Arc<dyn CameraDriver>,
    disk: Arc<dyn DiskSpace>,
    next_worker_id: AtomicU64,
}

impl Controller {
    pub fn new(
        settings: ControlSettings,
        camera: Arc<dyn CameraDriver>,
        disk: Arc<dyn DiskSpace>,
    ) -> Self {
        let bitrate = settings.bitrate;
        Self {
            settings,
            gate: Mutex::new(Gated { bitrate }),
            shared: Arc::new(SharedState::new()),
            camera,
            disk,
            next_worker_id: AtomicU64::new(1),
        }
    }

    pub fn video_state(&self) -> VideoState {
        self.shared.video_state()
    }

    pub fn preview_url(&self) -> &str {
        &self.settings.preview_url
    }

    pub fn free_space(&self) -> Result<u64, ControlError> {
        Ok(self.disk.free_space()?)
    }

    pub async fn start_preview(&self) -> Result<(), ControlError> {
        let _gate = self.gate.lock().await;
        self.reap_dead();

        match self.shared.video_state() {
            VideoState::Previewing => return Ok(()),
            VideoState::Recording => {
                return Err(ControlError::Conflict(
                    "cannot preview while recording in progress",
                ))
            }
            VideoState::Idle => {}
        }

        let id = self.next_id();
        let stop = CancellationToken::new();
        let task = run_preview(
            self.settings.preview_command.clone(),
            self.settings.timings,
            self.shared.clone(),
            id,
            stop.clone(),
        );
        self.shared.spawn(Activity::Preview, id, stop, task);

        let started = await_state(
            &self.shared,
            Activity::Preview,
            "previewing start",
            &self.settings.timings,
            |state| state == VideoState::Previewing,
        )
        .await;
        if !started {
            self.shared.force_clean(Activity::Preview);
            return Err(ControlError::OperationTimeout("start previewing"));
        }
        Ok(())
    }

    /// Always leaves the preview slot empty, even when the wait fails
    pub async fn stop_preview(&self) -> Result<(), ControlError> {
        let _gate = self.gate.lock().await;
        self.reap_dead();
        self.stop_activity(Activity::Preview, "previewing stop", "stop previewing")
            .await
    }

    pub async fn start_recording(&self) -> Result<(), ControlError> {
        let gate = self.gate.lock().await;
        self.reap_dead();

        match self.shared.video_state() {
            VideoState::Recording => return Ok(()),
            VideoState::Previewing => {
                return Err(ControlError::Conflict(
                    "cannot record while previewing in progress",
                ))
            }
            VideoState::Idle => {}
        }

        let free_bytes = self.disk.free_space()?;
        if free_bytes <= self.settings.min_free_space_bytes {
            return Err(ControlError::InsufficientStorage { free_bytes });
        }
        let folder = self.recordings_folder()?;

        let id = self.next_id();
        let stop = CancellationToken::new();
        let job = RecordingJob {
            folder,
            segment_duration: self.settings.segment_duration,
            bitrate: gate.bitrate,
            min_free_space_bytes: self.settings.min_free_space_bytes,
            timings: self.settings.timings,
            camera: self.camera.clone(),
            disk: self.disk.clone(),
        };
        let task = run_recording(job, self.shared.clone(), id, stop.clone());
        self.shared.spawn(Activity::Recording, id, stop, task);

        let started = await_state(
            &self.shared,
            Activity::Recording,
            "recording start",
            &self.settings.timings,
            |state| state == VideoState::Recording,
        )
        .await;
        if !started {
            self.shared.force_clean(Activity::Recording);
            return Err(ControlError::OperationTimeout("start recording"));
        }
        Ok(())
    }

    /// Always leaves the recording slot empty and the camera released
    pub async fn stop_recording(&self) -> Result<(), ControlError> {
        let _gate = self.gate.lock().await;
        self.reap_dead();
        self.stop_activity(Activity::Recording, "recording stop", "stop recording")
            .await
    }

    pub async fn set_bitrate(&self, name: &str) -> Result<(), ControlError> {
        let mut gate = self.gate.lock().await;
        self.reap_dead();

        if self.shared.video_state() == VideoState::Recording {
            return Err(ControlError::Conflict("cannot change bitrate while recording"));
        }
        let bitrate =
            Bitrate::from_name(name).ok_or_else(|| ControlError::UnknownSetting(name.to_string()))?;
        info!("Bitrate changed from {} to {}", gate.bitrate, bitrate);
        gate.bitrate = bitrate;
        Ok(())
    }

    pub async fn delete_recordings(&self) -> Result<(), ControlError> {
        let _gate = self.gate.lock().await;
        self.reap_dead();

        if self.shared.video_state() == VideoState::Recording {
            return Err(ControlError::Conflict(
                "cannot remove recorded videos during recording",
            ));
        }
        let folder = &self.settings.recordings_folder;
        match tokio::fs::remove_dir_all(folder).await {
            Ok(()) => info!("Removed recorded videos in {:?}", folder),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Snapshot for the status routes. Dead workers found here are cleaned up
    /// before the snapshot is taken.
    pub async fn status(&self) -> StatusSnapshot {
        let gate = self.gate.lock().await;
        self.reap_dead();

        let free_space_bytes = match self.disk.free_space() {
            Ok(free) => Some(free),
            Err(e) => {
                warn!("Could not query free space: {}", e);
                None
            }
        };
        let recorded_videos_size_bytes = self
            .recordings_folder()
            .and_then(|folder| folder_size(&folder))
            .unwrap_or_else(|e| {
                warn!("Could not measure recorded videos: {}", e);
                0
            });

        StatusSnapshot {
            video_preview_url: self.settings.preview_url.clone(),
            video_state: self.shared.video_state(),
            free_space_bytes,
            recorded_videos_size_bytes,
            bitrate: gate.bitrate,
            supported_bitrates: Bitrate::ALL.iter().map(|b| b.info()).collect(),
        }
    }

    /// Stream a zip of every recorded file. The gate is held only while the
    /// folder is listed; the archive is produced on the blocking pool as the
    /// client reads it, so a slow download never delays other requests.
    pub async fn archive_recordings(&self) -> Result<DuplexStream, ControlError> {
        let (folder, names) = {
            let _gate = self.gate.lock().await;
            let folder = self.recordings_folder()?;
            let names = archive_entries(&folder)?;
            (folder, names)
        };

        let (reader, writer) = tokio::io::duplex(ARCHIVE_PIPE_CAPACITY);
        let sink = SyncIoBridge::new(writer);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = write_archive(&folder, &names, sink) {
                warn!("Recordings archive aborted: {}", e);
            }
        });
        Ok(reader)
    }

    /// Stop whatever is running, preview first
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_preview().await {
            error!("Failed to stop video preview on shutdown: {}", e);
        }
        if let Err(e) = self.stop_recording().await {
            error!("Failed to stop video recording on shutdown: {}", e);
        }
    }

    async fn stop_activity(
        &self,
        activity: Activity,
        operation: &str,
        failure: &'static str,
    ) -> Result<(), ControlError> {
        let active = activity.active_state();
        let mut result = Ok(());

        if self.shared.video_state() == active {
            self.shared.request_stop(activity);
            let stopped = await_state(
                &self.shared,
                activity,
                operation,
                &self.settings.timings,
                |state| state != active,
            )
            .await;
            if !stopped {
                result = Err(ControlError::OperationTimeout(failure));
            }
        }

        self.shared.force_clean(activity);
        result
    }

    fn reap_dead(&self) {
        if self.shared.reap_dead(Activity::Preview) {
            error!("Previewing failure detected, cleaning up");
        }
        if self.shared.reap_dead(Activity::Recording) {
            error!("Recording failure detected, cleaning up");
        }
    }

    /// The recordings folder, created if missing
    fn recordings_folder(&self) -> io::Result<PathBuf> {
        let folder = &self.settings.recordings_folder;
        std::fs::create_dir_all(folder)?;
        Ok(folder.clone())
    }

    fn next_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }
}
