//! Recording worker
//!
//! Holds the camera for as long as recording is requested, writing one file
//! per segment and rotating on a timer. Camera failures never end the worker:
//! they are logged and retried with exponential backoff until a stop request
//! arrives or storage runs out.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::camera::{CameraDriver, CameraSession, DeviceError};
use super::storage::DiskSpace;
use crate::config::Timings;
use crate::control::{critical, Activity, SharedState};

/// Supported recording bitrates, addressed by their short name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Bitrate {
    #[serde(rename = "1")]
    One,
    #[default]
    #[serde(rename = "2.5")]
    TwoAndHalf,
    #[serde(rename = "4.5")]
    FourAndHalf,
}

/// Public description of a bitrate, as listed in the status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BitrateInfo {
    pub description: &'static str,
    pub name: &'static str,
    pub value: u32,
}

impl Bitrate {
    pub const ALL: [Bitrate; 3] = [Bitrate::One, Bitrate::TwoAndHalf, Bitrate::FourAndHalf];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|bitrate| bitrate.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Bitrate::One => "1",
            Bitrate::TwoAndHalf => "2.5",
            Bitrate::FourAndHalf => "4.5",
        }
    }

    /// Bits per second
    pub fn value(self) -> u32 {
        match self {
            Bitrate::One => 1_000_000,
            Bitrate::TwoAndHalf => 2_500_000,
            Bitrate::FourAndHalf => 4_500_000,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Bitrate::One => "1 Mbit/s (YouTube 480p)",
            Bitrate::TwoAndHalf => "2.5 Mbit/s (YouTube 720p)",
            Bitrate::FourAndHalf => "4.5 Mbit/s (YouTube 1080p)",
        }
    }

    pub fn info(self) -> BitrateInfo {
        BitrateInfo {
            description: self.description(),
            name: self.name(),
            value: self.value(),
        }
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Doubling retry delay with an upper bound
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    /// The delay to wait now; the following one doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Path of a segment started at `now`: local time, second granularity
pub fn segment_path(folder: &Path, now: DateTime<Local>) -> PathBuf {
    folder.join(format!("{}.h264", now.format("%Y_%m_%d__%H_%M_%S")))
}

/// Everything a recording worker needs, fixed when it is spawned
pub(crate) struct RecordingJob {
    pub folder: PathBuf,
    pub segment_duration: Duration,
    pub bitrate: Bitrate,
    pub min_free_space_bytes: u64,
    pub timings: Timings,
    pub camera: Arc<dyn CameraDriver>,
    pub disk: Arc<dyn DiskSpace>,
}

/// Why a camera session ended without a device error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    StorageExhausted,
    /// The worker lost its slot before it could publish `recording`
    Superseded,
}

pub(crate) async fn run_recording(
    job: RecordingJob,
    shared: Arc<SharedState>,
    id: u64,
    stop: CancellationToken,
) {
    info!("Starting video recording worker");
    let mut backoff = Backoff::new(job.timings.retry_initial(), job.timings.retry_max());

    while !stop.is_cancelled() {
        match record_session(&job, &shared, id, &stop).await {
            Ok(SessionEnd::Stopped) | Ok(SessionEnd::Superseded) => break,
            Ok(SessionEnd::StorageExhausted) => {
                warn!("Stopping recording: free space is at or below the configured minimum");
                break;
            }
            Err(e) => {
                critical!("Caught error while trying to perform recording: {}", e);
                let delay = backoff.next_delay();
                info!("Retrying recording in {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.cancelled() => break,
                }
            }
        }
    }

    shared.finish(Activity::Recording, id);
    info!("Video recording worker stopped");
}

/// One camera session: acquire, publish `recording`, record, always release
async fn record_session(
    job: &RecordingJob,
    shared: &SharedState,
    id: u64,
    stop: &CancellationToken,
) -> Result<SessionEnd, DeviceError> {
    let mut session = job.camera.acquire().await?;

    // Only a held camera counts as recording
    if !shared.activate(Activity::Recording, id) {
        let _ = session.close().await;
        return Ok(SessionEnd::Superseded);
    }

    let result = perform_recording(job, session.as_mut(), stop).await;
    if let Err(e) = session.close().await {
        warn!("Failed to close camera cleanly: {}", e);
    }
    result
}

async fn perform_recording(
    job: &RecordingJob,
    session: &mut dyn CameraSession,
    stop: &CancellationToken,
) -> Result<SessionEnd, DeviceError> {
    let mut current = segment_path(&job.folder, Local::now());
    info!(
        "Starting recording of {} with bitrate {}",
        current.display(),
        job.bitrate
    );
    session.start_recording(&current, job.bitrate).await?;
    let mut segment_started = Instant::now();

    loop {
        if stop.is_cancelled() {
            return Ok(SessionEnd::Stopped);
        }
        match job.disk.free_space() {
            Ok(free) if free <= job.min_free_space_bytes => {
                return Ok(SessionEnd::StorageExhausted);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not query free space: {}", e),
        }

        tokio::select! {
            waited = session.wait_recording(job.timings.poll_interval()) => waited?,
            _ = stop.cancelled() => return Ok(SessionEnd::Stopped),
        }

        if segment_started.elapsed() > job.segment_duration {
            let next = segment_path(&job.folder, Local::now());
            info!(
                "Stopping recording of {}, starting recording of {}",
                current.display(),
                next.display()
            );
            session.split_recording(&next).await?;
            current = next;
            segment_started = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{await_state, VideoState};
    use crate::testing::{FakeCamera, FakeDisk};
    use chrono::TimeZone;

    #[test]
    fn test_bitrate_lookup() {
        assert_eq!(Bitrate::from_name("4.5"), Some(Bitrate::FourAndHalf));
        assert_eq!(Bitrate::from_name("3"), None);
        assert_eq!(Bitrate::default().value(), 2_500_000);

        let info = serde_json::to_value(Bitrate::One.info()).unwrap();
        assert_eq!(
            info,
            serde_json::json!({
                "description": "1 Mbit/s (YouTube 480p)",
                "name": "1",
                "value": 1_000_000,
            })
        );
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn test_segment_path_format() {
        let now = Local.with_ymd_and_hms(2026, 3, 7, 9, 5, 1).unwrap();
        let path = segment_path(Path::new("/videos"), now);
        assert_eq!(path, PathBuf::from("/videos/2026_03_07__09_05_01.h264"));
    }

    fn job(camera: &FakeCamera, disk: &FakeDisk, folder: &Path, timings: Timings) -> RecordingJob {
        RecordingJob {
            folder: folder.to_path_buf(),
            segment_duration: Duration::from_secs(1),
            bitrate: Bitrate::FourAndHalf,
            min_free_space_bytes: 100,
            timings,
            camera: Arc::new(camera.clone()),
            disk: Arc::new(disk.clone()),
        }
    }

    fn spawn(shared: &Arc<SharedState>, job: RecordingJob) {
        spawn_worker(shared, 1, job);
    }

    fn spawn_worker(shared: &Arc<SharedState>, id: u64, job: RecordingJob) {
        let stop = CancellationToken::new();
        shared.spawn(
            Activity::Recording,
            id,
            stop.clone(),
            run_recording(job, shared.clone(), id, stop),
        );
    }

    /// Poll `condition` every few milliseconds for up to `limit`
    async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_segments_rotate_with_later_names() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new();
        let disk = FakeDisk::new(u64::MAX);
        let timings = Timings::scaled(Duration::from_millis(100));
        let shared = Arc::new(SharedState::new());
        spawn(&shared, job(&camera, &disk, dir.path(), timings));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shared.request_stop(Activity::Recording);
        assert!(
            await_state(&shared, Activity::Recording, "stop", &timings, |s| {
                s == VideoState::Idle
            })
            .await
        );

        let outputs = camera.outputs();
        assert!(outputs.len() >= 2, "expected rotation, got {:?}", outputs);
        assert!(outputs.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(camera.bitrates(), vec![Bitrate::FourAndHalf]);
        assert_eq!(camera.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_storage_exhaustion_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new();
        let disk = FakeDisk::new(u64::MAX);
        let timings = Timings::scaled(Duration::from_millis(20));
        let shared = Arc::new(SharedState::new());
        spawn(&shared, job(&camera, &disk, dir.path(), timings));

        assert!(
            await_state(&shared, Activity::Recording, "start", &timings, |s| {
                s == VideoState::Recording
            })
            .await
        );

        disk.set_free(100);
        assert!(
            await_state(&shared, Activity::Recording, "exhaust", &timings, |s| {
                s == VideoState::Idle
            })
            .await
        );
        assert!(!shared.has_worker(Activity::Recording));
        assert_eq!(camera.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_acquire_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new();
        camera.fail_next_acquires(2);
        let disk = FakeDisk::new(u64::MAX);
        let timings = Timings::scaled(Duration::from_millis(20));
        let shared = Arc::new(SharedState::new());
        spawn(&shared, job(&camera, &disk, dir.path(), timings));

        // Backoff waits 1 then 2 units before the third attempt succeeds
        assert!(
            await_state(&shared, Activity::Recording, "start", &timings, |s| {
                s == VideoState::Recording
            })
            .await
        );
        assert_eq!(camera.acquisitions(), 3);

        shared.request_stop(Activity::Recording);
        assert!(
            await_state(&shared, Activity::Recording, "stop", &timings, |s| {
                s == VideoState::Idle
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_session_failure_releases_camera_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new();
        camera.fail_next_waits(1);
        let disk = FakeDisk::new(u64::MAX);
        let timings = Timings::scaled(Duration::from_millis(20));
        let shared = Arc::new(SharedState::new());
        spawn(&shared, job(&camera, &disk, dir.path(), timings));

        // First session dies while recording, the second one keeps going
        assert!(eventually(Duration::from_secs(2), || camera.acquisitions() == 2).await);
        assert!(eventually(Duration::from_secs(2), || camera.open_sessions() == 1).await);
        assert_eq!(camera.closes(), 1);
        assert_eq!(shared.video_state(), VideoState::Recording);
        assert_eq!(camera.bitrates().len(), 2);

        shared.request_stop(Activity::Recording);
        assert!(
            await_state(&shared, Activity::Recording, "stop", &timings, |s| {
                s == VideoState::Idle
            })
            .await
        );
        assert_eq!(camera.open_sessions(), 0);
        assert_eq!(camera.closes(), 2);
    }

    #[tokio::test]
    async fn test_stop_interrupts_backoff_after_session_failure() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new();
        camera.fail_next_waits(1);
        let disk = FakeDisk::new(u64::MAX);
        let timings = Timings {
            retry_initial_ms: 60_000,
            ..Timings::scaled(Duration::from_millis(20))
        };
        let shared = Arc::new(SharedState::new());
        spawn(&shared, job(&camera, &disk, dir.path(), timings));

        // Camera released, worker sleeping out a long backoff
        assert!(eventually(Duration::from_secs(2), || camera.closes() == 1).await);
        assert_eq!(camera.open_sessions(), 0);
        assert_eq!(shared.video_state(), VideoState::Recording);
        assert!(shared.is_alive(Activity::Recording));

        let started = Instant::now();
        shared.request_stop(Activity::Recording);
        assert!(
            await_state(&shared, Activity::Recording, "stop", &timings, |s| {
                s == VideoState::Idle
            })
            .await
        );
        assert!(started.elapsed() < timings.request_timeout());
        assert!(!shared.has_worker(Activity::Recording));
        assert_eq!(camera.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_new_worker_starts_with_initial_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new();
        let disk = FakeDisk::new(u64::MAX);
        let timings = Timings::scaled(Duration::from_millis(100));
        let shared = Arc::new(SharedState::new());

        // First worker backs off 1 then 2 units and is stopped during the third
        camera.fail_next_acquires(usize::MAX);
        spawn_worker(&shared, 1, job(&camera, &disk, dir.path(), timings));
        assert!(eventually(Duration::from_secs(2), || camera.acquisitions() == 3).await);
        shared.request_stop(Activity::Recording);
        assert!(eventually(Duration::from_secs(1), || !shared.has_worker(Activity::Recording)).await);

        camera.fail_next_acquires(1);
        spawn_worker(&shared, 2, job(&camera, &disk, dir.path(), timings));
        assert!(
            await_state(&shared, Activity::Recording, "start", &timings, |s| {
                s == VideoState::Recording
            })
            .await
        );

        let times = camera.acquisition_times();
        assert_eq!(times.len(), 5);
        assert!(times[2] - times[1] >= timings.retry_initial() * 2);
        // Second worker's first retry is one unit again, not four
        let retry = times[4] - times[3];
        assert!(retry >= timings.retry_initial());
        assert!(retry < timings.retry_initial() * 2, "retry took {:?}", retry);

        shared.force_clean(Activity::Recording);
    }

    #[tokio::test]
    async fn test_state_waits_for_camera() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new();
        camera.block_acquire(true);
        let disk = FakeDisk::new(u64::MAX);
        let timings = Timings::scaled(Duration::from_millis(20));
        let shared = Arc::new(SharedState::new());
        spawn(&shared, job(&camera, &disk, dir.path(), timings));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(shared.video_state(), VideoState::Idle);
        assert!(shared.is_alive(Activity::Recording));

        camera.block_acquire(false);
        assert!(
            await_state(&shared, Activity::Recording, "start", &timings, |s| {
                s == VideoState::Recording
            })
            .await
        );
        shared.force_clean(Activity::Recording);
    }
}
