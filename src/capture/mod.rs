//! Capture device access
//!
//! Supervised external processes for the live preview, the camera seam and
//! segmented recording worker, plus the storage queries both depend on.

mod camera;
mod preview;
mod process;
mod recording;
mod storage;

pub use camera::{CameraDriver, CameraSession, CommandCamera, DeviceError};
pub use recording::{Bitrate, BitrateInfo};
pub use storage::{archive_entries, folder_size, write_archive, DiskSpace, SystemDiskSpace};

pub(crate) use preview::run_preview;
pub(crate) use recording::{run_recording, RecordingJob};
