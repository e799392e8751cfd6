//! In-memory camera and disk used by the lifecycle tests

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::capture::{Bitrate, CameraDriver, CameraSession, DeviceError, DiskSpace};

#[derive(Default)]
struct CameraLog {
    acquired_at: Vec<Instant>,
    failures_left: usize,
    wait_failures_left: usize,
    open_sessions: usize,
    closes: usize,
    outputs: Vec<PathBuf>,
    bitrates: Vec<Bitrate>,
}

/// Camera that writes a few bytes per segment and records what it was asked
#[derive(Clone)]
pub struct FakeCamera {
    log: Arc<Mutex<CameraLog>>,
    blocked: Arc<watch::Sender<bool>>,
    hung: Arc<watch::Sender<bool>>,
}

impl FakeCamera {
    pub fn new() -> Self {
        let (blocked, _) = watch::channel(false);
        let (hung, _) = watch::channel(false);
        Self {
            log: Arc::default(),
            blocked: Arc::new(blocked),
            hung: Arc::new(hung),
        }
    }

    /// Make the next `count` acquisitions fail
    pub fn fail_next_acquires(&self, count: usize) {
        self.log.lock().unwrap().failures_left = count;
    }

    /// Make the next `count` waits on an open session report a device error
    pub fn fail_next_waits(&self, count: usize) {
        self.log.lock().unwrap().wait_failures_left = count;
    }

    /// Hold acquisitions until unblocked
    pub fn block_acquire(&self, blocked: bool) {
        self.blocked.send_replace(blocked);
    }

    /// Make open sessions stop responding: waits and closes never return
    /// until unhung
    pub fn hang_sessions(&self, hung: bool) {
        self.hung.send_replace(hung);
    }

    pub fn acquisitions(&self) -> usize {
        self.log.lock().unwrap().acquired_at.len()
    }

    /// When each acquisition attempt was made, failed ones included
    pub fn acquisition_times(&self) -> Vec<Instant> {
        self.log.lock().unwrap().acquired_at.clone()
    }

    /// Sessions released through `close`, as opposed to just dropped
    pub fn closes(&self) -> usize {
        self.log.lock().unwrap().closes
    }

    pub fn open_sessions(&self) -> usize {
        self.log.lock().unwrap().open_sessions
    }

    pub fn outputs(&self) -> Vec<PathBuf> {
        self.log.lock().unwrap().outputs.clone()
    }

    pub fn bitrates(&self) -> Vec<Bitrate> {
        self.log.lock().unwrap().bitrates.clone()
    }
}

#[async_trait]
impl CameraDriver for FakeCamera {
    async fn acquire(&self) -> Result<Box<dyn CameraSession>, DeviceError> {
        let mut blocked = self.blocked.subscribe();
        let _ = blocked.wait_for(|blocked| !*blocked).await;

        let mut log = self.log.lock().unwrap();
        log.acquired_at.push(Instant::now());
        if log.failures_left > 0 {
            log.failures_left -= 1;
            return Err(DeviceError::Unavailable(PathBuf::from("/dev/fake")));
        }
        log.open_sessions += 1;
        Ok(Box::new(FakeSession {
            log: self.log.clone(),
            hung: self.hung.clone(),
        }))
    }
}

struct FakeSession {
    log: Arc<Mutex<CameraLog>>,
    hung: Arc<watch::Sender<bool>>,
}

impl FakeSession {
    async fn wait_while_hung(&self) {
        let mut hung = self.hung.subscribe();
        let _ = hung.wait_for(|hung| !*hung).await;
    }

    fn write_segment(&self, output: &Path) -> Result<(), DeviceError> {
        std::fs::write(output, b"frames")?;
        self.log.lock().unwrap().outputs.push(output.to_path_buf());
        Ok(())
    }
}

#[async_trait]
impl CameraSession for FakeSession {
    async fn start_recording(
        &mut self,
        output: &Path,
        bitrate: Bitrate,
    ) -> Result<(), DeviceError> {
        self.log.lock().unwrap().bitrates.push(bitrate);
        self.write_segment(output)
    }

    async fn split_recording(&mut self, output: &Path) -> Result<(), DeviceError> {
        self.write_segment(output)
    }

    async fn wait_recording(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let failed = {
            let mut log = self.log.lock().unwrap();
            let failed = log.wait_failures_left > 0;
            if failed {
                log.wait_failures_left -= 1;
            }
            failed
        };
        if failed {
            return Err(io::Error::other("encoder stopped unexpectedly").into());
        }

        self.wait_while_hung().await;
        tokio::time::sleep(timeout).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.wait_while_hung().await;
        self.log.lock().unwrap().closes += 1;
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if let Ok(mut log) = self.log.lock() {
            log.open_sessions -= 1;
        }
    }
}

/// Disk whose free space the test sets
#[derive(Clone)]
pub struct FakeDisk {
    free: Arc<AtomicU64>,
}

impl FakeDisk {
    pub fn new(free: u64) -> Self {
        Self {
            free: Arc::new(AtomicU64::new(free)),
        }
    }

    pub fn set_free(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

impl DiskSpace for FakeDisk {
    fn free_space(&self) -> io::Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }
}
