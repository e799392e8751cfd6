//! Background worker slots and the bounded wait used by control requests
//!
//! Each activity (preview, recording) owns at most one worker: a tokio task
//! plus the cancellation token it polls. Every write to the published video
//! state happens while holding the slot lock, so the state is never observed
//! out of step with which workers exist.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Activity, VideoState};
use crate::config::Timings;

/// A running background task and its stop flag
struct Worker {
    /// Generation id, unique per spawned worker
    id: u64,
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl Worker {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    fn abort(self) {
        self.stop.cancel();
        self.handle.abort();
    }
}

#[derive(Default)]
struct Slots {
    preview: Option<Worker>,
    recording: Option<Worker>,
}

impl Slots {
    fn slot(&mut self, activity: Activity) -> &mut Option<Worker> {
        match activity {
            Activity::Preview => &mut self.preview,
            Activity::Recording => &mut self.recording,
        }
    }
}

/// Video state plus the worker slots that are allowed to change it
pub(crate) struct SharedState {
    video_state: watch::Sender<VideoState>,
    slots: Mutex<Slots>,
}

impl SharedState {
    pub fn new() -> Self {
        let (video_state, _) = watch::channel(VideoState::Idle);
        Self {
            video_state,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Best-effort snapshot, may race with a worker's own cleanup
    pub fn video_state(&self) -> VideoState {
        *self.video_state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<VideoState> {
        self.video_state.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn `task` as the worker for `activity`.
    ///
    /// The slot is filled before the task can observe it, so the task's own
    /// `activate`/`finish` calls always find their generation in place.
    pub fn spawn<F>(&self, activity: Activity, id: u64, stop: CancellationToken, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.lock();
        let slot = slots.slot(activity);
        if let Some(previous) = slot.take() {
            debug!("Replacing {:?} worker {} with {}", activity, previous.id, id);
            previous.abort();
        }
        let handle = tokio::spawn(task);
        *slot = Some(Worker { id, handle, stop });
    }

    /// Flip to the activity's active state if worker `id` still owns the slot
    pub fn activate(&self, activity: Activity, id: u64) -> bool {
        let mut slots = self.lock();
        let owned = matches!(
            slots.slot(activity).as_ref(),
            Some(worker) if worker.id == id && !worker.stop.is_cancelled()
        );
        if owned {
            self.video_state.send_replace(activity.active_state());
        }
        owned
    }

    /// Terminal cleanup run by worker `id` itself when its loop ends
    pub fn finish(&self, activity: Activity, id: u64) {
        let mut slots = self.lock();
        let slot = slots.slot(activity);
        if !matches!(slot.as_ref(), Some(worker) if worker.id == id) {
            debug!("{:?} worker {} no longer owns its slot", activity, id);
            return;
        }
        // Dropping our own join handle just detaches it
        slot.take();
        self.reset_if_active(activity);
    }

    /// Ask the activity's worker to stop at its next check
    pub fn request_stop(&self, activity: Activity) {
        if let Some(worker) = self.lock().slot(activity).as_ref() {
            worker.stop.cancel();
        }
    }

    pub fn is_alive(&self, activity: Activity) -> bool {
        self.lock()
            .slot(activity)
            .as_ref()
            .map(Worker::is_alive)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn has_worker(&self, activity: Activity) -> bool {
        self.lock().slot(activity).is_some()
    }

    /// Drop the activity's worker (aborting it if still running) and return
    /// its state to idle
    pub fn force_clean(&self, activity: Activity) {
        let mut slots = self.lock();
        if let Some(worker) = slots.slot(activity).take() {
            debug!("Force-cleaning {:?} worker {}", activity, worker.id);
            worker.abort();
        }
        self.reset_if_active(activity);
    }

    /// Force-clean the activity if its worker has died. Returns true when a
    /// dead worker was found.
    pub fn reap_dead(&self, activity: Activity) -> bool {
        let dead = matches!(self.lock().slot(activity).as_ref(), Some(worker) if !worker.is_alive());
        if dead {
            self.force_clean(activity);
        }
        dead
    }

    fn reset_if_active(&self, activity: Activity) {
        self.video_state.send_if_modified(|state| {
            if *state == activity.active_state() {
                *state = VideoState::Idle;
                true
            } else {
                false
            }
        });
    }
}

/// Wait until `predicate` holds for the published video state.
///
/// Gives up when the activity's worker is gone without the predicate holding,
/// or when the request timeout elapses. Returns whether the predicate was met.
pub(crate) async fn await_state<P>(
    shared: &SharedState,
    activity: Activity,
    operation: &str,
    timings: &Timings,
    predicate: P,
) -> bool
where
    P: Fn(VideoState) -> bool,
{
    let mut state_rx = shared.subscribe();
    let started = Instant::now();
    let period = timings.poll_interval();
    let mut ticker = tokio::time::interval_at(started + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if predicate(*state_rx.borrow_and_update()) {
            return true;
        }
        if !shared.is_alive(activity) {
            // The worker may have reached the target right before exiting
            if predicate(shared.video_state()) {
                return true;
            }
            critical!(
                "Task of `{}` is dead but the operation was not successful",
                operation
            );
            return false;
        }
        if started.elapsed() >= timings.request_timeout() {
            critical!("Operation `{}` timed out but its task is still alive", operation);
            return false;
        }

        tokio::select! {
            _ = ticker.tick() => {
                info!("Waiting for `{}`...", operation);
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return predicate(shared.video_state());
                }
            }
        }
    }
}
