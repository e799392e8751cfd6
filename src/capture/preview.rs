//! Preview worker: keeps the preview streamer running until told to stop

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::process::{ProcessGroup, Signal};
use crate::config::Timings;
use crate::control::{Activity, SharedState};

/// Run the preview command, restarting it whenever it dies, until `stop` is
/// cancelled. Publishes `previewing` once the first process is up and returns
/// the state to idle on the way out.
pub(crate) async fn run_preview(
    command: String,
    timings: Timings,
    shared: Arc<SharedState>,
    id: u64,
    stop: CancellationToken,
) {
    info!("Starting video preview");

    while !stop.is_cancelled() {
        let mut process = match ProcessGroup::spawn_shell("video preview", &command) {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to start video preview: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(timings.poll_interval()) => {}
                    _ = stop.cancelled() => {}
                }
                continue;
            }
        };

        if !shared.activate(Activity::Preview, id) {
            // Superseded or stopped between spawn and activation
            let _ = process
                .shutdown(Signal::Terminate, timings.preview_grace())
                .await;
            break;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(timings.poll_interval()) => {
                    match process.try_exited() {
                        Ok(None) => {}
                        Ok(Some(status)) => {
                            warn!("Video preview process has died ({}) - restarting", status);
                            break;
                        }
                        Err(e) => {
                            warn!("Could not poll video preview process: {} - restarting", e);
                            break;
                        }
                    }
                }
                _ = stop.cancelled() => {
                    info!("Stopping video preview");
                    if let Err(e) = process
                        .shutdown(Signal::Terminate, timings.preview_grace())
                        .await
                    {
                        error!("Failed to stop {}: {}", process.label(), e);
                    }
                    break;
                }
            }
        }
    }

    shared.finish(Activity::Preview, id);
    info!("Video preview stopped");
}
