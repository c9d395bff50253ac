//! Owned background task handles.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BACKGROUND_TASK_TAG: &str = "BackgroundTask:";
const BACKGROUND_TASK_FN_STOP_TAG: &str = "stop():";

/// A spawned task plus the token that asks it to finish.
pub(crate) struct BackgroundTask {
    name: &'static str,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(stop.clone()));
        debug!("{BACKGROUND_TASK_TAG} spawned {name}");
        Self { name, stop, handle }
    }

    /// Runs `tick` every `period` until stopped.
    pub(crate) fn spawn_periodic<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn(name, move |stop| async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => tick(),
                }
            }
        })
    }

    /// Requests a stop and waits for the task to finish.
    pub(crate) async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            warn!(
                "{BACKGROUND_TASK_TAG}:{BACKGROUND_TASK_FN_STOP_TAG} {} ended abnormally: {err}",
                self.name
            );
        } else {
            debug!("{BACKGROUND_TASK_TAG}:{BACKGROUND_TASK_FN_STOP_TAG} {} joined", self.name);
        }
    }
}
