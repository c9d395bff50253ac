//! Retry timers for dispatched messages.
//!
//! A timer task only sleeps. When it fires it spawns the callback as a separate
//! task, so cancelling a timer can never interrupt a callback that already
//! started; the callback itself re-checks the message state.

use crate::message::MessageId;
use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::trace;

#[derive(Debug)]
pub(crate) struct RetryTimer {
    message_id: MessageId,
    attempt: u32,
    handle: AbortHandle,
}

impl RetryTimer {
    pub(crate) fn schedule<Fut>(
        message_id: MessageId,
        attempt: u32,
        timeout: Duration,
        on_fire: Fut,
    ) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tokio::spawn(on_fire);
        })
        .abort_handle();

        Self {
            message_id,
            attempt,
            handle,
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn cancel(self) {
        trace!(
            "RetryTimer: cancel {} attempt {}",
            self.message_id,
            self.attempt
        );
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::RetryTimer;
    use crate::message::MessageId;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn fires_after_timeout() {
        let (tx, rx) = oneshot::channel();
        let _timer = RetryTimer::schedule(
            MessageId::from("m-1"),
            1,
            Duration::from_millis(10),
            async move {
                let _ = tx.send(());
            },
        );

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("timer fired")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let (tx, rx) = oneshot::channel::<()>();
        let timer = RetryTimer::schedule(
            MessageId::from("m-1"),
            1,
            Duration::from_millis(20),
            async move {
                let _ = tx.send(());
            },
        );
        assert_eq!(timer.attempt(), 1);
        timer.cancel();

        // the sender is dropped with the aborted task, never used
        assert!(tokio::time::timeout(Duration::from_millis(100), rx)
            .await
            .expect("receiver resolves")
            .is_err());
    }
}
