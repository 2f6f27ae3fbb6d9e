//! Delayed-call poller.
//!
//! Waits, timeouts and retry back-off are persisted as delayed-call rows; the
//! poller only turns due rows into [`Engine::process_due_calls`] invocations.
//! Any number of pollers may run against one store: claims are leased, so a
//! call is delivered at least once and re-delivered if its poller dies.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::repository::ExecutionStore;

use super::engine::Engine;
use super::executor::ActionExecutor;

pub struct DelayedCallPoller<S: ExecutionStore, X: ActionExecutor> {
    engine: Arc<Engine<S, X>>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<S, X> DelayedCallPoller<S, X>
where
    S: ExecutionStore + 'static,
    X: ActionExecutor + 'static,
{
    /// Poll every `poll_interval_ms` of the engine's config.
    pub fn new(engine: Arc<Engine<S, X>>, cancel: CancellationToken) -> Self {
        let interval = Duration::from_millis(engine.config().poll_interval_ms.max(1));
        Self {
            engine,
            interval,
            cancel,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "delayed-call poller started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.engine.process_due_calls(Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(processed = n, "processed delayed calls"),
                        Err(e) => tracing::warn!(error = %e, "delayed-call poll failed"),
                    }
                }
            }
        }
        tracing::debug!("delayed-call poller stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
