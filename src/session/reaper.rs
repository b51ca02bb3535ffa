//! Background deadline enforcement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::session::CommandDispatcher;

/// Periodically expires sandboxes whose deadline has passed, so idle
/// sandboxes are released even when no tool calls arrive.
#[derive(Debug)]
pub struct Reaper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Starts the sweep loop on the current tokio runtime.
    #[must_use]
    pub fn spawn(dispatcher: Arc<CommandDispatcher>, every: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_ms = every.as_millis(), "Reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = dispatcher.sweep_now().await;
                        if expired > 0 {
                            info!(expired, "Reaper expired sandboxes");
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Reaper stopped");
        });

        Self { stop, task }
    }

    /// Stops the loop and waits for an in-progress sweep to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reaper task ended abnormally");
        }
    }
}
