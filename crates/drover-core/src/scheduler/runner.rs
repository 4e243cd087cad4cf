//! Background scheduler runner: a tokio loop driving the periodic cycle
//! and the offline reaper, stopped through a cancellation token.

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ControlConfig;
use crate::coordination::Coordination;
use crate::registry;
use crate::scheduler;

/// Handle to the background scheduler loop.
pub struct SchedulerRunner {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SchedulerRunner {
    /// Spawn the loop. Every tick runs the offline reaper and one
    /// scheduling cycle; individual failures are logged, never fatal.
    pub fn spawn(pool: PgPool, coord: Coordination, config: ControlConfig) -> Self {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.scheduler_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!(
                interval_secs = config.scheduler_interval.as_secs(),
                "scheduler runner started"
            );

            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => {
                        tracing::info!("scheduler runner stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = registry::reap_stale_workers(&pool, &coord, &config).await {
                            tracing::error!(error = %e, "offline reaper failed");
                        }
                        match scheduler::run_cycle(&pool, &coord, &config).await {
                            Ok(result) if !result.errors.is_empty() => {
                                tracing::warn!(
                                    errors = result.errors.len(),
                                    "scheduling cycle finished with errors"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "scheduling cycle failed");
                            }
                        }
                    }
                }
            }
        });

        Self { handle, cancel }
    }

    /// Request shutdown and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "scheduler runner join failed");
        }
    }

    /// Token other components can use to observe shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
