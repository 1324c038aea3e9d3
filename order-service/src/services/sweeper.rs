//! Background expiry of unpaid ONLINE orders.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::services::orchestrator::OrderOrchestrator;

pub struct ExpirySweeper {
    orchestrator: OrderOrchestrator,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl ExpirySweeper {
    pub fn new(orchestrator: OrderOrchestrator, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval: interval.max(Duration::from_secs(1)),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Starting expiry sweeper");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Expiry sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let now = self.orchestrator.now();
                    if let Err(e) = self.orchestrator.expire_pending_orders(now).await {
                        tracing::warn!(error = %e, "Expiry sweep failed");
                    }
                }
            }
        }
    }
}
