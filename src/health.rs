//! Periodic health checker.
//!
//! Sleeps for the role's interval, or until something asks for an early
//! check, then runs one check in its own task so a panic there does not
//! take the checker down.  Cancellation interrupts a check in flight.

use std::sync::Arc;

use log::{debug, error, info};
use tokio::time::sleep;

use crate::service::SwarmService;

/// Runs until the service's cancellation token fires.
pub async fn run(service: Arc<SwarmService>) {
    let cancel = service.cancellation().clone();
    info!("Health checker started");

    loop {
        let delay = service.next_health_delay().await;
        let forced = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => false,
            _ = service.health_signal().notified() => true,
        };

        // Give a node that just (re)joined time to come up before pinging it.
        if forced && service.is_controller() {
            let settle = service.health_config().settle_delay;
            debug!("Health check requested, settling for {:?}", settle);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(settle) => {}
            }
        }

        let mut check = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.check_health().await }
        });
        tokio::select! {
            _ = cancel.cancelled() => {
                check.abort();
                break;
            }
            result = &mut check => {
                if let Err(e) = result {
                    error!("Health check failed: {}", e);
                }
            }
        }
    }

    info!("Health checker stopped");
}
