//! Daemon Readiness
//!
//! Bounded poll of the management interface after a daemon start.

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::config::ReadinessPolicy;
use crate::domain::ManagementInterface;
use crate::error::{Error, Result};

/// Poll `mgmt` until it answers or `policy.timeout` elapses.
///
/// Only `NotConnected` is retried; any other error is returned as soon as it
/// is seen. Exhausting the budget yields `ReadinessTimeout`.
pub async fn wait_ready<M>(mgmt: &M, policy: &ReadinessPolicy) -> Result<()>
where
    M: ManagementInterface + ?Sized,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    let outcome = timeout(policy.timeout, async {
        loop {
            attempts += 1;
            match mgmt.list_pools(None).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    debug!(attempt = attempts, error = %e, "daemon not ready yet");
                }
                Err(e) => return Err(e),
            }
            sleep(policy.interval).await;
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => {
            info!(attempts, elapsed = ?started.elapsed(), "Daemon ready");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::ReadinessTimeout {
            waited: started.elapsed(),
            attempts,
        }),
    }
}
