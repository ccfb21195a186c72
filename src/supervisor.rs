//! Liveness checking and reconnect policy for the wire client.
//!
//! The client only records when it last heard a heartbeat and reports lost
//! connections; deciding when and how often to reconnect happens here.

use crate::client::Client;
use crate::error::ClientError;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, sleep};

/// Exponential backoff with a cap and an optional attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
        }
    }

    /// Delay to wait before the zero-based `attempt`, or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.min(31));
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Whether a connection whose last heartbeat arrived at `last` should be
/// considered dead at `now`.
pub fn is_stalled(now: Instant, last: Option<Instant>, timeout: Duration) -> bool {
    match last {
        Some(last) => now.saturating_duration_since(last) > timeout,
        None => false,
    }
}

pub struct Supervisor {
    client: Arc<Client>,
    check_interval: Duration,
    heartbeat_timeout: Duration,
    reconnect: Backoff,
}

impl Supervisor {
    pub fn new(
        client: Arc<Client>,
        check_interval: Duration,
        heartbeat_timeout: Duration,
        reconnect: Backoff,
    ) -> Self {
        Self {
            client,
            check_interval,
            heartbeat_timeout,
            reconnect,
        }
    }

    /// Watches the connection until reconnecting is given up. Meant to be
    /// spawned; stop it by aborting the task.
    pub async fn run(self) -> Result<(), ClientError> {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.client.is_connected() {
                        continue;
                    }
                    let last = self.client.last_heartbeat_at();
                    if is_stalled(Instant::now(), last, self.heartbeat_timeout) {
                        error!(
                            target: "Supervisor",
                            "No heartbeat from the box for over {}s (last at {:?}), reconnecting",
                            self.heartbeat_timeout.as_secs(),
                            last
                        );
                        self.client.disconnect().await;
                        self.reconnect().await?;
                    } else {
                        debug!(target: "Supervisor", "Connection alive");
                    }
                }
                _ = self.client.connection_lost() => {
                    warn!(target: "Supervisor", "Connection to the box lost, reconnecting");
                    self.reconnect().await?;
                }
            }
        }
    }

    async fn reconnect(&self) -> Result<(), ClientError> {
        let mut attempt = 0u32;
        loop {
            let Some(delay) = self.reconnect.delay_for(attempt) else {
                error!(
                    target: "Supervisor",
                    "Giving up on reconnecting after {attempt} attempts"
                );
                return Err(ClientError::Connection(anyhow::anyhow!(
                    "reconnect gave up after {attempt} attempts"
                )));
            };
            info!(
                target: "Supervisor",
                "Will attempt to reconnect in {:?} (attempt {})",
                delay,
                attempt + 1
            );
            sleep(delay).await;

            match self.client.connect().await {
                Ok(()) => {
                    info!(target: "Supervisor", "Reconnected to the box");
                    return Ok(());
                }
                Err(ClientError::AlreadyConnected) => return Ok(()),
                Err(e) => warn!(target: "Supervisor", "Reconnect attempt failed: {e}"),
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), None);
        let delays: Vec<_> = (0..6).map(|a| b.delay_for(a).unwrap().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(b.delay_for(1000), Some(Duration::from_secs(10)));
    }

    #[test]
    fn backoff_respects_attempt_limit() {
        let b = Backoff::new(Duration::from_secs(5), Duration::from_secs(60), Some(2));
        assert_eq!(b.delay_for(0), Some(Duration::from_secs(5)));
        assert_eq!(b.delay_for(1), Some(Duration::from_secs(10)));
        assert_eq!(b.delay_for(2), None);
    }

    #[test]
    fn stall_detection() {
        let now = Instant::now();
        let timeout = Duration::from_secs(60);
        assert!(!is_stalled(now, None, timeout));
        assert!(!is_stalled(now, Some(now), timeout));
        let later = now + Duration::from_secs(61);
        assert!(is_stalled(later, Some(now), timeout));
        assert!(!is_stalled(now + Duration::from_secs(60), Some(now), timeout));
    }
}
