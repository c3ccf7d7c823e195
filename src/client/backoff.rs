use crate::config::types::BackoffConfig;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Exponential retry delay schedule bounded by a retry count, an optional
/// elapsed-time budget and a cancellation token.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    cancel: CancellationToken,
    retries: usize,
    next_delay: Duration,
    started: Instant,
}

impl Backoff {
    pub fn new(config: &BackoffConfig, cancel: CancellationToken) -> Self {
        Self {
            config: config.clone(),
            cancel,
            retries: 0,
            next_delay: config.min_period,
            started: Instant::now(),
        }
    }

    /// Whether another attempt may be made
    pub fn ongoing(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.config.max_retries > 0 && self.retries >= self.config.max_retries {
            return false;
        }
        match self.config.max_elapsed {
            Some(budget) => self.started.elapsed() < budget,
            None => true,
        }
    }

    pub fn num_retries(&self) -> usize {
        self.retries
    }

    /// Count a retry and sleep for the next delay. Returns early when the
    /// token is cancelled; does not sleep at all once the budget is spent.
    pub async fn wait(&mut self) {
        let delay = self.advance();
        if !self.ongoing() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn advance(&mut self) -> Duration {
        self.retries += 1;
        let delay = self.next_delay.min(self.config.max_period);
        self.next_delay = (self.next_delay * 2).min(self.config.max_period);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: usize) -> BackoffConfig {
        BackoffConfig {
            min_period: Duration::from_millis(100),
            max_period: Duration::from_millis(350),
            max_retries,
            max_elapsed: None,
        }
    }

    #[test]
    fn test_delays_double_up_to_max_period() {
        let mut backoff = Backoff::new(&config(0), CancellationToken::new());
        let delays: Vec<u128> = (0..5).map(|_| backoff.advance().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350, 350]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retries_bounds_attempts() {
        let mut backoff = Backoff::new(&config(3), CancellationToken::new());
        let mut attempts = 1;
        loop {
            backoff.wait().await;
            if !backoff.ongoing() {
                break;
            }
            attempts += 1;
        }
        assert_eq!(attempts, 3);
        assert_eq!(backoff.num_retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_delay() {
        let mut backoff = Backoff::new(&config(0), CancellationToken::new());
        let start = Instant::now();
        backoff.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        backoff.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_cancel_stops_backoff() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(
            &BackoffConfig {
                min_period: Duration::from_secs(3600),
                max_period: Duration::from_secs(3600),
                max_retries: 0,
                max_elapsed: None,
            },
            cancel.clone(),
        );
        assert!(backoff.ongoing());

        let waiter = tokio::spawn(async move {
            backoff.wait().await;
            backoff.ongoing()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let ongoing = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("wait should return after cancel")
            .unwrap();
        assert!(!ongoing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_elapsed_budget() {
        let mut backoff = Backoff::new(
            &BackoffConfig {
                min_period: Duration::from_millis(400),
                max_period: Duration::from_secs(10),
                max_retries: 0,
                max_elapsed: Some(Duration::from_secs(1)),
            },
            CancellationToken::new(),
        );
        backoff.wait().await; // 400ms
        assert!(backoff.ongoing());
        backoff.wait().await; // 800ms more
        assert!(!backoff.ongoing());
    }
}
