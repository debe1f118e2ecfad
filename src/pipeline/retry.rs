use std::time::Duration;
use tokio::time::sleep;

/// Doubling delay between retries of a transient store failure
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay the next attempt would wait, or None once retries are spent
    pub fn next_delay(&self) -> Option<Duration> {
        if self.current_attempt >= self.max_retries {
            return None;
        }
        let factor = 2_u32.saturating_pow(self.current_attempt);
        Some(std::cmp::min(
            self.initial_delay.saturating_mul(factor),
            self.max_delay,
        ))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.next_delay().ok_or(MaxRetriesExceeded)?;

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    /// Retries slept so far
    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(300), 4);

        let mut delays = Vec::new();
        while let Some(delay) = backoff.next_delay() {
            delays.push(delay.as_millis());
            backoff.current_attempt += 1;
        }

        assert_eq!(delays, vec![100, 200, 300, 300]);
    }

    #[tokio::test]
    async fn test_sleep_exhausts() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 2);

        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 2);
    }
}
