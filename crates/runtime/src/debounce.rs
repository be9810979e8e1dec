use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep_until};

/// Trailing-edge debounce timer.
///
/// Every `arm` pushes the deadline `delay` into the future; `fired` resolves
/// once the last arm has been quiet for `delay`. An unarmed timer never fires,
/// so `fired` can sit in a `select!` loop unconditionally.
#[derive(Debug)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn arm(&mut self) {
        let at = Instant::now() + self.delay;
        match &mut self.deadline {
            Some(sleep) => sleep.as_mut().reset(at),
            None => self.deadline = Some(Box::pin(sleep_until(at))),
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Cancel safe: dropping the future leaves the timer armed.
    pub async fn fired(&mut self) {
        match &mut self.deadline {
            Some(sleep) => {
                sleep.as_mut().await;
                self.deadline = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Debounce;
    use tokio::time::{Instant, timeout};

    #[tokio::test(start_paused = true)]
    async fn rearming_pushes_the_deadline() {
        let mut d = Debounce::new(Duration::from_millis(250));
        let start = Instant::now();
        d.arm();
        tokio::time::sleep(Duration::from_millis(100)).await;
        d.arm();
        d.fired().await;
        assert_eq!(start.elapsed(), Duration::from_millis(350));
        assert!(!d.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_never_fires() {
        let mut d = Debounce::new(Duration::from_millis(10));
        assert!(timeout(Duration::from_secs(5), d.fired()).await.is_err());

        d.arm();
        d.cancel();
        assert!(timeout(Duration::from_secs(5), d.fired()).await.is_err());
    }
}
