//! Timing helpers: periodic ticks, interruptible backoff, wall-clock millis.
use futures::{FutureExt as _, Stream, future::FusedFuture};
use pin_project_lite::pin_project;

pin_project! {
    /// Fixed-period stream driving the lease sweep.
    ///
    /// Reset on ready so a slow sweep does not cause a burst of catch-up
    /// ticks.
    pub struct Ticker {
        #[pin]
        inner: futures_timer::Delay,
        period: std::time::Duration,
    }
}

impl Ticker {
    pub fn new(period: std::time::Duration) -> Self {
        Self {
            inner: futures_timer::Delay::new(period),
            period,
        }
    }
}

impl Stream for Ticker {
    type Item = ();

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let mut this = self.project();
        let poll = this.inner.as_mut().poll(cx);
        if poll.is_ready() {
            this.inner.reset(*this.period);
        }
        poll.map(Some)
    }
}

/// Sleep for `duration` unless `signal` fires first.
///
/// Returns `true` when the signal fired.
pub(crate) async fn sleep_or_signal<Signal>(
    duration: std::time::Duration,
    mut signal: &mut Signal,
) -> bool
where
    Signal: FusedFuture + Unpin,
{
    if signal.is_terminated() {
        return true;
    }
    let mut delay = futures_timer::Delay::new(duration).fuse();
    futures::select! {
        _ = delay => false,
        _ = signal => true,
    }
}

/// Milliseconds since the Unix epoch, as written to the processing-time
/// field.
pub fn unix_millis(time: std::time::SystemTime) -> i64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_millis())
            .map(|v| -v)
            .unwrap_or(i64::MIN),
    }
}

pub(crate) fn now_millis() -> i64 {
    unix_millis(std::time::SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn converts_system_time_to_millis() {
        assert_eq!(unix_millis(UNIX_EPOCH + Duration::from_millis(1500)), 1500);
        assert_eq!(unix_millis(UNIX_EPOCH - Duration::from_secs(1)), -1000);
    }

    #[tokio::test]
    async fn ticker_keeps_ticking() {
        let mut ticker = Ticker::new(Duration::from_millis(5));
        for _ in 0..3 {
            assert_eq!(ticker.next().await, Some(()));
        }
    }

    #[tokio::test]
    async fn signal_interrupts_sleep() {
        let mut fired = futures::future::ready(()).fuse();
        assert!(sleep_or_signal(Duration::from_secs(3600), &mut fired).await);
        // Once the signal has resolved it stays resolved.
        assert!(sleep_or_signal(Duration::from_secs(3600), &mut fired).await);

        let mut pending = futures::future::pending::<()>().fuse();
        assert!(!sleep_or_signal(Duration::from_millis(1), &mut pending).await);
    }
}
