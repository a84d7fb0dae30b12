use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Wall-clock budget for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub const fn from_secs(timeout_s: u64, interval_s: u64) -> Self {
        Self::new(
            Duration::from_secs(timeout_s),
            Duration::from_secs(interval_s),
        )
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from_secs(300, 5)
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Ready,
    Pending,
    /// Stop waiting now (terminal failure or transport error).
    Abort,
}

/// Run `probe` every `interval` while less than `timeout` has elapsed.
///
/// Returns `true` on the first `Ready`, `false` on `Abort` or when the budget
/// runs out. A probe started before the deadline counts even if the deadline
/// passes while it runs. Expiry never cancels the remote operation.
pub async fn poll_until<F, Fut>(settings: PollSettings, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollStep>,
{
    let started = Instant::now();
    while started.elapsed() < settings.timeout {
        match probe().await {
            PollStep::Ready => return true,
            PollStep::Abort => return false,
            PollStep::Pending => {}
        }
        sleep(settings.interval).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // 20s budget / 5s interval -> probes at t=0,5,10,15.
    const SETTINGS: PollSettings = PollSettings::from_secs(20, 5);

    async fn ready_on_probe(n: usize) -> (bool, usize) {
        let calls = AtomicUsize::new(0);
        let ok = poll_until(SETTINGS, || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call >= n {
                    PollStep::Ready
                } else {
                    PollStep::Pending
                }
            }
        })
        .await;
        (ok, calls.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_last_allowed_probe_counts() {
        assert_eq!(ready_on_probe(4).await, (true, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_before_late_success() {
        assert_eq!(ready_on_probe(5).await, (false, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_immediately() {
        let calls = AtomicUsize::new(0);
        let ok = poll_until(SETTINGS, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { PollStep::Abort }
        })
        .await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
