use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::action::Action;
use crate::types::{ErrorHandling, EventRecord, StreamSpec};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Outcome of driving one batch through the delivery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Peer acknowledged with a 2xx. Completion hooks fire.
    Acked,

    /// Retry budget spent under `skip`. The batch is dropped but completion
    /// hooks fire anyway, advancing the upstream watermark.
    Skipped,

    /// Stream stopped before the batch was delivered. Hooks do not fire;
    /// the feeder redelivers from its persisted watermark on restart.
    Abandoned,
}

/// Drive one batch to its outcome under the stream's error handling policy.
///
/// Attempts run until a 2xx, until the wall-clock retry budget is spent, or
/// until stop. `block` handling restarts the cycle after a blocked-retry
/// sleep and never drops the batch; only stop exits it. Stop is honored
/// between attempts, never mid-request.
pub(crate) async fn deliver(
    spec: &StreamSpec,
    action: &dyn Action,
    batch: &[EventRecord],
    stop: &watch::Receiver<bool>,
    retrying: &AtomicBool,
) -> Delivery {
    let body = match action.serialize(batch) {
        Ok(body) => body,
        Err(err) => {
            warn!(stream = %spec.id.0, error = %err, "batch serialization failed, dropping batch");
            return Delivery::Skipped;
        }
    };

    let budget = spec.retry_budget();
    let mut delay = spec.initial_retry_delay();

    loop {
        let window = Instant::now();
        loop {
            match action.send(&body).await {
                Ok(()) => {
                    metric_inc("eventstream.batch.acked");
                    retrying.store(false, Ordering::SeqCst);
                    return Delivery::Acked;
                }
                Err(err) => {
                    metric_inc("eventstream.attempt.failed");
                    warn!(stream = %spec.id.0, error = %err, "delivery attempt failed");
                }
            }

            if stopped(stop) {
                retrying.store(false, Ordering::SeqCst);
                return Delivery::Abandoned;
            }
            retrying.store(true, Ordering::SeqCst);

            if window.elapsed() >= budget {
                break;
            }
            if !sleep_unless_stopped(with_jitter(delay), stop).await {
                retrying.store(false, Ordering::SeqCst);
                return Delivery::Abandoned;
            }
            delay = next_delay(delay, spec.backoff_factor, budget);
        }

        match spec.error_handling {
            ErrorHandling::Skip => {
                metric_inc("eventstream.batch.skipped");
                warn!(stream = %spec.id.0, "retry budget exhausted, skipping batch");
                retrying.store(false, Ordering::SeqCst);
                return Delivery::Skipped;
            }
            ErrorHandling::Block => {
                metric_inc("eventstream.batch.blocked");
                debug!(
                    stream = %spec.id.0,
                    delay_sec = spec.blocked_retry_delay_sec,
                    "retry budget exhausted, blocking before next delivery cycle"
                );
                if !sleep_unless_stopped(spec.blocked_retry_delay(), stop).await {
                    retrying.store(false, Ordering::SeqCst);
                    return Delivery::Abandoned;
                }
                delay = spec.initial_retry_delay();
            }
        }
    }
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Sleep for `duration`, waking early on stop. Returns false when the
/// stream stopped.
async fn sleep_unless_stopped(duration: Duration, stop: &watch::Receiver<bool>) -> bool {
    let mut stop = stop.clone();
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = sleep(duration) => true,
        changed = stop.changed() => match changed {
            Ok(()) => !*stop.borrow(),
            Err(_) => false,
        },
    }
}

fn next_delay(current: Duration, factor: f64, cap: Duration) -> Duration {
    let next = current.mul_f64(factor);
    if cap > Duration::ZERO {
        next.min(cap)
    } else {
        next
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let jitter_ms = (delay.as_millis() / 10) as u64;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(fastrand::u64(0..=jitter_ms))
}
