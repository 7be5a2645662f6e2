use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::action::{Action, WebhookAction};
use crate::batch::BatchAssembler;
use crate::config::GatewayConfig;
use crate::dispatcher::{self, Delivery};
use crate::error::StreamError;
use crate::types::{EventRecord, StreamSpec, MAX_BATCH_SIZE};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Counters shared between the stream handle and its two tasks.
struct Shared {
    in_flight: AtomicU64,
    retrying: AtomicBool,
    processor_done: AtomicBool,
    dispatcher_done: AtomicBool,
}

/// The runtime pair (processor + dispatcher) for one delivery destination.
///
/// Constructed from a validated [`StreamSpec`]; both tasks spawn
/// immediately. Records enter through [`handle_event`](Self::handle_event),
/// which suspends when the intake channel is full. That suspension is the
/// backpressure boundary into the upstream feeder.
pub struct EventStream {
    spec: StreamSpec,
    intake_tx: mpsc::Sender<EventRecord>,
    stop_tx: watch::Sender<bool>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EventStream {
    /// Validate the spec and start the stream.
    pub fn new(spec: StreamSpec, config: &GatewayConfig) -> Result<Self, StreamError> {
        let spec = spec.validate()?;
        let action: Arc<dyn Action> = Arc::new(WebhookAction::from_spec(&spec, config)?);

        let (intake_tx, intake_rx) = mpsc::channel(MAX_BATCH_SIZE as usize);
        let (handoff_tx, handoff_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            in_flight: AtomicU64::new(0),
            retrying: AtomicBool::new(false),
            processor_done: AtomicBool::new(false),
            dispatcher_done: AtomicBool::new(false),
        });

        let processor = tokio::spawn(run_processor(
            spec.clone(),
            intake_rx,
            handoff_tx,
            stop_rx.clone(),
            shared.clone(),
        ));
        let dispatcher = tokio::spawn(run_dispatcher(
            spec.clone(),
            action,
            handoff_rx,
            stop_rx,
            shared.clone(),
        ));

        info!(
            stream = %spec.id.0,
            batch_size = spec.batch_size,
            batch_timeout_ms = spec.batch_timeout_ms,
            "event stream started"
        );

        Ok(Self {
            spec,
            intake_tx,
            stop_tx,
            shared,
            handles: Mutex::new(vec![processor, dispatcher]),
        })
    }

    /// The validated spec this stream runs under.
    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    /// Accept one record from the upstream feeder.
    ///
    /// Suspends while the intake channel is full. Returns
    /// [`StreamError::Shutdown`] once the stream has stopped.
    pub async fn handle_event(&self, record: EventRecord) -> Result<(), StreamError> {
        if *self.stop_tx.borrow() {
            return Err(StreamError::Shutdown);
        }
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.intake_tx.send(record).await.is_err() {
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(StreamError::Shutdown);
        }
        metric_inc("eventstream.event.accepted");
        Ok(())
    }

    /// Records accepted whose completion hooks have not fired yet.
    pub fn in_flight(&self) -> u64 {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Operator signal to pause upstream polling: true while delivery is in
    /// a retry loop, or while more than one batch's worth of records is
    /// waiting.
    pub fn is_blocked(&self) -> bool {
        self.shared.retrying.load(Ordering::SeqCst)
            || self.shared.in_flight.load(Ordering::SeqCst) > self.spec.batch_size
    }

    /// True once the processor task has exited.
    pub fn processor_done(&self) -> bool {
        self.shared.processor_done.load(Ordering::SeqCst)
    }

    /// True once the dispatcher task has exited.
    pub fn dispatcher_done(&self) -> bool {
        self.shared.dispatcher_done.load(Ordering::SeqCst)
    }

    /// Stop the stream and wait for both stages to exit. Idempotent.
    ///
    /// The processor flushes any partial batch; while stopping, the
    /// dispatcher gives each remaining batch exactly one attempt, so a
    /// healthy peer still receives what was in flight. Hooks for anything
    /// undelivered are dropped; the feeder redelivers from its watermark.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        debug!(stream = %self.spec.id.0, "event stream stopped");
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.spec.id.0)
            .field("in_flight", &self.in_flight())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

/// Intake loop: the only reader of the intake channel and only writer to
/// the assembler. Completed batches go to the dispatcher over a capacity-1
/// channel; the send suspends while a batch is mid-delivery, which is what
/// lets intake fill up and push back on the feeder.
async fn run_processor(
    spec: StreamSpec,
    mut intake_rx: mpsc::Receiver<EventRecord>,
    handoff_tx: mpsc::Sender<Vec<EventRecord>>,
    mut stop_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    let mut assembler = BatchAssembler::new(spec.batch_size, spec.batch_timeout());
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            maybe_record = intake_rx.recv() => match maybe_record {
                Some(record) => {
                    if let Some(batch) = assembler.add(record) {
                        if handoff_tx.send(batch).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },
            _ = wait_deadline(assembler.deadline()) => {
                if let Some(batch) = assembler.flush() {
                    if handoff_tx.send(batch).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Flush the partial batch on the way out; dropping handoff_tx is what
    // lets the dispatcher finish its drain and exit.
    if let Some(batch) = assembler.flush() {
        let _ = handoff_tx.send(batch).await;
    }
    shared.processor_done.store(true, Ordering::SeqCst);
    debug!(stream = %spec.id.0, "processor exited");
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Delivery loop: drains batches from the processor, drives each through
/// the retry policy, and fires completion hooks in batch order.
async fn run_dispatcher(
    spec: StreamSpec,
    action: Arc<dyn Action>,
    mut handoff_rx: mpsc::Receiver<Vec<EventRecord>>,
    stop_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    while let Some(batch) = handoff_rx.recv().await {
        let outcome =
            dispatcher::deliver(&spec, action.as_ref(), &batch, &stop_rx, &shared.retrying).await;
        match outcome {
            Delivery::Acked | Delivery::Skipped => {
                for record in &batch {
                    if let Some(hook) = &record.completion {
                        hook.call(record);
                    }
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Delivery::Abandoned => {
                debug!(
                    stream = %spec.id.0,
                    dropped = batch.len(),
                    "batch abandoned during shutdown"
                );
            }
        }
    }
    shared.dispatcher_done.store(true, Ordering::SeqCst);
    debug!(stream = %spec.id.0, "dispatcher exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamSpec;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            allow_private_ips: true,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn construction_rejects_invalid_spec() {
        let err = EventStream::new(StreamSpec::default(), &test_config()).unwrap_err();
        assert_eq!(err, StreamError::NoActionSpecified);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let spec = StreamSpec::webhook("http://127.0.0.1:1/hook");
        let stream = EventStream::new(spec, &test_config()).unwrap();
        stream.stop().await;
        assert!(stream.processor_done());
        assert!(stream.dispatcher_done());
        stream.stop().await;
        assert!(stream.processor_done());
        assert!(stream.dispatcher_done());
    }

    #[tokio::test]
    async fn handle_event_after_stop_is_rejected() {
        let spec = StreamSpec::webhook("http://127.0.0.1:1/hook");
        let stream = EventStream::new(spec, &test_config()).unwrap();
        stream.stop().await;
        let err = stream.handle_event(EventRecord::new("sub0")).await.unwrap_err();
        assert_eq!(err, StreamError::Shutdown);
        assert_eq!(stream.in_flight(), 0);
    }
}
