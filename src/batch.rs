use std::time::Duration;

use tokio::time::Instant;

use crate::types::EventRecord;

/// Accumulates events into batches bounded by size and age.
///
/// Owned exclusively by the stream processor; one deadline is re-armed per
/// batch rather than allocating a timer per event. A zero timeout arms an
/// already-expired deadline, so the batch flushes as soon as the processor
/// finds the intake side idle.
#[derive(Debug)]
pub(crate) struct BatchAssembler {
    batch_size: usize,
    timeout: Duration,
    current: Vec<EventRecord>,
    deadline: Option<Instant>,
}

impl BatchAssembler {
    pub(crate) fn new(batch_size: u64, timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1) as usize,
            timeout,
            current: Vec::new(),
            deadline: None,
        }
    }

    /// Append an event. Returns the completed batch when it reaches the
    /// size bound.
    pub(crate) fn add(&mut self, record: EventRecord) -> Option<Vec<EventRecord>> {
        self.current.push(record);
        if self.current.len() == 1 {
            self.deadline = Some(Instant::now() + self.timeout);
        }
        if self.current.len() >= self.batch_size {
            return self.flush();
        }
        None
    }

    /// Deadline of the growing batch, if one is in progress.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Hand over whatever has accumulated, resetting the assembler.
    pub(crate) fn flush(&mut self) -> Option<Vec<EventRecord>> {
        self.deadline = None;
        if self.current.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.current))
    }
}
