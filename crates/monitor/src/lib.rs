//! Audit record queue and the worker that drains it into framed batches.
//!
//! The queue is a lock-protected FIFO bounded by a record count; enqueue is
//! non-blocking and drops the newest record when full, so interception
//! threads are never stalled by a slow or absent consumer. A single worker
//! task owns the producer end of the frame channel: it waits until records
//! exist *and* a consumer is attached, packs records into 32 KiB frames and
//! hands them to the channel. Cancellation is a terminate flag observed at
//! the top of the loop and across every wait.

#![deny(unsafe_code)]

use fsgate_core::limits::FRAME_BODY_BYTES;
use fsgate_core::record::MonitorRecord;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};
use wire::{encode_record_into, encoded_record_len};

/// Producer end of the framed message channel to the attached consumer.
pub type FrameSink = mpsc::Sender<Vec<u8>>;

/// How long teardown waits for the worker before abandoning it.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Bounded FIFO of monitor records.
pub struct RecordQueue {
    inner: Mutex<VecDeque<MonitorRecord>>,
    allocated: AtomicUsize,
    dropped: AtomicU64,
    capacity: usize,
    wake: Notify,
}

impl RecordQueue {
    /// Create a queue bounded by `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        RecordQueue {
            inner: Mutex::new(VecDeque::new()),
            allocated: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            capacity,
            wake: Notify::new(),
        }
    }

    /// Append a record and signal the worker. Never blocks the producer:
    /// when the queue is full the new record is dropped and the dropped
    /// counter incremented. Returns whether the record was queued.
    pub fn enqueue(&self, record: MonitorRecord) -> bool {
        if encoded_record_len(&record) > FRAME_BODY_BYTES {
            // Records are size-bounded at construction; one that cannot fit
            // a frame must not reach the worker.
            warn!(path = %record.file_path, "oversized monitor record refused");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        {
            let mut q = self.inner.lock().expect("record queue lock poisoned");
            if q.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            q.push_back(record);
            self.allocated.store(q.len(), Ordering::Release);
        }
        self.wake.notify_one();
        true
    }

    /// Move records from the head into `body`, stopping before the record
    /// that would push `body` past the frame capacity. Returns how many
    /// records were packed.
    pub fn fill_frame(&self, body: &mut Vec<u8>) -> usize {
        let mut q = self.inner.lock().expect("record queue lock poisoned");
        let mut packed = 0usize;
        while let Some(front) = q.front() {
            if body.len() + encoded_record_len(front) > FRAME_BODY_BYTES {
                break;
            }
            if let Some(record) = q.pop_front() {
                encode_record_into(body, &record);
                packed += 1;
            }
        }
        self.allocated.store(q.len(), Ordering::Release);
        packed
    }

    /// Records currently queued.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Whether the queue holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocated() == 0
    }

    /// Records dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard all queued records; returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut q = self.inner.lock().expect("record queue lock poisoned");
        let n = q.len();
        q.clear();
        self.allocated.store(0, Ordering::Release);
        n
    }

    /// Wait until an enqueue signals the worker. A signal arriving while
    /// nobody waits is retained for the next waiter.
    pub async fn wait_wake(&self) {
        self.wake.notified().await;
    }

    /// Raise the wake signal without enqueuing, so a parked worker
    /// re-examines the terminate flag.
    pub fn raise_wake(&self) {
        self.wake.notify_one();
    }
}

/// Monitor worker loop. Exits when `terminate` turns true or either channel
/// sender goes away.
pub async fn run_worker(
    queue: std::sync::Arc<RecordQueue>,
    mut port: watch::Receiver<Option<FrameSink>>,
    mut terminate: watch::Receiver<bool>,
) {
    debug!("monitor worker started");
    'outer: loop {
        if *terminate.borrow() {
            break;
        }
        tokio::select! {
            () = queue.wait_wake() => {}
            changed = terminate.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        // Records exist; hold them until a consumer is attached.
        let sink = loop {
            if *terminate.borrow() {
                break 'outer;
            }
            let attached = port.borrow().clone();
            if let Some(sink) = attached {
                break sink;
            }
            tokio::select! {
                changed = port.changed() => {
                    if changed.is_err() {
                        break 'outer;
                    }
                }
                changed = terminate.changed() => {
                    if changed.is_err() {
                        break 'outer;
                    }
                }
            }
        };

        loop {
            let mut body = Vec::new();
            let packed = queue.fill_frame(&mut body);
            if packed == 0 {
                break;
            }
            trace!(records = packed, bytes = body.len(), "monitor frame ready");
            if sink.send(body).await.is_err() {
                // Consumer detached mid-send; this frame is discarded but the
                // wake stays raised so queued records flow on reattach.
                debug!("monitor consumer disconnected, frame discarded");
                queue.raise_wake();
                break;
            }
            if queue.is_empty() {
                break;
            }
        }
    }
    debug!("monitor worker exited");
}

/// Cooperative worker shutdown: raise terminate and both wake signals, then
/// wait a bounded interval before abandoning the task.
pub async fn shutdown_worker(
    handle: JoinHandle<()>,
    terminate: &watch::Sender<bool>,
    queue: &RecordQueue,
) {
    let _ = terminate.send(true);
    queue.raise_wake();
    match timeout(WORKER_JOIN_TIMEOUT, handle).await {
        Ok(_) => debug!("monitor worker joined"),
        Err(_) => warn!("monitor worker did not exit within {WORKER_JOIN_TIMEOUT:?}"),
    }
}
