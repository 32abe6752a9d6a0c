//! Bounded output queue with a single writer thread.
//!
//! Producers enqueue deferred write actions; one dedicated OS thread runs
//! them in order against the writer. Capacity is enforced with a semaphore
//! whose permit travels with each item and is released once the item has
//! run, so "queued + in flight" never exceeds the configured size.
//! Dropped records are reported on a fixed interval from a runtime task.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::EmitError;

/// What to do with new output when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Discard and count.
    #[default]
    Drop,
    /// Wait for space.
    Block,
}

impl std::str::FromStr for OverflowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(OverflowMode::Drop),
            "block" => Ok(OverflowMode::Block),
            other => Err(format!("expected \"drop\" or \"block\", got {other:?}")),
        }
    }
}

pub type Work<W> = Box<dyn FnOnce(&mut W) -> io::Result<()> + Send>;

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

struct Shared {
    dropped: AtomicU64,
    reported: AtomicU64,
    error: Mutex<Option<EmitError>>,
}

impl Shared {
    fn stored_error(&self) -> Option<EmitError> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store_error(&self, err: EmitError) {
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Log drops not yet reported.
    fn report_drops(&self) {
        let total = self.dropped.load(Ordering::Relaxed);
        let previous = self.reported.swap(total, Ordering::Relaxed);
        if total > previous {
            warn!(
                dropped = total - previous,
                dropped_total = total,
                "output queue full, records dropped"
            );
        }
    }
}

pub struct OutputEmitter<W> {
    tx: Option<mpsc::UnboundedSender<(Work<W>, OwnedSemaphorePermit)>>,
    permits: Arc<Semaphore>,
    mode: OverflowMode,
    shared: Arc<Shared>,
    consumer: Option<thread::JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<W: Write + Send + 'static> OutputEmitter<W> {
    pub fn new(writer: W, capacity: usize, mode: OverflowMode) -> io::Result<Self> {
        Self::with_report_interval(writer, capacity, mode, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_report_interval(
        mut writer: W,
        capacity: usize,
        mode: OverflowMode,
        report_interval: Duration,
    ) -> io::Result<Self> {
        let permits = Arc::new(Semaphore::new(capacity.max(1)));
        let shared = Arc::new(Shared {
            dropped: AtomicU64::new(0),
            reported: AtomicU64::new(0),
            error: Mutex::new(None),
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<(Work<W>, OwnedSemaphorePermit)>();

        let consumer_permits = permits.clone();
        let consumer_shared = shared.clone();
        let consumer = thread::Builder::new()
            .name("hdesk-output".into())
            .spawn(move || {
                while let Some((work, permit)) = rx.blocking_recv() {
                    let result = work(&mut writer).and_then(|()| writer.flush());
                    drop(permit);
                    if let Err(err) = result {
                        error!(error = %err, "output write failed, stopping output");
                        consumer_shared.store_error(EmitError::WriteFailed(Arc::new(err)));
                        // Wakes blocked producers; anything still queued is discarded
                        consumer_permits.close();
                        return;
                    }
                }
                let _ = writer.flush();
            })?;

        // Without a runtime drops are only reported at close
        let reporter = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let shared = shared.clone();
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(report_interval);
                // The first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    shared.report_drops();
                }
            })
        });

        Ok(Self {
            tx: Some(tx),
            permits,
            mode,
            shared,
            consumer: Some(consumer),
            reporter,
            cancel: CancellationToken::new(),
        })
    }

    /// Abandon blocked pushes once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Queue one unit of output. In drop mode a full queue discards the unit
    /// and returns `Ok`; in block mode this waits for space, or fails with
    /// [`EmitError::Cancelled`] if cancellation fires first.
    pub async fn emit(&self, work: Work<W>) -> Result<(), EmitError> {
        if let Some(err) = self.shared.stored_error() {
            return Err(err);
        }
        let permit = match self.mode {
            OverflowMode::Drop => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(TryAcquireError::Closed) => return Err(self.closed_error()),
            },
            OverflowMode::Block => tokio::select! {
                biased;
                acquired = self.permits.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => return Err(self.closed_error()),
                },
                _ = self.cancel.cancelled() => return Err(EmitError::Cancelled),
            },
        };
        let tx = self.tx.as_ref().ok_or(EmitError::Closed)?;
        tx.send((work, permit)).map_err(|_| self.closed_error())
    }

    /// Queue one JSON line.
    pub async fn emit_json<T: Serialize + ?Sized>(&self, record: &T) -> Result<(), EmitError> {
        let mut line = serde_json::to_vec(record).map_err(|e| EmitError::Encode(e.to_string()))?;
        line.push(b'\n');
        self.emit(Box::new(move |w: &mut W| w.write_all(&line)))
            .await
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Report outstanding drops, stop accepting work, wait for the writer
    /// thread to finish the queue and return the first write error, if any.
    pub async fn close_and_drain(mut self) -> Result<(), EmitError> {
        self.stop_reporter();
        self.shared.report_drops();
        self.tx = None;
        if let Some(consumer) = self.consumer.take() {
            let joined = tokio::task::spawn_blocking(move || consumer.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                error!("output thread panicked");
                return Err(EmitError::Closed);
            }
        }
        match self.shared.stored_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> EmitError {
        self.shared.stored_error().unwrap_or(EmitError::Closed)
    }
}

impl<W> OutputEmitter<W> {
    fn stop_reporter(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }
    }
}

impl<W> Drop for OutputEmitter<W> {
    fn drop(&mut self) {
        self.stop_reporter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_in_order() {
        let buf = SharedBuf::default();
        let emitter = OutputEmitter::new(buf.clone(), 16, OverflowMode::Block).unwrap();
        for i in 0..5 {
            emitter.emit_json(&serde_json::json!({ "n": i })).await.unwrap();
        }
        emitter.close_and_drain().await.unwrap();
        let lines: Vec<String> = buf.text().lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], r#"{"n":0}"#);
        assert_eq!(lines[4], r#"{"n":4}"#);
    }

    #[tokio::test]
    async fn drop_mode_with_stalled_consumer_counts_drops() {
        let buf = SharedBuf::default();
        let emitter = OutputEmitter::new(buf.clone(), 1, OverflowMode::Drop).unwrap();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        for i in 0..5 {
            let release_rx = release_rx.clone();
            emitter
                .emit(Box::new(move |w: &mut SharedBuf| {
                    // Stall until the test lets go
                    let _ = release_rx.lock().unwrap().recv();
                    writeln!(w, "{i}")
                }))
                .await
                .unwrap();
        }

        assert_eq!(emitter.dropped(), 4);
        release_tx.send(()).unwrap();
        drop(release_tx);
        emitter.close_and_drain().await.unwrap();
        assert_eq!(buf.text(), "0\n");
    }

    #[tokio::test]
    async fn block_mode_waits_for_space() {
        let buf = SharedBuf::default();
        let emitter = OutputEmitter::new(buf.clone(), 1, OverflowMode::Block).unwrap();
        for i in 0..20 {
            emitter
                .emit(Box::new(move |w: &mut SharedBuf| {
                    thread::sleep(Duration::from_millis(1));
                    writeln!(w, "{i}")
                }))
                .await
                .unwrap();
        }
        emitter.close_and_drain().await.unwrap();
        assert_eq!(buf.text().lines().count(), 20);
    }

    #[tokio::test]
    async fn cancellation_releases_a_blocked_push() {
        let buf = SharedBuf::default();
        let cancel = CancellationToken::new();
        let emitter = OutputEmitter::new(buf.clone(), 1, OverflowMode::Block)
            .unwrap()
            .with_cancellation(cancel.clone());
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        // Occupies the only slot until released
        emitter
            .emit(Box::new(move |w: &mut SharedBuf| {
                let _ = release_rx.recv();
                writeln!(w, "first")
            }))
            .await
            .unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let blocked = tokio::time::timeout(Duration::from_secs(5), emitter.emit_json(&"second"))
            .await
            .expect("blocked push ignored cancellation");
        assert!(matches!(blocked, Err(EmitError::Cancelled)), "{blocked:?}");

        release_tx.send(()).unwrap();
        emitter.close_and_drain().await.unwrap();
        assert_eq!(buf.text(), "first\n");
    }

    #[tokio::test]
    async fn drops_are_reported_without_further_traffic() {
        let buf = SharedBuf::default();
        let emitter =
            OutputEmitter::with_report_interval(buf.clone(), 1, OverflowMode::Drop, Duration::from_millis(20))
                .unwrap();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        emitter
            .emit(Box::new(move |w: &mut SharedBuf| {
                let _ = release_rx.recv();
                writeln!(w, "kept")
            }))
            .await
            .unwrap();
        emitter.emit_json(&1).await.unwrap();
        emitter.emit_json(&2).await.unwrap();
        assert_eq!(emitter.dropped(), 2);

        // Quiet from here on: only the ticker can report
        let mut reported = 0;
        for _ in 0..100 {
            reported = emitter.shared.reported.load(Ordering::Relaxed);
            if reported == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reported, 2);

        release_tx.send(()).unwrap();
        emitter.close_and_drain().await.unwrap();
    }

    #[tokio::test]
    async fn first_write_error_is_returned_to_later_callers() {
        let emitter = OutputEmitter::new(BrokenPipe, 4, OverflowMode::Block).unwrap();
        emitter.emit_json(&1).await.unwrap();

        // The consumer closes the queue once the write fails
        let mut later = Ok(());
        for _ in 0..100 {
            later = emitter.emit_json(&2).await;
            if later.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(later, Err(EmitError::WriteFailed(_))), "{later:?}");
        assert!(matches!(
            emitter.close_and_drain().await,
            Err(EmitError::WriteFailed(_))
        ));
    }

    #[test]
    fn overflow_mode_parses() {
        assert_eq!("drop".parse::<OverflowMode>(), Ok(OverflowMode::Drop));
        assert_eq!("block".parse::<OverflowMode>(), Ok(OverflowMode::Block));
        assert!("spill".parse::<OverflowMode>().is_err());
    }
}
