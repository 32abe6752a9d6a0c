//! The follow pipeline: one task owns transport, router and debounce state;
//! all output goes through the emitter's writer thread.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::CursorWriter;
use crate::debounce::{Batch, DebounceAggregator, Wake};
use crate::emitter::OutputEmitter;
use crate::error::{EmitError, FollowError, TransportError};
use crate::record::{OutputRecord, SessionState};
use crate::router::{EventRouter, MESSAGE_CREATED, RoutedEvent};
use crate::source::ConversationSource;
use crate::supervisor::{BackoffPolicy, ReconnectSupervisor, Session, SessionEnd};
use crate::transport::{self, ChannelDescriptor, Connection};

#[derive(Debug, Clone)]
pub struct FollowConfig {
    pub websocket_url: String,
    pub channel: ChannelDescriptor,
    /// Zero disables debouncing.
    pub debounce_window: Duration,
    pub max_batch: usize,
    pub presence_interval: Option<Duration>,
    pub backoff: BackoffPolicy,
    pub status_records: bool,
}

/// Counters reported when a follow session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowSummary {
    pub sessions: u32,
    pub messages: u64,
    pub batches: u64,
    pub events: u64,
    pub snapshots: u64,
    pub dropped: u64,
    pub last_seen: u64,
}

enum Step {
    Cancel,
    Wake(Wake),
    Presence(TransportError),
    Frame(Option<Result<String, TransportError>>),
}

pub struct Follower<S, W> {
    config: FollowConfig,
    router: EventRouter<S>,
    debounce: DebounceAggregator,
    wakes: mpsc::UnboundedReceiver<Wake>,
    emitter: OutputEmitter<W>,
    cursor: Option<CursorWriter>,
    summary: FollowSummary,
}

impl<S, W> Follower<S, W>
where
    S: ConversationSource,
    W: Write + Send + 'static,
{
    pub fn new(config: FollowConfig, router: EventRouter<S>, emitter: OutputEmitter<W>) -> Self {
        let (debounce, wakes) = DebounceAggregator::new(config.debounce_window, config.max_batch);
        Self {
            config,
            router,
            debounce,
            wakes,
            emitter,
            cursor: None,
            summary: FollowSummary::default(),
        }
    }

    pub fn with_cursor(mut self, cursor: CursorWriter) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Follow until `cancel` fires or reconnecting gives up, then shut down
    /// in order: pending batches, cursor, output.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<FollowSummary, FollowError> {
        let mut supervisor = ReconnectSupervisor::new(self.config.backoff.clone());
        let outcome = supervisor.run_session(&cancel, &mut self).await;
        let shutdown = self.shutdown().await;
        outcome?;
        shutdown
    }

    async fn session(
        &mut self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, FollowError> {
        let url = self.config.websocket_url.clone();
        let connected = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            connected = self.service_wakes_until(transport::connect(&url)) => connected?,
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(err) => return Ok(SessionEnd::Disconnected(err)),
        };
        let channel = self.config.channel.clone();
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            subscribed = self.service_wakes_until(conn.subscribe(&channel)) => subscribed?,
        };
        if let Err(err) = subscribed {
            return Ok(SessionEnd::Disconnected(err));
        }
        self.summary.sessions += 1;
        info!(attempt, channel = %self.config.channel.channel, "following");
        if self.config.status_records {
            self.emit(OutputRecord::status(SessionState::Connected, attempt, None))
                .await?;
        }

        let end = self.drain(&mut conn, cancel).await?;
        if let SessionEnd::Disconnected(err) = &end {
            if self.config.status_records {
                let record = OutputRecord::status(SessionState::Disconnected, attempt, Some(err.to_string()));
                self.emit(record).await?;
            }
        }
        conn.close().await;
        Ok(end)
    }

    /// Pump one connection. Debounce wake-ups win over frames that are
    /// ready at the same time.
    async fn drain(
        &mut self,
        conn: &mut Connection,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, FollowError> {
        let (presence_tx, mut presence_errors) = mpsc::unbounded_channel();
        let _presence = match self.config.presence_interval {
            Some(interval) => {
                let presence = conn.start_presence(interval, move |err| {
                    let _ = presence_tx.send(err);
                });
                match presence {
                    Ok(handle) => Some(handle),
                    Err(err) => return Ok(SessionEnd::Disconnected(err)),
                }
            }
            None => None,
        };

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancel,
                Some(wake) = self.wakes.recv() => Step::Wake(wake),
                Some(err) = presence_errors.recv() => Step::Presence(err),
                frame = conn.next_frame() => Step::Frame(frame),
            };

            match step {
                Step::Cancel => return Ok(SessionEnd::Cancelled),
                Step::Wake(wake) => {
                    if let Some(batch) = self.debounce.on_wake(wake) {
                        self.emit_batch(batch).await?;
                    }
                }
                Step::Presence(err) => {
                    warn!(error = %err, "presence heartbeat failed");
                    return Ok(SessionEnd::Disconnected(err));
                }
                Step::Frame(Some(Ok(text))) => self.handle_frame(&text).await?,
                Step::Frame(Some(Err(err))) => return Ok(SessionEnd::Disconnected(err)),
                Step::Frame(None) => {
                    return Ok(SessionEnd::Disconnected(TransportError::Closed { reason: None }));
                }
            }
        }
    }

    /// Drive `work` to completion while still flushing batches whose
    /// debounce timers fire in the meantime.
    async fn service_wakes_until<T>(&mut self, work: impl Future<Output = T>) -> Result<T, FollowError> {
        let mut work = std::pin::pin!(work);
        loop {
            tokio::select! {
                biased;
                Some(wake) = self.wakes.recv() => {
                    if let Some(batch) = self.debounce.on_wake(wake) {
                        self.emit_batch(batch).await?;
                    }
                }
                done = &mut work => return Ok(done),
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) -> Result<(), FollowError> {
        for routed in self.router.route(text).await {
            match routed {
                RoutedEvent::Message { event, message } => {
                    let created = event == MESSAGE_CREATED;
                    if created && !self.config.debounce_window.is_zero() {
                        if let Some(batch) = self.debounce.push(message) {
                            self.emit_batch(batch).await?;
                        }
                        continue;
                    }
                    let id = message.id;
                    self.emit(OutputRecord::message(event, message)).await?;
                    self.summary.messages += 1;
                    if created {
                        self.advance_cursor(id);
                    }
                }
                RoutedEvent::Event { event, data } => {
                    debug!(%event, "event");
                    self.emit(OutputRecord::Event { event, data }).await?;
                    self.summary.events += 1;
                }
                RoutedEvent::Snapshot(snapshot) => {
                    self.emit(OutputRecord::Snapshot(snapshot)).await?;
                    self.summary.snapshots += 1;
                }
                RoutedEvent::SnapshotError {
                    conversation_id,
                    error,
                } => {
                    self.emit(OutputRecord::SnapshotError {
                        conversation_id,
                        error,
                    })
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn emit_batch(&mut self, batch: Batch) -> Result<(), FollowError> {
        let newest_id = batch.max_message_id();
        let count = batch.len() as u64;
        let Some(record) = OutputRecord::from_batch(batch) else {
            return Ok(());
        };
        if count > 1 {
            self.summary.batches += 1;
        }
        self.summary.messages += count;
        self.emit(record).await?;
        self.advance_cursor(newest_id);
        Ok(())
    }

    async fn emit(&self, record: OutputRecord) -> Result<(), FollowError> {
        self.emitter.emit_json(&record).await?;
        Ok(())
    }

    /// Cursor writes are best effort mid-stream; the final flush reports errors.
    fn advance_cursor(&mut self, message_id: u64) {
        if let Some(cursor) = self.cursor.as_mut() {
            if let Err(err) = cursor.advance(message_id) {
                warn!(error = %err, "could not save cursor");
            }
        }
    }

    async fn shutdown(mut self) -> Result<FollowSummary, FollowError> {
        let pending = self.debounce.flush_all();
        if !pending.is_empty() {
            info!(conversations = pending.len(), "flushing pending batches");
        }
        let mut first_err: Option<FollowError> = None;
        for batch in pending {
            match self.emit_batch(batch).await {
                Ok(()) => {}
                // Output is stalled; the cursor has not moved past these
                Err(FollowError::Emit(EmitError::Cancelled)) => {
                    warn!("output stalled at shutdown, pending batch not written");
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }

        if let Some(cursor) = self.cursor.as_mut() {
            if let Err(err) = cursor.flush() {
                first_err.get_or_insert(err.into());
            }
        }

        self.summary.dropped = self.emitter.dropped();
        self.summary.last_seen = self.router.last_seen();
        if let Err(err) = self.emitter.close_and_drain().await {
            first_err.get_or_insert(err.into());
        }

        info!(
            sessions = self.summary.sessions,
            messages = self.summary.messages,
            batches = self.summary.batches,
            dropped = self.summary.dropped,
            last_seen = self.summary.last_seen,
            "follow stopped"
        );
        match first_err {
            Some(err) => Err(err),
            None => Ok(self.summary),
        }
    }
}

impl<S, W> Session for Follower<S, W>
where
    S: ConversationSource,
    W: Write + Send + 'static,
{
    async fn run_once(&mut self, attempt: u32, cancel: &CancellationToken) -> Result<SessionEnd, FollowError> {
        match self.session(attempt, cancel).await {
            // A push blocked on a full queue gave way to cancellation
            Err(FollowError::Emit(EmitError::Cancelled)) => Ok(SessionEnd::Cancelled),
            other => other,
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Result<(), FollowError> {
        match self.service_wakes_until(tokio::time::sleep(delay)).await {
            Err(FollowError::Emit(EmitError::Cancelled)) => Ok(()),
            other => other,
        }
    }
}
