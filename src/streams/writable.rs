use super::deferred::{Deferred, SignalFuture};
use super::error::StreamError;
use super::{CountQueuingStrategy, QueuingStrategy, StreamResult};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, SharedPtr};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::channel::oneshot;
use futures::future::{self, Either, poll_fn};
use futures::{FutureExt, StreamExt, ready};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace, warn};

type Completion = oneshot::Sender<StreamResult<()>>;

/// Lifecycle state of a writable stream.
///
/// `Errored` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Writable,
    Erroring,
    Errored,
    Closed,
}

enum QueueElement<T> {
    /// `value` is taken while the chunk is in flight; its size stays accounted
    /// until the sink settles the write.
    Chunk { value: Option<T>, size: f64 },
    CloseToken,
}

struct AbortRequest {
    completions: Vec<Completion>,
    reason: Option<String>,
    already_erroring: bool,
}

/// Queued size shared by producers and the stream task.
///
/// Producers size a chunk and account for it when they send the write, so the
/// writer's `ready` turns pending before the stream task has seen the command.
/// The task releases the size once the chunk is written, rejected or discarded.
struct Backlog<T> {
    strategy: BoxedStrategy<T>,
    high_water_mark: f64,
    total_size: f64,
}

impl<T> Backlog<T> {
    fn desired_size(&self) -> f64 {
        self.high_water_mark - self.total_size
    }

    fn backpressured(&self) -> bool {
        self.desired_size() <= 0.0
    }

    fn release(&mut self, size: f64) {
        if is_valid_chunk_size(size) {
            self.total_size = (self.total_size - size).max(0.0);
        }
    }
}

fn is_valid_chunk_size(size: f64) -> bool {
    size.is_finite() && size >= 0.0
}

/// Commands sent to stream task for state mutation
enum StreamCommand<T> {
    Write {
        chunk: T,
        /// Already accounted in the backlog when valid
        size: f64,
        completion: Completion,
    },
    Close {
        completion: Completion,
    },
    Abort {
        reason: Option<String>,
        completion: Completion,
    },
    Flush {
        completion: Completion,
    },
    AttachWriter {
        signals: SharedPtr<WriterSignals>,
    },
    DetachWriter {
        signals: SharedPtr<WriterSignals>,
    },
}

/// State published by the stream task after every step, read by synchronous accessors.
#[derive(Clone)]
struct StreamSnapshot {
    state: StreamState,
    stored_error: Option<StreamError>,
    close_queued_or_in_flight: bool,
}

impl StreamSnapshot {
    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }

    fn accepts_writes(&self) -> bool {
        self.state == StreamState::Writable && !self.close_queued_or_in_flight
    }

    /// Outcomes a writer's `ready` and `closed` futures should have in this state,
    /// given the backlog's backpressure. `None` means pending.
    fn writer_outcomes(
        &self,
        backpressure: bool,
    ) -> (Option<StreamResult<()>>, Option<StreamResult<()>>) {
        match self.state {
            StreamState::Writable => {
                let ready = if backpressure && !self.close_queued_or_in_flight {
                    None
                } else {
                    Some(Ok(()))
                };
                (ready, None)
            }
            StreamState::Erroring => (Some(Err(self.stored_error())), None),
            StreamState::Closed => (Some(Ok(())), Some(Ok(()))),
            StreamState::Errored => {
                let error = self.stored_error();
                (Some(Err(error.clone())), Some(Err(error)))
            }
        }
    }

    fn check_writable(&self) -> StreamResult<()> {
        match self.state {
            StreamState::Errored | StreamState::Erroring => Err(self.stored_error()),
            StreamState::Closed => Err(StreamError::Closed),
            StreamState::Writable if self.close_queued_or_in_flight => Err(StreamError::Closing),
            StreamState::Writable => Ok(()),
        }
    }
}

/// The `ready` and `closed` futures of the writer currently holding the lock.
pub(crate) struct WriterSignals {
    slots: Mutex<WriterSlots>,
}

struct WriterSlots {
    released: bool,
    ready: Deferred,
    closed: Deferred,
}

impl WriterSignals {
    fn seeded(snapshot: &StreamSnapshot, backpressure: bool) -> Self {
        let (ready, closed) = snapshot.writer_outcomes(backpressure);
        let deferred = |target: Option<StreamResult<()>>| match target {
            None => Deferred::pending(),
            Some(result) => Deferred::settled(result),
        };
        Self {
            slots: Mutex::new(WriterSlots {
                released: false,
                ready: deferred(ready),
                closed: deferred(closed),
            }),
        }
    }

    /// Apply a stream-driven update unless the writer has already been released.
    fn update(&self, f: impl FnOnce(&mut WriterSlots)) {
        let mut slots = self.slots.lock();
        if !slots.released {
            f(&mut slots);
        }
    }

    fn reconcile(&self, snapshot: &StreamSnapshot, backpressure: bool) {
        let (ready, closed) = snapshot.writer_outcomes(backpressure);
        self.update(|slots| {
            slots.ready.reconcile(ready);
            slots.closed.reconcile(closed);
        });
    }

    /// Producer-side half of backpressure: a write that fills the backlog makes
    /// `ready` pending right away. Only the stream task resolves it again.
    fn apply_backpressure(&self) {
        self.update(|slots| slots.ready.reset_if_resolved());
    }

    fn release(&self) {
        let mut slots = self.slots.lock();
        if slots.released {
            return;
        }
        slots.released = true;
        slots.ready.ensure_rejected(StreamError::Released);
        slots.closed.ensure_rejected(StreamError::Released);
    }

    fn ready(&self) -> SignalFuture {
        self.slots.lock().ready.future()
    }

    fn closed(&self) -> SignalFuture {
        self.slots.lock().closed.future()
    }
}

/// Future returned by `write`, `close` and `abort`.
///
/// The command is queued when the method is called, not when this future is
/// first polled, so operations are processed in call order.
#[must_use = "futures do nothing unless polled"]
pub struct OperationFuture {
    state: OperationState,
}

enum OperationState {
    Waiting(oneshot::Receiver<StreamResult<()>>),
    Failed(Option<StreamError>),
}

impl OperationFuture {
    fn waiting(rx: oneshot::Receiver<StreamResult<()>>) -> Self {
        Self {
            state: OperationState::Waiting(rx),
        }
    }

    fn failed(error: StreamError) -> Self {
        Self {
            state: OperationState::Failed(Some(error)),
        }
    }
}

impl Future for OperationFuture {
    type Output = StreamResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            OperationState::Waiting(rx) => rx
                .poll_unpin(cx)
                .map(|result| result.unwrap_or(Err(StreamError::TaskDropped))),
            OperationState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(StreamError::TaskDropped)))
            }
        }
    }
}

pub struct WritableStream<T: MaybeSend + 'static, Sink> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    locked: SharedPtr<AtomicBool>,
    published: SharedPtr<RwLock<StreamSnapshot>>,
    backlog: SharedPtr<Mutex<Backlog<T>>>,
    _sink: PhantomData<fn() -> Sink>,
}

impl<T: MaybeSend + 'static, Sink> Clone for WritableStream<T, Sink> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            locked: SharedPtr::clone(&self.locked),
            published: SharedPtr::clone(&self.published),
            backlog: SharedPtr::clone(&self.backlog),
            _sink: PhantomData,
        }
    }
}

impl<T: MaybeSend + 'static, Sink> WritableStream<T, Sink> {
    pub fn locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// State as of the stream task's last step.
    pub fn state(&self) -> StreamState {
        self.published.read().state
    }

    /// `None` while erroring or errored, `Some(0.0)` once closed, otherwise the
    /// high water mark minus the size of every chunk written but not yet consumed.
    pub fn desired_size(&self) -> Option<f64> {
        let state = self.published.read().state;
        match state {
            StreamState::Erroring | StreamState::Errored => None,
            StreamState::Closed => Some(0.0),
            StreamState::Writable => Some(self.backlog.lock().desired_size()),
        }
    }

    /// Queue a chunk. Fails with [`StreamError::Locked`] while a writer holds the lock.
    pub fn write(&self, chunk: T) -> OperationFuture {
        if self.locked() {
            return OperationFuture::failed(StreamError::Locked);
        }
        let (tx, rx) = oneshot::channel();
        match self.send_write(chunk, tx, None) {
            Ok(()) => OperationFuture::waiting(rx),
            Err(error) => OperationFuture::failed(error),
        }
    }

    /// Close the stream once every queued chunk has been written.
    /// Fails with [`StreamError::Locked`] while a writer holds the lock.
    pub fn close(&self) -> OperationFuture {
        if self.locked() {
            return OperationFuture::failed(StreamError::Locked);
        }
        self.request(|completion| StreamCommand::Close { completion })
    }

    /// Abort the stream, signaling that no more data will be written.
    ///
    /// Queued writes are rejected; a write or close already handed to the sink
    /// is allowed to settle first. Repeated calls join the pending abort.
    pub fn abort(&self, reason: Option<String>) -> OperationFuture {
        self.request(|completion| StreamCommand::Abort { reason, completion })
    }

    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T, Sink>> {
        // Attempt to atomically acquire the lock:
        if self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::Locked);
        }

        let snapshot = self.published.read().clone();
        let backpressure = self.backlog.lock().backpressured();
        let signals = SharedPtr::new(WriterSignals::seeded(&snapshot, backpressure));
        // The task re-syncs the signals against its live state when it sees this.
        let _ = self.command_tx.unbounded_send(StreamCommand::AttachWriter {
            signals: SharedPtr::clone(&signals),
        });
        debug!(state = ?snapshot.state, "writer lock acquired");

        Ok(WritableStreamDefaultWriter::new(self.clone(), signals))
    }

    fn request(&self, command: impl FnOnce(Completion) -> StreamCommand<T>) -> OperationFuture {
        let (tx, rx) = oneshot::channel();
        match self.command_tx.unbounded_send(command(tx)) {
            Ok(()) => OperationFuture::waiting(rx),
            Err(_) => OperationFuture::failed(StreamError::TaskDropped),
        }
    }

    fn check_writable(&self) -> StreamResult<()> {
        self.published.read().check_writable()
    }

    /// Size the chunk, account for it and send it to the stream task.
    ///
    /// Accounting and sending happen under the backlog lock, so the task can't
    /// release a size before it was added.
    fn send_write(
        &self,
        chunk: T,
        completion: Completion,
        signals: Option<&WriterSignals>,
    ) -> StreamResult<()> {
        let accepts_writes = self.published.read().accepts_writes();

        let mut backlog = self.backlog.lock();
        let size = backlog.strategy.size(&chunk);
        let counted = is_valid_chunk_size(size);
        if counted {
            backlog.total_size += size;
        }

        let sent = self.command_tx.unbounded_send(StreamCommand::Write {
            chunk,
            size,
            completion,
        });
        if sent.is_err() {
            backlog.release(size);
            return Err(StreamError::TaskDropped);
        }

        if counted && accepts_writes && backlog.backpressured() {
            if let Some(signals) = signals {
                signals.apply_backpressure();
            }
        }
        Ok(())
    }
}

impl<T, Sink> WritableStream<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    /// Returns a builder for this writable stream
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    fn new_inner(
        sink: Sink,
        strategy: BoxedStrategy<T>,
    ) -> StreamResult<(Self, impl Future<Output = ()>)> {
        let high_water_mark = strategy.high_water_mark();
        if high_water_mark.is_nan() || high_water_mark < 0.0 {
            return Err(StreamError::InvalidHighWaterMark(high_water_mark));
        }

        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let controller = WritableStreamDefaultController::new(ctrl_tx);

        let backpressure = high_water_mark <= 0.0;
        let published = SharedPtr::new(RwLock::new(StreamSnapshot {
            state: StreamState::Writable,
            stored_error: None,
            close_queued_or_in_flight: false,
        }));
        let backlog = SharedPtr::new(Mutex::new(Backlog {
            strategy,
            high_water_mark,
            total_size: 0.0,
        }));

        let mut inner = WritableStreamInner {
            state: StreamState::Writable,
            stored_error: None,
            queue: VecDeque::new(),
            queue_total_size: 0.0,
            write_requests: VecDeque::new(),
            in_flight_write: None,
            close_request: None,
            in_flight_close: None,
            pending_abort: None,
            flush_requests: Vec::new(),
            backpressure,
            started: false,
            backlog: SharedPtr::clone(&backlog),
            sink: None,
            algorithms_cleared: false,
            controller,
            ctrl_rx,
            inflight: None,
            writer: None,
            published: SharedPtr::clone(&published),
        };
        inner.start(sink);

        let stream = Self {
            command_tx,
            locked: SharedPtr::new(AtomicBool::new(false)),
            published,
            backlog,
            _sink: PhantomData,
        };

        Ok((stream, stream_task(command_rx, inner)))
    }
}

pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink. Runs exactly once, before any write.
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink
    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

// Inflight sink operations being driven
enum InFlight<Sink> {
    Start(PlatformBoxFutureStatic<(Sink, StreamResult<()>)>),
    Write(PlatformBoxFutureStatic<(Sink, StreamResult<()>)>),
    Close(PlatformBoxFutureStatic<StreamResult<()>>),
    Abort {
        fut: PlatformBoxFutureStatic<StreamResult<()>>,
        completions: Vec<Completion>,
    },
}

enum Settled<Sink> {
    Start(Sink, StreamResult<()>),
    Write(Sink, StreamResult<()>),
    Close(StreamResult<()>),
    Abort(Vec<Completion>, StreamResult<()>),
}

impl<Sink> InFlight<Sink> {
    fn poll_settled(&mut self, cx: &mut Context<'_>) -> Poll<Settled<Sink>> {
        match self {
            InFlight::Start(fut) => fut
                .as_mut()
                .poll(cx)
                .map(|(sink, result)| Settled::Start(sink, result)),
            InFlight::Write(fut) => fut
                .as_mut()
                .poll(cx)
                .map(|(sink, result)| Settled::Write(sink, result)),
            InFlight::Close(fut) => fut.as_mut().poll(cx).map(Settled::Close),
            InFlight::Abort { fut, completions } => fut
                .as_mut()
                .poll(cx)
                .map(|result| Settled::Abort(std::mem::take(completions), result)),
        }
    }
}

struct WritableStreamInner<T, Sink> {
    state: StreamState,
    stored_error: Option<StreamError>,
    queue: VecDeque<QueueElement<T>>,
    queue_total_size: f64,
    write_requests: VecDeque<Completion>,
    in_flight_write: Option<Completion>,
    close_request: Option<Completion>,
    in_flight_close: Option<Completion>,
    pending_abort: Option<AbortRequest>,
    /// Flushes waiting on a number of outstanding writes
    flush_requests: Vec<(Completion, usize)>,
    backpressure: bool,
    started: bool,
    backlog: SharedPtr<Mutex<Backlog<T>>>,
    /// `None` while the sink is moved into an in-flight future, or once cleared
    sink: Option<Sink>,
    algorithms_cleared: bool,
    controller: WritableStreamDefaultController,
    ctrl_rx: UnboundedReceiver<ControllerMsg>,
    inflight: Option<InFlight<Sink>>,
    writer: Option<SharedPtr<WriterSignals>>,
    published: SharedPtr<RwLock<StreamSnapshot>>,
}

impl<T, Sink> WritableStreamInner<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn start(&mut self, mut sink: Sink) {
        let mut controller = self.controller.clone();
        trace!("starting sink");
        self.inflight = Some(InFlight::Start(Box::pin(async move {
            let result = sink.start(&mut controller).await;
            (sink, result)
        })));
    }

    fn process_command(&mut self, cmd: StreamCommand<T>) {
        match cmd {
            StreamCommand::Write {
                chunk,
                size,
                completion,
            } => self.write(chunk, size, completion),
            StreamCommand::Close { completion } => self.close(completion),
            StreamCommand::Abort { reason, completion } => self.abort(reason, completion),
            StreamCommand::Flush { completion } => self.flush(completion),
            StreamCommand::AttachWriter { signals } => {
                {
                    let backlog = self.backlog.lock();
                    signals.reconcile(&self.snapshot(), backlog.backpressured());
                }
                self.writer = Some(signals);
            }
            StreamCommand::DetachWriter { signals } => {
                if self
                    .writer
                    .as_ref()
                    .is_some_and(|current| SharedPtr::ptr_eq(current, &signals))
                {
                    self.writer = None;
                    debug!("writer lock released");
                }
            }
        }
    }

    fn write(&mut self, chunk: T, size: f64, completion: Completion) {
        let rejection = if self.state == StreamState::Errored {
            Some(self.stored_error())
        } else if self.state == StreamState::Closed {
            Some(StreamError::Closed)
        } else if self.close_queued_or_in_flight() {
            Some(StreamError::Closing)
        } else if self.state == StreamState::Erroring {
            Some(self.stored_error())
        } else {
            None
        };
        if let Some(error) = rejection {
            self.backlog.lock().release(size);
            let _ = completion.send(Err(error));
            return;
        }

        self.write_requests.push_back(completion);

        if !is_valid_chunk_size(size) {
            warn!(size, "chunk size is not a finite, non-negative number");
            self.error_if_needed(StreamError::InvalidChunkSize(size));
            return;
        }

        self.queue.push_back(QueueElement::Chunk {
            value: Some(chunk),
            size,
        });
        self.queue_total_size += size;
        trace!(size, queue_total_size = self.queue_total_size, "chunk queued");

        self.advance_queue_if_needed();
    }

    fn close(&mut self, completion: Completion) {
        match self.state {
            StreamState::Closed => {
                let _ = completion.send(Err(StreamError::Closed));
                return;
            }
            StreamState::Errored => {
                let _ = completion.send(Err(self.stored_error()));
                return;
            }
            StreamState::Writable | StreamState::Erroring => {}
        }
        if self.close_queued_or_in_flight() {
            let _ = completion.send(Err(StreamError::Closing));
            return;
        }

        self.close_request = Some(completion);
        // A pending close always unblocks writers
        if self.state == StreamState::Writable {
            self.with_writer(|writer| writer.ready.settle(Ok(())));
        }
        self.queue.push_back(QueueElement::CloseToken);
        debug!("close requested");
        self.advance_queue_if_needed();
    }

    fn abort(&mut self, reason: Option<String>, completion: Completion) {
        if self.is_terminal() {
            let _ = completion.send(Ok(()));
            return;
        }

        self.controller.signal.trigger(reason.clone());
        // Errors the sink raised before observing the signal land first.
        self.drain_controller_msgs();
        if self.is_terminal() {
            let _ = completion.send(Ok(()));
            return;
        }

        if let Some(pending) = self.pending_abort.as_mut() {
            pending.completions.push(completion);
            return;
        }

        let already_erroring = self.state == StreamState::Erroring;
        let reason = if already_erroring { None } else { reason };
        debug!(?reason, already_erroring, "abort requested");
        self.pending_abort = Some(AbortRequest {
            completions: vec![completion],
            reason: reason.clone(),
            already_erroring,
        });
        if !already_erroring {
            self.start_erroring(StreamError::Aborted(reason));
        }
    }

    fn flush(&mut self, completion: Completion) {
        if matches!(self.state, StreamState::Erroring | StreamState::Errored) {
            let _ = completion.send(Err(self.stored_error()));
            return;
        }

        // Count writes that exist RIGHT NOW when flush is called
        let outstanding = self.write_requests.len() + usize::from(self.in_flight_write.is_some());
        if outstanding == 0 {
            let _ = completion.send(Ok(()));
        } else {
            self.flush_requests.push((completion, outstanding));
        }
    }

    // When ANY write settles, decrement ALL pending flush counters
    fn settle_flush_requests(&mut self, result: &StreamResult<()>) {
        let mut i = 0;
        while i < self.flush_requests.len() {
            let (_, count) = &mut self.flush_requests[i];
            *count -= 1;

            if *count == 0 {
                let (sender, _) = self.flush_requests.swap_remove(i);
                let _ = sender.send(result.clone());
            } else {
                i += 1;
            }
        }
    }

    fn error_if_needed(&mut self, error: StreamError) {
        if self.state == StreamState::Writable {
            self.clear_algorithms();
            self.start_erroring(error);
        }
    }

    fn start_erroring(&mut self, reason: StreamError) {
        debug_assert!(self.stored_error.is_none());
        debug_assert_eq!(self.state, StreamState::Writable);
        debug!(error = %reason, "writable stream erroring");

        self.state = StreamState::Erroring;
        self.stored_error = Some(reason.clone());
        self.with_writer(|writer| writer.ready.ensure_rejected(reason));

        if !self.has_operation_marked_in_flight() && self.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        debug_assert_eq!(self.state, StreamState::Erroring);
        debug_assert!(!self.has_operation_marked_in_flight());

        self.state = StreamState::Errored;
        self.queue.clear();
        self.backlog.lock().release(self.queue_total_size);
        self.queue_total_size = 0.0;

        let error = self.stored_error();
        debug!(%error, "writable stream errored");
        for completion in self.write_requests.drain(..) {
            let _ = completion.send(Err(error.clone()));
        }
        for (completion, _) in self.flush_requests.drain(..) {
            let _ = completion.send(Err(error.clone()));
        }

        let Some(abort) = self.pending_abort.take() else {
            self.reject_close_and_closed_if_needed();
            return;
        };

        if abort.already_erroring {
            for completion in abort.completions {
                let _ = completion.send(Err(error.clone()));
            }
            self.reject_close_and_closed_if_needed();
            return;
        }

        match self.sink.take() {
            Some(mut sink) => {
                trace!("dispatching abort to sink");
                let reason = abort.reason;
                self.inflight = Some(InFlight::Abort {
                    fut: Box::pin(async move { sink.abort(reason).await }),
                    completions: abort.completions,
                });
            }
            None => self.finish_abort(abort.completions, Ok(())),
        }
    }

    fn reject_close_and_closed_if_needed(&mut self) {
        debug_assert_eq!(self.state, StreamState::Errored);
        let error = self.stored_error();
        if let Some(completion) = self.close_request.take() {
            debug_assert!(self.in_flight_close.is_none());
            let _ = completion.send(Err(error.clone()));
        }
        self.with_writer(|writer| writer.closed.settle(Err(error)));
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        if self.state == StreamState::Writable {
            self.start_erroring(error);
            return;
        }
        debug_assert_eq!(self.state, StreamState::Erroring);
        self.finish_erroring();
    }

    fn advance_queue_if_needed(&mut self) {
        if !self.started || self.has_operation_marked_in_flight() {
            return;
        }

        match self.state {
            StreamState::Closed | StreamState::Errored => return,
            // Queue processing is suspended while erroring
            StreamState::Erroring => {
                self.finish_erroring();
                return;
            }
            StreamState::Writable => {}
        }

        match self.queue.front_mut() {
            None => {}
            Some(QueueElement::CloseToken) => self.process_close(),
            Some(QueueElement::Chunk { value, .. }) => {
                if let Some(chunk) = value.take() {
                    self.process_write(chunk);
                }
            }
        }
    }

    fn process_close(&mut self) {
        debug_assert!(self.inflight.is_none());
        self.in_flight_close = self.close_request.take();
        self.queue.pop_front();
        debug_assert!(self.queue.is_empty());

        let sink = self.sink.take();
        self.clear_algorithms();
        match sink {
            Some(sink) => {
                trace!("dispatching close to sink");
                self.inflight = Some(InFlight::Close(Box::pin(async move { sink.close().await })));
            }
            None => self.finish_close(Ok(())),
        }
    }

    fn process_write(&mut self, chunk: T) {
        debug_assert!(self.inflight.is_none());
        self.in_flight_write = self.write_requests.pop_front();

        let Some(mut sink) = self.sink.take() else {
            self.finish_write(None, Err("Sink missing".into()));
            return;
        };

        let mut controller = self.controller.clone();
        trace!("dispatching write to sink");
        self.inflight = Some(InFlight::Write(Box::pin(async move {
            let result = sink.write(chunk, &mut controller).await;
            (sink, result)
        })));
    }

    fn on_settled(&mut self, settled: Settled<Sink>) {
        match settled {
            Settled::Start(sink, result) => self.finish_start(sink, result),
            Settled::Write(sink, result) => self.finish_write(Some(sink), result),
            Settled::Close(result) => self.finish_close(result),
            Settled::Abort(completions, result) => self.finish_abort(completions, result),
        }
    }

    fn finish_start(&mut self, sink: Sink, result: StreamResult<()>) {
        debug_assert!(matches!(
            self.state,
            StreamState::Writable | StreamState::Erroring
        ));
        self.started = true;
        self.restore_sink(Some(sink));

        match result {
            Ok(()) => {
                trace!("sink started");
                self.advance_queue_if_needed();
            }
            Err(error) => {
                warn!(%error, "sink start failed");
                self.deal_with_rejection(error);
            }
        }
    }

    fn finish_write(&mut self, sink: Option<Sink>, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                self.restore_sink(sink);
                if let Some(completion) = self.in_flight_write.take() {
                    let _ = completion.send(Ok(()));
                }
                self.settle_flush_requests(&Ok(()));

                if let Some(QueueElement::Chunk { size, .. }) = self.queue.pop_front() {
                    self.queue_total_size = (self.queue_total_size - size).max(0.0);
                    self.backlog.lock().release(size);
                }
                self.advance_queue_if_needed();
            }
            Err(error) => {
                warn!(%error, "sink write failed");
                if self.state == StreamState::Writable {
                    self.clear_algorithms();
                } else {
                    self.restore_sink(sink);
                }
                if let Some(completion) = self.in_flight_write.take() {
                    let _ = completion.send(Err(error.clone()));
                }
                self.settle_flush_requests(&Err(error.clone()));
                self.deal_with_rejection(error);
            }
        }
    }

    fn finish_close(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                if let Some(completion) = self.in_flight_close.take() {
                    let _ = completion.send(Ok(()));
                }
                // A close that was already running wins over a later error
                if self.state == StreamState::Erroring {
                    debug!("close committed while erroring; dropping stored error");
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort.take() {
                        for completion in abort.completions {
                            let _ = completion.send(Ok(()));
                        }
                    }
                }
                self.state = StreamState::Closed;
                debug!("writable stream closed");
                self.with_writer(|writer| writer.closed.settle(Ok(())));
            }
            Err(error) => {
                warn!(%error, "sink close failed");
                if let Some(completion) = self.in_flight_close.take() {
                    let _ = completion.send(Err(error.clone()));
                }
                if let Some(abort) = self.pending_abort.take() {
                    for completion in abort.completions {
                        let _ = completion.send(Err(error.clone()));
                    }
                }
                self.deal_with_rejection(error);
            }
        }
    }

    fn finish_abort(&mut self, completions: Vec<Completion>, result: StreamResult<()>) {
        match &result {
            Ok(()) => trace!("sink abort completed"),
            Err(error) => warn!(%error, "sink abort failed"),
        }
        for completion in completions {
            let _ = completion.send(result.clone());
        }
        self.reject_close_and_closed_if_needed();
    }

    /// Bring the writer's `ready` in line with the backlog after a step.
    ///
    /// Producers only ever make `ready` pending; resolving it, and undoing a
    /// pending flip made against a stale state, happens here. Outside the
    /// writable state only a still-pending `ready` is touched.
    fn sync_ready(&mut self) {
        let backlog = self.backlog.lock();
        let writable = self.state == StreamState::Writable;
        let backpressure = backlog.backpressured();

        if writable {
            let effective = backpressure && !self.close_queued_or_in_flight();
            if effective != self.backpressure {
                trace!(backpressure = effective, queued = backlog.total_size, "backpressure changed");
                self.backpressure = effective;
            }
        }

        if let Some(writer) = &self.writer {
            let (ready, _) = self.snapshot().writer_outcomes(backpressure);
            writer.update(|slots| {
                if writable || slots.ready.is_pending() {
                    slots.ready.reconcile(ready);
                }
            });
        }
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Errored)
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }

    /// Drop the sink; no further sink hooks run after this.
    fn clear_algorithms(&mut self) {
        self.sink = None;
        self.algorithms_cleared = true;
    }

    fn restore_sink(&mut self, sink: Option<Sink>) {
        if !self.algorithms_cleared {
            if let Some(sink) = sink {
                self.sink = Some(sink);
            }
        }
    }

    fn with_writer(&self, f: impl FnOnce(&mut WriterSlots)) {
        if let Some(writer) = &self.writer {
            writer.update(f);
        }
    }

    fn handle_controller_msg(&mut self, msg: ControllerMsg) {
        match msg {
            ControllerMsg::Error(error) => self.error_if_needed(error),
        }
    }

    fn poll_controller_msgs(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(msg)) = self.ctrl_rx.poll_next_unpin(cx) {
            self.handle_controller_msg(msg);
        }
    }

    fn drain_controller_msgs(&mut self) {
        while let Ok(Some(msg)) = self.ctrl_rx.try_next() {
            self.handle_controller_msg(msg);
        }
    }

    /// Poll the in-flight sink operation, applying each completion until one stays pending.
    fn drive_in_flight(&mut self, cx: &mut Context<'_>) {
        loop {
            let settled = match self.inflight.as_mut() {
                Some(op) => match op.poll_settled(cx) {
                    Poll::Ready(settled) => settled,
                    Poll::Pending => return,
                },
                None => return,
            };
            self.inflight = None;
            // controller.error() raised during the operation precedes its completion
            self.drain_controller_msgs();
            self.on_settled(settled);
        }
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            state: self.state,
            stored_error: self.stored_error.clone(),
            close_queued_or_in_flight: self.close_queued_or_in_flight(),
        }
    }

    fn publish(&self) {
        *self.published.write() = self.snapshot();
    }
}

async fn stream_task<T, Sink>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut inner: WritableStreamInner<T, Sink>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    let mut commands_closed = false;

    poll_fn(|cx| {
        inner.poll_controller_msgs(cx);

        while !commands_closed {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(cmd)) => inner.process_command(cmd),
                Poll::Ready(None) => {
                    trace!("all stream handles dropped");
                    commands_closed = true;
                }
                Poll::Pending => break,
            }
        }

        inner.drive_in_flight(cx);
        inner.sync_ready();
        inner.publish();

        if commands_closed && inner.inflight.is_none() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await;

    trace!(state = ?inner.state, "stream task finished");
}

enum ControllerMsg {
    /// Trigger a stream error (controller.error(...))
    Error(StreamError),
}

/// A lightweight set storing multiple wakers.
/// It ensures wakers are stored without duplicates (based on `will_wake`).
#[derive(Default)]
struct WakerSet(Vec<Waker>);

impl WakerSet {
    fn register(&mut self, waker: &Waker) {
        if !self.0.iter().any(|w| w.will_wake(waker)) {
            self.0.push(waker.clone());
        }
    }

    fn wake_all(self) {
        for waker in self.0 {
            waker.wake();
        }
    }
}

#[derive(Default)]
struct AbortSignalState {
    aborted: bool,
    reason: Option<String>,
    wakers: WakerSet,
}

/// Fires once, when the stream is first aborted.
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: SharedPtr<Mutex<AbortSignalState>>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// The reason passed to the abort that fired this signal.
    pub fn reason(&self) -> Option<String> {
        self.state.lock().reason.clone()
    }

    /// Resolves once the signal has fired.
    pub fn wait(&self) -> impl Future<Output = ()> + use<> {
        let state = SharedPtr::clone(&self.state);
        poll_fn(move |cx| {
            let mut state = state.lock();
            if state.aborted {
                Poll::Ready(())
            } else {
                state.wakers.register(cx.waker());
                Poll::Pending
            }
        })
    }

    fn trigger(&self, reason: Option<String>) {
        let wakers = {
            let mut state = self.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.reason = reason;
            std::mem::take(&mut state.wakers)
        };
        wakers.wake_all();
    }
}

#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<ControllerMsg>,
    signal: AbortSignal,
}

impl WritableStreamDefaultController {
    fn new(sender: UnboundedSender<ControllerMsg>) -> Self {
        Self {
            tx: sender,
            signal: AbortSignal::default(),
        }
    }

    /// Error the stream. Has no effect unless the stream is still writable.
    pub fn error(&self, error: StreamError) {
        // ignore send failure if the stream task is gone
        let _ = self.tx.unbounded_send(ControllerMsg::Error(error));
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Returns `true` if the stream has been aborted.
    ///
    /// This is a synchronous check of the abort signal.
    pub fn is_aborted(&self) -> bool {
        self.signal.aborted()
    }

    /// Returns a future that resolves once the stream is aborted.
    ///
    /// # Usage
    ///
    /// Sink implementors should `select!` on this future alongside their
    /// actual write work, so they can stop promptly if the stream aborts:
    ///
    /// ```ignore
    /// async fn write(
    ///     &mut self,
    ///     chunk: Vec<u8>,
    ///     controller: &mut WritableStreamDefaultController,
    /// ) -> StreamResult<()> {
    ///     tokio::select! {
    ///         _ = controller.abort_future() => {
    ///             Err(StreamError::Aborted(None))
    ///         }
    ///         _ = async {
    ///             // do actual I/O
    ///         } => {
    ///             Ok(())
    ///         }
    ///     }
    /// }
    /// ```
    pub fn abort_future(&self) -> impl Future<Output = ()> + use<> {
        self.signal.wait()
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted)` carrying the
    /// abort reason. Otherwise, returns the result of the future wrapped in `Ok`.
    pub fn with_abort<F, T>(&self, fut: F) -> impl Future<Output = StreamResult<T>> + use<F, T>
    where
        F: Future<Output = T>,
    {
        let signal = self.signal.clone();
        let abort_fut = Box::pin(signal.wait());
        let fut = Box::pin(fut);

        future::select(fut, abort_fut).map(move |either| match either {
            Either::Left((value, _)) => Ok(value),
            Either::Right(((), _)) => Err(StreamError::Aborted(signal.reason())),
        })
    }
}

pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static, Sink> {
    stream: WritableStream<T, Sink>,
    signals: SharedPtr<WriterSignals>,
    released: bool,
    pending_ready: Option<SignalFuture>,
    pending_flush: Option<OperationFuture>,
    pending_close: Option<OperationFuture>,
}

impl<T: MaybeSend + 'static, Sink> WritableStreamDefaultWriter<T, Sink> {
    /// Create a new writer linked to the stream
    fn new(stream: WritableStream<T, Sink>, signals: SharedPtr<WriterSignals>) -> Self {
        Self {
            stream,
            signals,
            released: false,
            pending_ready: None,
            pending_flush: None,
            pending_close: None,
        }
    }

    /// Write a chunk to the stream by immediately enqueueing it for writing.
    ///
    /// The chunk is queued when this method is called; the returned future
    /// resolves once the sink has settled the write for this chunk, or rejects
    /// with the stream's stored error if the stream errors first.
    ///
    /// # Important
    ///
    /// Calling `write()` repeatedly *without* awaiting `ready()` (i.e without
    /// respecting backpressure) can cause unbounded growth of the internal queue.
    ///
    /// To avoid excessive buffering, it is recommended to either:
    /// - Await each `write()` call or
    /// - Await `ready()` before calling `write()` to respect backpressure signals, or
    /// - Use the [`enqueue_when_ready()`] helper method which does this automatically.
    ///
    /// # Example
    ///
    /// ```ignore
    /// writer.ready().await?;
    /// writer.write(chunk).await?;
    /// ```
    ///
    /// [`enqueue_when_ready()`]: Self::enqueue_when_ready
    pub fn write(&self, chunk: T) -> OperationFuture {
        let (tx, rx) = oneshot::channel();
        match self.stream.send_write(chunk, tx, Some(&*self.signals)) {
            Ok(()) => OperationFuture::waiting(rx),
            Err(error) => OperationFuture::failed(error),
        }
    }

    /// Waits for the stream to be ready (i.e., no backpressure) before enqueuing
    /// the write, without waiting for the write itself to complete.
    ///
    /// Write failures surface through `ready()`, `closed()` and later writes.
    pub async fn enqueue_when_ready(&self, chunk: T) -> StreamResult<()> {
        self.ready().await?;
        self.enqueue(chunk)
    }

    /// Immediately enqueue a chunk for writing without waiting for completion.
    ///
    /// # Memory Considerations
    ///
    /// This method doesn't respect backpressure signals; repeated calls without
    /// awaiting [`ready()`] can lead to unbounded queue growth.
    ///
    /// [`ready()`]: Self::ready
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.stream.check_writable()?;

        let (tx, _rx) = oneshot::channel(); // Drop the receiver since we don't wait
        self.stream.send_write(chunk, tx, Some(&*self.signals))
    }

    /// Close the stream once every queued chunk has been written.
    pub fn close(&self) -> OperationFuture {
        self.stream
            .request(|completion| StreamCommand::Close { completion })
    }

    /// Abort the stream with an optional reason
    pub fn abort(&self, reason: Option<String>) -> OperationFuture {
        self.stream.abort(reason)
    }

    /// Get the desired size synchronously (how much data the stream can accept)
    /// Returns None if the stream is erroring or errored
    pub fn desired_size(&self) -> Option<f64> {
        self.stream.desired_size()
    }

    /// Resolves when the stream has no backpressure; rejects once it errors or
    /// this writer is released.
    pub fn ready(&self) -> SignalFuture {
        self.signals.ready()
    }

    /// Resolves when the stream closes; rejects once it errors or this writer
    /// is released.
    pub fn closed(&self) -> SignalFuture {
        self.signals.closed()
    }

    /// Release the lock so another writer can be acquired.
    ///
    /// Futures previously obtained from `ready()` and `closed()` that had not yet
    /// settled reject with [`StreamError::Released`].
    pub fn release(mut self) {
        self.release_lock();
    }

    fn release_lock(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.signals.release();
        let _ = self
            .stream
            .command_tx
            .unbounded_send(StreamCommand::DetachWriter {
                signals: SharedPtr::clone(&self.signals),
            });
        self.stream.locked.store(false, Ordering::SeqCst);
    }
}

impl<T: MaybeSend + 'static, Sink> Drop for WritableStreamDefaultWriter<T, Sink> {
    fn drop(&mut self) {
        self.release_lock();
    }
}

impl<T: MaybeSend + 'static, Sink> futures::Sink<T> for WritableStreamDefaultWriter<T, Sink> {
    type Error = StreamError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = &mut *self;
        let ready_fut = this.pending_ready.get_or_insert_with(|| this.signals.ready());
        let result = ready!(ready_fut.poll_unpin(cx));
        this.pending_ready = None;
        Poll::Ready(result)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        self.enqueue(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = &mut *self;
        let flush = this
            .pending_flush
            .get_or_insert_with(|| this.stream.request(|completion| StreamCommand::Flush { completion }));
        let result = ready!(flush.poll_unpin(cx));
        this.pending_flush = None;
        Poll::Ready(result)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = &mut *self;

        // Already closed?
        if this.pending_close.is_none() && this.stream.state() == StreamState::Closed {
            return Poll::Ready(Ok(()));
        }

        let close = this
            .pending_close
            .get_or_insert_with(|| this.stream.request(|completion| StreamCommand::Close { completion }));
        let result = ready!(close.poll_unpin(cx));
        this.pending_close = None;
        match result {
            Err(StreamError::Closed) => Poll::Ready(Ok(())),
            other => Poll::Ready(other),
        }
    }
}

pub struct WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + driver future without spawning
    ///
    /// Fails if the strategy's high water mark is NaN or negative.
    pub fn prepare(self) -> StreamResult<(WritableStream<T, Sink>, impl Future<Output = ()>)> {
        WritableStream::new_inner(self.sink, self.strategy)
    }

    /// Spawn the driver with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T, Sink>>
    where
        F: FnOnce(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use futures::SinkExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn poll_now<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        Pin::new(fut).poll(&mut cx)
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        log: SharedPtr<std::sync::Mutex<Vec<String>>>,
        gate: Option<SharedPtr<Semaphore>>,
        fail_write_on: Option<String>,
        fail_close: bool,
    }

    impl RecordingSink {
        fn gated() -> (Self, SharedPtr<Semaphore>) {
            let gate = SharedPtr::new(Semaphore::new(0));
            (
                Self {
                    gate: Some(gate.clone()),
                    ..Self::default()
                },
                gate,
            )
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        async fn pass_gate(&self) {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
        }
    }

    impl WritableSink<String> for RecordingSink {
        async fn start(
            &mut self,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.record("start".to_string());
            Ok(())
        }

        async fn write(
            &mut self,
            chunk: String,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.record(format!("write {}", chunk));
            self.pass_gate().await;
            if self.fail_write_on.as_deref() == Some(chunk.as_str()) {
                return Err(format!("cannot write {}", chunk).into());
            }
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.record("close".to_string());
            self.pass_gate().await;
            if self.fail_close {
                return Err("close failed".into());
            }
            Ok(())
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.record(format!("abort {}", reason.unwrap_or_default()));
            Ok(())
        }
    }

    fn spawn_stream(
        sink: RecordingSink,
        high_water_mark: f64,
    ) -> WritableStream<String, RecordingSink> {
        WritableStream::builder(sink)
            .strategy(CountQueuingStrategy::new(high_water_mark))
            .spawn(tokio::spawn)
            .expect("valid strategy")
    }

    #[tokio::test]
    async fn writes_chunks_to_sink_then_closes() {
        let sink = RecordingSink::default();
        let stream = spawn_stream(sink.clone(), 2.0);
        let writer = stream.get_writer().expect("failed to get writer");

        writer.write("a".into()).await.expect("first write failed");
        writer.write("b".into()).await.expect("second write failed");
        writer.close().await.expect("close failed");
        writer.closed().await.expect("closed future rejected");

        assert_eq!(sink.entries(), vec!["start", "write a", "write b", "close"]);
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn rejects_invalid_high_water_mark() {
        let result = WritableStream::builder(RecordingSink::default())
            .strategy(CountQueuingStrategy::new(f64::NAN))
            .prepare();
        assert!(matches!(
            result.err(),
            Some(StreamError::InvalidHighWaterMark(_))
        ));

        let result = WritableStream::builder(RecordingSink::default())
            .strategy(CountQueuingStrategy::new(-1.0))
            .prepare();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ready_tracks_queue_against_high_water_mark() {
        let (sink, gate) = RecordingSink::gated();
        let stream = spawn_stream(sink, 2.0);
        let writer = stream.get_writer().expect("failed to get writer");
        settle().await;

        assert_eq!(writer.desired_size(), Some(2.0));
        let first = writer.write("a".into());
        assert_eq!(writer.desired_size(), Some(1.0));
        assert!(poll_now(&mut writer.ready()).is_ready());

        let second = writer.write("b".into());
        assert_eq!(writer.desired_size(), Some(0.0));
        let mut ready = writer.ready();
        assert!(poll_now(&mut ready).is_pending());

        gate.add_permits(1);
        first.await.expect("first write failed");
        settle().await;
        assert!(matches!(poll_now(&mut ready), Poll::Ready(Ok(()))));

        gate.add_permits(1);
        second.await.expect("second write failed");
        assert_eq!(writer.desired_size(), Some(2.0));
    }

    #[tokio::test]
    async fn ready_turns_pending_as_soon_as_write_is_sent() {
        let (sink, gate) = RecordingSink::gated();
        let stream = spawn_stream(sink, 1.0);
        let writer = stream.get_writer().expect("failed to get writer");
        writer.ready().await.expect("ready rejected");

        let first = writer.write("a".into());
        assert_eq!(writer.desired_size(), Some(0.0));
        let mut ready = writer.ready();
        assert!(poll_now(&mut ready).is_pending());

        writer.enqueue("b".into()).expect("enqueue failed");
        assert_eq!(writer.desired_size(), Some(-1.0));
        assert!(poll_now(&mut writer.ready()).is_pending());

        gate.add_permits(2);
        first.await.expect("first write failed");
        tokio::time::timeout(Duration::from_secs(1), ready)
            .await
            .expect("ready did not resolve once the queue drained")
            .expect("ready rejected");
        assert_eq!(writer.desired_size(), Some(1.0));
    }

    #[tokio::test]
    async fn close_unblocks_ready_while_backpressured() {
        let (sink, gate) = RecordingSink::gated();
        let stream = spawn_stream(sink, 1.0);
        let writer = stream.get_writer().expect("failed to get writer");

        let write = writer.write("a".into());
        settle().await;
        let mut ready = writer.ready();
        assert!(poll_now(&mut ready).is_pending());

        let close = writer.close();
        settle().await;
        assert!(matches!(poll_now(&mut ready), Poll::Ready(Ok(()))));

        gate.add_permits(2);
        write.await.expect("write failed");
        close.await.expect("close failed");
    }

    #[tokio::test]
    async fn write_failure_errors_stream_and_rejects_queued_work() {
        let sink = RecordingSink {
            fail_write_on: Some("bad".into()),
            ..RecordingSink::default()
        };
        let stream = spawn_stream(sink.clone(), 10.0);
        let writer = stream.get_writer().expect("failed to get writer");

        let bad = writer.write("bad".into());
        let queued = writer.write("later".into());
        let close = writer.close();

        let err = bad.await.expect_err("failing write should reject");
        assert_eq!(err.to_string(), "cannot write bad");
        assert_eq!(queued.await.unwrap_err().to_string(), "cannot write bad");
        assert_eq!(close.await.unwrap_err().to_string(), "cannot write bad");
        assert_eq!(
            writer.closed().await.unwrap_err().to_string(),
            "cannot write bad"
        );
        assert!(writer.ready().await.is_err());

        assert_eq!(stream.state(), StreamState::Errored);
        assert_eq!(writer.desired_size(), None);
        // the sink is dropped after a failed write, so abort never reaches it
        writer.abort(Some("late".into())).await.expect("abort after error");
        assert!(!sink.entries().iter().any(|e| e.starts_with("abort")));
    }

    #[tokio::test]
    async fn abort_waits_for_in_flight_write_then_aborts_sink() {
        let (sink, gate) = RecordingSink::gated();
        let stream = spawn_stream(sink.clone(), 10.0);
        let writer = stream.get_writer().expect("failed to get writer");

        let in_flight = writer.write("a".into());
        let queued = writer.write("b".into());
        settle().await;

        let abort = writer.abort(Some("stop".into()));
        settle().await;
        assert_eq!(stream.state(), StreamState::Erroring);
        assert!(!sink.entries().contains(&"abort stop".to_string()));
        assert!(writer.ready().await.is_err());

        gate.add_permits(1);
        in_flight.await.expect("in-flight write should complete");
        assert!(matches!(
            queued.await,
            Err(StreamError::Aborted(Some(reason))) if reason == "stop"
        ));
        abort.await.expect("abort failed");

        assert_eq!(sink.entries(), vec!["start", "write a", "abort stop"]);
        assert_eq!(stream.state(), StreamState::Errored);
        assert!(matches!(
            writer.closed().await,
            Err(StreamError::Aborted(_))
        ));
    }

    #[tokio::test]
    async fn repeated_abort_joins_pending_request() {
        let (sink, gate) = RecordingSink::gated();
        let stream = spawn_stream(sink.clone(), 10.0);

        let write = stream.write("a".into());
        settle().await;
        let first = stream.abort(Some("once".into()));
        let second = stream.abort(Some("twice".into()));

        gate.add_permits(1);
        write.await.expect("write failed");
        first.await.expect("first abort failed");
        second.await.expect("second abort failed");

        let aborts: Vec<_> = sink
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("abort"))
            .collect();
        assert_eq!(aborts, vec!["abort once"]);
        stream.abort(None).await.expect("abort on errored stream");
    }

    #[tokio::test]
    async fn abort_during_failing_close_rejects_with_close_error() {
        let (mut sink, gate) = RecordingSink::gated();
        sink.fail_close = true;
        let stream = spawn_stream(sink.clone(), 10.0);
        let writer = stream.get_writer().expect("failed to get writer");

        let close = writer.close();
        settle().await;
        let abort = writer.abort(Some("cancel".into()));
        settle().await;

        gate.add_permits(1);
        assert_eq!(close.await.unwrap_err().to_string(), "close failed");
        assert_eq!(abort.await.unwrap_err().to_string(), "close failed");
        assert_eq!(stream.state(), StreamState::Errored);
        // the stored error is the abort reason; the close failure only rejected the promises
        assert!(matches!(
            writer.closed().await,
            Err(StreamError::Aborted(Some(_)))
        ));
    }

    #[tokio::test]
    async fn controller_error_errors_stream_after_in_flight_write() {
        struct SelfErroringSink;

        impl WritableSink<u32> for SelfErroringSink {
            async fn write(
                &mut self,
                chunk: u32,
                controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                if chunk == 2 {
                    controller.error("sink gave up".into());
                }
                Ok(())
            }

            async fn abort(&mut self, _reason: Option<String>) -> StreamResult<()> {
                panic!("sink must not be aborted after controller.error()");
            }
        }

        let stream = WritableStream::builder(SelfErroringSink)
            .strategy(CountQueuingStrategy::new(10.0))
            .spawn(tokio::spawn)
            .expect("valid strategy");
        let writer = stream.get_writer().expect("failed to get writer");

        let first = writer.write(1);
        let second = writer.write(2);
        let third = writer.write(3);

        first.await.expect("first write failed");
        second.await.expect("write that raised the error still completes");
        assert_eq!(third.await.unwrap_err().to_string(), "sink gave up");
        assert_eq!(stream.state(), StreamState::Errored);
        stream.abort(None).await.expect("abort on errored stream");
    }

    #[tokio::test]
    async fn invalid_chunk_size_errors_stream() {
        struct NegativeSize;

        impl QueuingStrategy<String> for NegativeSize {
            fn size(&self, chunk: &String) -> f64 {
                if chunk == "bad" { -1.0 } else { 1.0 }
            }

            fn high_water_mark(&self) -> f64 {
                4.0
            }
        }

        let stream = WritableStream::builder(RecordingSink::default())
            .strategy(NegativeSize)
            .spawn(tokio::spawn)
            .expect("valid strategy");

        stream.write("ok".into()).await.expect("valid write failed");
        assert!(matches!(
            stream.write("bad".into()).await,
            Err(StreamError::InvalidChunkSize(size)) if size == -1.0
        ));
        assert!(matches!(
            stream.write("ok".into()).await,
            Err(StreamError::InvalidChunkSize(_))
        ));
        assert_eq!(stream.state(), StreamState::Errored);
    }

    #[tokio::test]
    async fn start_failure_errors_stream() {
        struct BrokenSink;

        impl WritableSink<String> for BrokenSink {
            async fn start(
                &mut self,
                _controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                Err("device unavailable".into())
            }

            async fn write(
                &mut self,
                _chunk: String,
                _controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                panic!("write must not run after a failed start");
            }
        }

        let stream = WritableStream::builder(BrokenSink)
            .spawn(tokio::spawn)
            .expect("valid strategy");
        let write = stream.write("x".into());

        assert_eq!(write.await.unwrap_err().to_string(), "device unavailable");
        assert_eq!(stream.state(), StreamState::Errored);
        assert!(stream.close().await.is_err());
    }

    #[tokio::test]
    async fn abort_signal_interrupts_sink_work() {
        #[derive(Clone, Default)]
        struct HangingSink {
            aborted_with: SharedPtr<std::sync::Mutex<Option<String>>>,
        }

        impl WritableSink<String> for HangingSink {
            async fn write(
                &mut self,
                _chunk: String,
                controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                controller.with_abort(future::pending::<()>()).await
            }

            async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
                *self.aborted_with.lock().unwrap() = reason;
                Ok(())
            }
        }

        let sink = HangingSink::default();
        let stream = WritableStream::builder(sink.clone())
            .spawn(tokio::spawn)
            .expect("valid strategy");

        let write = stream.write("stuck".into());
        settle().await;
        stream.abort(Some("timeout".into())).await.expect("abort failed");

        assert!(matches!(
            write.await,
            Err(StreamError::Aborted(Some(reason))) if reason == "timeout"
        ));
        assert_eq!(
            sink.aborted_with.lock().unwrap().as_deref(),
            Some("timeout")
        );
    }

    #[tokio::test]
    async fn release_rejects_writer_futures_and_unlocks() {
        let stream = spawn_stream(RecordingSink::default(), 1.0);
        let writer = stream.get_writer().expect("failed to get writer");
        assert!(stream.locked());
        assert!(matches!(stream.get_writer().err(), Some(StreamError::Locked)));
        assert!(matches!(
            stream.close().await,
            Err(StreamError::Locked)
        ));

        let closed = writer.closed();
        writer.release();

        assert!(matches!(closed.await, Err(StreamError::Released)));
        assert!(!stream.locked());

        let writer = stream.get_writer().expect("get_writer after release failed");
        writer.write("x".into()).await.expect("write failed");
        drop(writer);
        assert!(!stream.locked());
        stream.close().await.expect("close after drop failed");
    }

    #[tokio::test]
    async fn writer_acquired_after_terminal_state_is_seeded() {
        let stream = spawn_stream(RecordingSink::default(), 1.0);
        stream.close().await.expect("close failed");
        assert_eq!(stream.desired_size(), Some(0.0));

        let writer = stream.get_writer().expect("failed to get writer");
        writer.ready().await.expect("ready should resolve on a closed stream");
        writer.closed().await.expect("closed should resolve on a closed stream");
        assert!(matches!(
            writer.close().await,
            Err(StreamError::Closed)
        ));
        assert!(matches!(
            writer.write("late".into()).await,
            Err(StreamError::Closed)
        ));

        let errored = spawn_stream(RecordingSink::default(), 1.0);
        errored.abort(Some("gone".into())).await.expect("abort failed");
        let writer = errored.get_writer().expect("failed to get writer");
        assert!(matches!(writer.ready().await, Err(StreamError::Aborted(_))));
        assert!(matches!(writer.closed().await, Err(StreamError::Aborted(_))));
    }

    #[tokio::test]
    async fn second_close_is_rejected_while_first_is_pending() {
        let (sink, gate) = RecordingSink::gated();
        let stream = spawn_stream(sink, 1.0);

        let first = stream.close();
        let second = stream.close();
        assert!(matches!(second.await, Err(StreamError::Closing)));
        assert!(matches!(
            stream.write("x".into()).await,
            Err(StreamError::Closing)
        ));

        gate.add_permits(1);
        first.await.expect("close failed");
    }

    #[tokio::test]
    async fn writer_works_as_futures_sink() {
        let sink = RecordingSink::default();
        let stream = spawn_stream(sink.clone(), 1.0);
        let mut writer = stream.get_writer().expect("failed to get writer");

        let mut items = futures::stream::iter(vec!["x".to_string(), "y".into(), "z".into()]).map(Ok);
        writer.send_all(&mut items).await.expect("send_all failed");
        SinkExt::close(&mut writer).await.expect("sink close failed");
        SinkExt::close(&mut writer).await.expect("closing twice is fine");

        assert_eq!(
            sink.entries(),
            vec!["start", "write x", "write y", "write z", "close"]
        );
    }

    #[tokio::test]
    async fn flush_waits_for_previously_queued_writes() {
        let (sink, gate) = RecordingSink::gated();
        let stream = spawn_stream(sink, 10.0);
        let mut writer = stream.get_writer().expect("failed to get writer");

        writer.enqueue("a".into()).expect("enqueue failed");
        writer.enqueue("b".into()).expect("enqueue failed");
        let mut flush = Box::pin(writer.flush());
        settle().await;
        assert!(poll_now(&mut flush).is_pending());

        gate.add_permits(1);
        settle().await;
        assert!(poll_now(&mut flush).is_pending());

        gate.add_permits(1);
        flush.await.expect("flush failed");
    }

    #[tokio::test]
    async fn driver_finishes_once_handles_are_dropped() {
        let written = SharedPtr::new(AtomicUsize::new(0));

        struct CountingSink(SharedPtr<AtomicUsize>);

        impl WritableSink<u8> for CountingSink {
            async fn write(
                &mut self,
                _chunk: u8,
                _controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (stream, driver) = WritableStream::builder(CountingSink(written.clone()))
            .strategy(CountQueuingStrategy::new(4.0))
            .prepare()
            .expect("valid strategy");
        let handle = tokio::spawn(driver);

        let write = stream.write(1);
        drop(stream);
        write.await.expect("write queued before drop should complete");

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("driver did not finish")
            .expect("driver panicked");
        assert_eq!(written.load(Ordering::SeqCst), 1);
    }
}
