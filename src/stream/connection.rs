//! Consumer-facing connection handle and the per-handler dispatch registry.
//!
//! Every registered handler owns a bounded queue drained by its own task, so
//! a slow handler only delays itself. Handler panics are caught and logged.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::stream::client::StreamError;
use crate::stream::proto::{ClientMessage, StreamSubscription};
use crate::types::Signal;

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Error delivered to stream callbacks.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamFault {
    pub kind: ErrorKind,
    /// Server-provided error code, when the fault came from the server.
    pub code: Option<String>,
    pub message: String,
    /// Set on the final fault before the connection closes.
    pub terminal: bool,
}

impl StreamFault {
    pub(crate) fn server(code: String, message: String) -> Self {
        Self {
            kind: ErrorKind::Request,
            code: Some(code),
            message,
            terminal: false,
        }
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Decode,
            code: None,
            message: message.into(),
            terminal: false,
        }
    }

    pub(crate) fn terminal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            terminal: true,
        }
    }
}

/// Event pushed to stream callbacks, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Signal(Signal),
    Error(StreamFault),
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

pub(crate) type EventHandler = Box<dyn Fn(&StreamEvent) + Send + Sync + 'static>;
pub(crate) type ErrorHandler = Box<dyn Fn(&StreamFault) + Send + Sync + 'static>;

pub(crate) enum Handler {
    Event(EventHandler),
    Error(ErrorHandler),
}

impl Handler {
    fn call(&self, event: &StreamEvent) {
        match (self, event) {
            (Self::Event(handler), event) => handler(event),
            (Self::Error(handler), StreamEvent::Error(fault)) => handler(fault),
            (Self::Error(_), _) => {}
        }
    }
}

static NEXT_SLOT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    // Slot whose handler is running on this thread, if any.
    static DISPATCHING: Cell<Option<usize>> = const { Cell::new(None) };
}

// Held by the handler task; the gate is read-locked around each call.
struct SlotGate {
    id: usize,
    gate: RwLock<()>,
}

#[derive(Clone)]
struct Slot {
    shared: Arc<SlotGate>,
    errors_only: bool,
    queue: mpsc::Sender<StreamEvent>,
}

impl Slot {
    fn wants(&self, event: &StreamEvent) -> bool {
        !self.errors_only || matches!(event, StreamEvent::Error(_))
    }
}

pub(crate) struct Dispatcher {
    slots: Mutex<Vec<Slot>>,
    closed: Arc<AtomicBool>,
    finished: AtomicBool,
    capacity: usize,
    runtime: Handle,
}

impl Dispatcher {
    pub(crate) fn new(capacity: usize, runtime: Handle) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
            finished: AtomicBool::new(false),
            capacity: capacity.max(1),
            runtime,
        }
    }

    pub(crate) fn register(&self, handler: Handler) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire) {
            return;
        }

        let (queue, rx) = mpsc::channel(self.capacity);
        let shared = Arc::new(SlotGate {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            gate: RwLock::new(()),
        });
        slots.push(Slot {
            shared: Arc::clone(&shared),
            errors_only: matches!(handler, Handler::Error(_)),
            queue,
        });
        drop(slots);

        let closed = Arc::clone(&self.closed);
        self.runtime.spawn(run_slot(shared, rx, handler, closed));
    }

    pub(crate) fn dispatch(&self, event: &StreamEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for slot in slots.iter().filter(|slot| slot.wants(event)) {
            match slot.queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(event = "stream_handler_lagging", handler_id = slot.shared.id);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Releases handlers after the final events have been queued.
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Stops all dispatch. Returns `false` when already closed.
    ///
    /// Waits for handler calls running on other threads; a handler calling
    /// this on its own thread is not waited for.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let slots = std::mem::take(&mut *self.slots.lock().unwrap_or_else(PoisonError::into_inner));
        let current = DISPATCHING.with(Cell::get);
        for slot in slots.iter().filter(|slot| Some(slot.shared.id) != current) {
            drop(slot.shared.gate.write().unwrap_or_else(PoisonError::into_inner));
        }
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn run_slot(
    slot: Arc<SlotGate>,
    mut rx: mpsc::Receiver<StreamEvent>,
    handler: Handler,
    closed: Arc<AtomicBool>,
) {
    while let Some(event) = rx.recv().await {
        let _gate = slot.gate.read().unwrap_or_else(PoisonError::into_inner);
        if closed.load(Ordering::Acquire) {
            break;
        }

        DISPATCHING.with(|current| current.set(Some(slot.id)));
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.call(&event)));
        DISPATCHING.with(|current| current.set(None));

        if outcome.is_err() {
            warn!(event = "stream_handler_panicked", handler_id = slot.id);
        }
    }
    debug!(event = "stream_handler_released", handler_id = slot.id);
}

/// Shared lifecycle cell written by the worker and the handle.
pub(crate) struct Lifecycle {
    state: watch::Sender<ConnectionState>,
    dispatcher: Dispatcher,
}

impl Lifecycle {
    pub(crate) fn new(dispatcher: Dispatcher) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self { state, dispatcher }
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to `next` and emits `StateChanged`. `Closed` is final.
    pub(crate) fn transition(&self, next: ConnectionState) {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });

        if let Some(from) = previous {
            debug!(event = "stream_state_changed", from = ?from, to = ?next);
            self.dispatcher
                .dispatch(&StreamEvent::StateChanged { from, to: next });
        }
    }

    /// Emits a terminal fault, closes, and releases handlers.
    pub(crate) fn fail(&self, fault: StreamFault) {
        warn!(event = "stream_terminal_error", kind = ?fault.kind, message = %fault.message);
        self.dispatcher.dispatch(&StreamEvent::Error(fault));
        self.transition(ConnectionState::Closed);
        self.dispatcher.finish();
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

/// Live stream connection owned by one consumer.
///
/// Dropping the handle closes the connection.
pub struct StreamConnection {
    lifecycle: Arc<Lifecycle>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shutdown: watch::Sender<bool>,
}

impl StreamConnection {
    pub(crate) fn new(
        lifecycle: Arc<Lifecycle>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            lifecycle,
            outbound,
            shutdown,
        }
    }

    /// Registers a handler for every event dispatched from now on.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.lifecycle
            .dispatcher()
            .register(Handler::Event(Box::new(handler)));
    }

    /// Registers a handler for error faults dispatched from now on.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&StreamFault) + Send + Sync + 'static,
    {
        self.lifecycle
            .dispatcher()
            .register(Handler::Error(Box::new(handler)));
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Waits until the connection reaches `target` or closes.
    ///
    /// Returns the state that ended the wait.
    pub async fn wait_for_state(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.lifecycle.subscribe();
        let reached = rx
            .wait_for(|state| *state == target || *state == ConnectionState::Closed)
            .await
            .map(|state| *state);
        reached.unwrap_or_else(|_| self.state())
    }

    /// Sends a heartbeat ping; queued while reconnecting.
    pub fn send_ping(&self, client_time_ms: u64) -> Result<(), StreamError> {
        self.send(ClientMessage::Ping { client_time_ms })
    }

    /// Replaces the server-side filter; also applied on every reconnect.
    pub fn update_subscription(&self, subscription: StreamSubscription) -> Result<(), StreamError> {
        self.send(ClientMessage::Subscribe(subscription))
    }

    fn send(&self, message: ClientMessage) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::SendQueueClosed);
        }
        self.outbound
            .send(message)
            .map_err(|_| StreamError::SendQueueClosed)
    }

    /// Closes the connection. Idempotent.
    ///
    /// Once this returns no handler is invoked again. Handler calls already
    /// running on other threads are waited for synchronously, so a slow
    /// handler blocks the calling thread (including a tokio worker thread)
    /// until it returns. Dropping the handle closes it the same way.
    pub fn close(&self) {
        if !self.lifecycle.dispatcher().close() {
            return;
        }
        self.lifecycle.transition(ConnectionState::Closed);
        let _ = self.shutdown.send(true);
        debug!(event = "stream_closed_by_consumer");
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("state", &self.state())
            .field("closed", &self.lifecycle.dispatcher().is_closed())
            .finish()
    }
}
