//! Handshake framework — challenge/response protocols as named states.
//!
//! Wraps one [`StateMachine`] per handshake attempt. Edge actions registered
//! through [`Handshake::add_path`] get error capture: any failure is
//! recorded and redirected to the reserved `ERROR` state, which always
//! chains to `END`. Inbound data is queued and awaited with typed shape
//! checking, and the whole run sits under a watchdog that expires only when
//! no state change happened inside the last window, giving each protocol
//! step its own timeout rather than one global deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::fsm::{END, EdgeAction, Flow, FsmEvent, StateMachine, goto, stay};

/// Reserved failure state. Every registered state gets an implicit edge
/// here, and `ERROR` itself always chains to `END`.
pub const ERROR_STATE: &str = "ERROR";

/// Outcome of a handshake run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The machine reached `END` cleanly.
    Ok,
    /// A step failed; carries the recorded reason.
    Error(String),
    /// No state change happened within a timeout window.
    Timeout,
}

/// Clonable handle on the handshake's inbound data queue.
#[derive(Clone)]
pub struct Inbox {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>>,
}

impl Inbox {
    /// Await the next queued message deserialized into `T`. Resolves `None`
    /// when the arriving data does not match the expected shape (the caller
    /// translates that into an error transition) or when the queue closes.
    pub async fn next<T: DeserializeOwned>(&self) -> Option<T> {
        let value = self.rx.lock().await.recv().await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!("handshake data shape mismatch: {e}");
                None
            }
        }
    }

    /// Await the next queued message without shape checking.
    pub async fn next_value(&self) -> Option<Value> {
        self.rx.lock().await.recv().await
    }
}

/// One handshake attempt, driving a state machine under a step watchdog.
pub struct Handshake {
    machine: StateMachine,
    tx: mpsc::UnboundedSender<Value>,
    inbox: Inbox,
    failure: Arc<parking_lot::Mutex<Option<String>>>,
    step_timeout: Duration,
}

impl Handshake {
    /// Create a handshake with the given per-step timeout window.
    pub fn new(step_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut machine = StateMachine::new();
        machine.add_path(ERROR_STATE, END, stay());

        Self {
            machine,
            tx,
            inbox: Inbox {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            },
            failure: Arc::new(parking_lot::Mutex::new(None)),
            step_timeout,
        }
    }

    /// Queue an inbound message for the next awaiting edge action.
    pub fn feed(&self, value: Value) {
        let _ = self.tx.send(value);
    }

    /// A sender half for wiring taps that feed the queue.
    pub fn sender(&self) -> mpsc::UnboundedSender<Value> {
        self.tx.clone()
    }

    /// A clonable handle for edge actions to await inbound data.
    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    /// The machine's current state.
    pub fn state(&self) -> &str {
        self.machine.current()
    }

    /// Subscribe to the underlying machine's notifications.
    pub fn watch(&mut self) -> mpsc::UnboundedReceiver<FsmEvent> {
        self.machine.watch()
    }

    /// The recorded failure message, if a step failed.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Register an edge. Failures from `action` are recorded and redirected
    /// to [`ERROR_STATE`]; both endpoints get an implicit escape edge there.
    pub fn add_path(&mut self, from: &str, to: &str, mut action: EdgeAction) {
        self.ensure_error_edge(from);
        self.ensure_error_edge(to);

        let failure = Arc::clone(&self.failure);
        let wrapped: EdgeAction = Box::new(move |step| {
            let failure = Arc::clone(&failure);
            let fut = action(step);
            Box::pin(async move {
                match fut.await {
                    Ok(flow) => Ok(flow),
                    Err(e) => {
                        debug!("handshake step failed: {e}");
                        *failure.lock() = Some(e.to_string());
                        Ok(Flow::goto(ERROR_STATE))
                    }
                }
            })
        });
        self.machine.add_path(from, to, wrapped);
    }

    fn ensure_error_edge(&mut self, state: &str) {
        if state != ERROR_STATE && state != END && !self.machine.has_path(state, ERROR_STATE) {
            self.machine.add_path(state, ERROR_STATE, goto(END));
        }
    }

    /// Drive the machine from `initial` until `END`, a failure, or a stalled
    /// timeout window. The watchdog is re-armed by any state change, so each
    /// step gets its own window.
    pub async fn run(&mut self, initial: &str) -> HandshakeStatus {
        let counter = self.machine.transition_counter();
        let window = self.step_timeout;

        let result = tokio::select! {
            res = self.machine.set_state(initial) => Some(res),
            () = watchdog(counter, window) => None,
        };

        match result {
            None => HandshakeStatus::Timeout,
            Some(res) => {
                if let Some(msg) = self.failure.lock().clone() {
                    return HandshakeStatus::Error(msg);
                }
                match res {
                    Ok(()) if self.machine.current() == END => HandshakeStatus::Ok,
                    Ok(()) => HandshakeStatus::Error(format!(
                        "handshake stalled in state {}",
                        self.machine.current()
                    )),
                    Err(e) => HandshakeStatus::Error(e.to_string()),
                }
            }
        }
    }
}

/// Resolves once a full window passes with no transitions.
async fn watchdog(counter: Arc<AtomicU64>, window: Duration) {
    let mut last = counter.load(Ordering::Relaxed);
    loop {
        tokio::time::sleep(window).await;
        let now = counter.load(Ordering::Relaxed);
        if now == last {
            return;
        }
        last = now;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
