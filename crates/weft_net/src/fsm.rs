//! Diagram-driven finite-state engine, independent of networking.
//!
//! A [`StateMachine`] holds a diagram of named states and edge actions.
//! `set_state` follows one edge; an action returning [`Flow::Goto`] chains
//! immediately into the next transition. Chaining runs as an explicit loop,
//! not recursion, so protocol logic expressed as auto-advancing edges keeps
//! a bounded stack. A rolling one-second window guards against accidental
//! synchronous self-loops.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::trace;

/// Reserved initial state.
pub const START: &str = "START";
/// Default end state.
pub const END: &str = "END";

/// Bounded diagnostic history length.
const HISTORY_CAP: usize = 32;

/// Transitions allowed within one rolling second before the storm guard trips.
const MAX_TRANSITIONS_PER_WINDOW: u32 = 1000;

/// State machine errors. Fatal unless the caller absorbs them.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    /// The requested transition is not in the diagram.
    #[error("undefined path {from} -> {to}")]
    UndefinedPath {
        /// State the machine was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// A transition landed in a state with no outgoing edges that is not
    /// the end state.
    #[error("no transitions defined out of state {state}")]
    UndefinedNext {
        /// The dead-end state.
        state: String,
    },

    /// More than the allowed number of transitions within one second.
    #[error("transition storm: {count} transitions within one second")]
    TransitionStorm {
        /// Transitions observed in the window.
        count: u32,
    },

    /// An edge action failed.
    #[error("{0}")]
    Action(String),
}

/// What an edge action asks the machine to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Stop after this transition.
    Stay,
    /// Chain immediately into another transition.
    Goto(String),
}

impl Flow {
    /// Convenience constructor for [`Flow::Goto`].
    pub fn goto(state: impl Into<String>) -> Self {
        Self::Goto(state.into())
    }
}

/// The states an edge action observes: the state just entered and the one
/// just left.
#[derive(Debug, Clone)]
pub struct Step {
    /// State the machine just transitioned into.
    pub current: String,
    /// State the machine just left.
    pub previous: String,
}

/// Future returned by an edge action.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<Flow, FsmError>> + Send>>;

/// An edge action: runs on every traversal of its edge.
pub type EdgeAction = Box<dyn FnMut(Step) -> ActionFuture + Send>;

/// Notifications delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    /// A transition completed.
    StateChange {
        /// State left.
        from: String,
        /// State entered.
        to: String,
    },
    /// A transition was requested that is not in the diagram.
    UndefinedPath {
        /// State the machine was in.
        from: String,
        /// State that was requested.
        to: String,
    },
    /// The machine landed in a dead-end state.
    UndefinedNext {
        /// The dead-end state.
        state: String,
    },
    /// The machine reached the end state.
    End,
}

/// A diagram-driven finite-state machine.
pub struct StateMachine {
    diagram: HashMap<String, HashMap<String, EdgeAction>>,
    current: String,
    previous: String,
    end_state: String,
    history: VecDeque<String>,
    watchers: Vec<mpsc::UnboundedSender<FsmEvent>>,
    transitions: Arc<AtomicU64>,
    window_start: Instant,
    window_count: u32,
}

impl StateMachine {
    /// Create a machine in [`START`] with the default [`END`] end state.
    pub fn new() -> Self {
        Self::with_end_state(END)
    }

    /// Create a machine with a custom end state.
    pub fn with_end_state(end_state: impl Into<String>) -> Self {
        Self {
            diagram: HashMap::new(),
            current: START.to_string(),
            previous: START.to_string(),
            end_state: end_state.into(),
            history: VecDeque::new(),
            watchers: Vec::new(),
            transitions: Arc::new(AtomicU64::new(0)),
            window_start: Instant::now(),
            window_count: 0,
        }
    }

    /// The current state name.
    pub fn current(&self) -> &str {
        &self.current
    }

    /// The previous state name.
    pub fn previous(&self) -> &str {
        &self.previous
    }

    /// The bounded transition history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    /// Subscribe to machine notifications.
    pub fn watch(&mut self) -> mpsc::UnboundedReceiver<FsmEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.push(tx);
        rx
    }

    /// Shared counter of completed transitions, for external watchdogs.
    pub fn transition_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.transitions)
    }

    /// Register a transition in the diagram.
    pub fn add_path(&mut self, from: impl Into<String>, to: impl Into<String>, action: EdgeAction) {
        self.diagram
            .entry(from.into())
            .or_default()
            .insert(to.into(), action);
    }

    /// Whether a transition is registered.
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        self.diagram
            .get(from)
            .is_some_and(|m| m.contains_key(to))
    }

    /// Transition to `to`, running the edge action and chaining as long as
    /// actions return [`Flow::Goto`].
    pub async fn set_state(&mut self, to: &str) -> Result<(), FsmError> {
        let mut next = to.to_string();
        loop {
            self.guard_storm()?;

            let from = self.current.clone();
            if !self.has_path(&from, &next) {
                self.emit(FsmEvent::UndefinedPath {
                    from: from.clone(),
                    to: next.clone(),
                });
                return Err(FsmError::UndefinedPath { from, to: next });
            }

            self.previous = from.clone();
            self.current = next.clone();
            self.history.push_back(next.clone());
            if self.history.len() > HISTORY_CAP {
                self.history.pop_front();
            }
            self.transitions.fetch_add(1, Ordering::Relaxed);
            self.emit(FsmEvent::StateChange {
                from: from.clone(),
                to: next.clone(),
            });
            trace!("fsm: {from} -> {next}");

            let step = Step {
                current: next.clone(),
                previous: from.clone(),
            };
            let fut = {
                let action = self
                    .diagram
                    .get_mut(&from)
                    .and_then(|m| m.get_mut(&next))
                    .expect("path existence checked above");
                action(step)
            };
            let flow = fut.await?;

            if self.current == self.end_state {
                self.emit(FsmEvent::End);
                return Ok(());
            }

            match flow {
                Flow::Goto(n) => next = n,
                Flow::Stay => {
                    if self.diagram.get(&self.current).is_none_or(HashMap::is_empty) {
                        self.emit(FsmEvent::UndefinedNext {
                            state: self.current.clone(),
                        });
                        return Err(FsmError::UndefinedNext {
                            state: self.current.clone(),
                        });
                    }
                    return Ok(());
                }
            }
        }
    }

    fn guard_storm(&mut self) -> Result<(), FsmError> {
        let now = Instant::now();
        if now.duration_since(self.window_start) > Duration::from_secs(1) {
            self.window_start = now;
            self.window_count = 0;
        }
        self.window_count += 1;
        if self.window_count > MAX_TRANSITIONS_PER_WINDOW {
            return Err(FsmError::TransitionStorm {
                count: self.window_count,
            });
        }
        Ok(())
    }

    fn emit(&mut self, event: FsmEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// A trivial edge action that stops after the transition.
pub fn stay() -> EdgeAction {
    Box::new(|_| Box::pin(async { Ok(Flow::Stay) }))
}

/// A trivial edge action that chains into `state`.
pub fn goto(state: &'static str) -> EdgeAction {
    Box::new(move |_| Box::pin(async move { Ok(Flow::goto(state)) }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
